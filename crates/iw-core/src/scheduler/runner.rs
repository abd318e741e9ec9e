//! Periodic full and incremental discovery.

use super::types::{
    JobStats, RunResult, ScanJob, ScanOutcome, SchedulerConfig, SchedulerIntervals,
    SchedulerResult, SubscriptionFailure,
};
use crate::cache::TwoTierCache;
use crate::discovery::{DiscoveryEngine, DiscoveryResult};
use crate::models::{ChangeSet, ResourceDocument};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use iw_connectors::store::RESOURCES_CONTAINER;
use iw_connectors::DocumentStore;
use iw_observability::metrics::record_scan;
use iw_policy::{Feature, RolloutController};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use tokio::sync::{watch, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn, Instrument};
use uuid::Uuid;

/// Last-scan state kept per subscription for delta detection.
#[derive(Debug, Clone)]
struct SubscriptionState {
    last_scan: DateTime<Utc>,
    /// Keyed by lower-cased id.
    resources: HashMap<String, ResourceDocument>,
}

impl SubscriptionState {
    fn new(last_scan: DateTime<Utc>, documents: Vec<ResourceDocument>) -> Self {
        Self {
            last_scan,
            resources: documents
                .into_iter()
                .map(|d| (d.id.to_lowercase(), d))
                .collect(),
        }
    }

    fn ids(&self) -> HashSet<String> {
        self.resources.values().map(|d| d.id.clone()).collect()
    }

    fn types(&self) -> BTreeSet<String> {
        self.resources
            .values()
            .map(|d| d.resource_type.clone())
            .collect()
    }

    /// Documents of one type, ordered by id.
    fn group(&self, resource_type: &str) -> Vec<ResourceDocument> {
        let mut docs: Vec<ResourceDocument> = self
            .resources
            .values()
            .filter(|d| d.resource_type == resource_type)
            .cloned()
            .collect();
        docs.sort_by(|a, b| a.id.cmp(&b.id));
        docs
    }

    /// Applies a change set and returns the resource types it touched.
    fn apply(&mut self, changes: &ChangeSet) -> BTreeSet<String> {
        let mut touched = BTreeSet::new();
        for record in changes.upserts() {
            let key = record.resource.id.to_lowercase();
            if let Some(previous) = self.resources.get(&key) {
                touched.insert(previous.resource_type.clone());
            }
            touched.insert(record.resource.resource_type.clone());
            self.resources.insert(key, record.resource.clone());
        }
        for record in &changes.deleted {
            let removed = self.resources.remove(&record.resource.id.to_lowercase());
            let resource_type = removed
                .map(|d| d.resource_type)
                .unwrap_or_else(|| record.resource.resource_type.clone());
            touched.insert(resource_type);
        }
        touched
    }
}

/// Clears a job's running flag when dropped.
struct RunningGuard<'a>(&'a AtomicBool);

impl<'a> RunningGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| RunningGuard(flag))
    }
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Runs discovery on a schedule and keeps the cache current.
///
/// Owns the last-scan time and the previously seen resources of every
/// subscription. Each job is non-re-entrant on its own but independent of the
/// other one.
pub struct DiscoveryScheduler {
    engine: Arc<DiscoveryEngine>,
    cache: Arc<TwoTierCache>,
    rollout: Arc<RolloutController>,
    store: Option<Arc<dyn DocumentStore>>,
    config: SchedulerConfig,
    state: RwLock<BTreeMap<String, SubscriptionState>>,
    full_running: AtomicBool,
    incremental_running: AtomicBool,
    full_stats: Mutex<JobStats>,
    incremental_stats: Mutex<JobStats>,
}

impl DiscoveryScheduler {
    pub fn new(
        engine: Arc<DiscoveryEngine>,
        cache: Arc<TwoTierCache>,
        rollout: Arc<RolloutController>,
    ) -> Self {
        Self {
            engine,
            cache,
            rollout,
            store: None,
            config: SchedulerConfig::default(),
            state: RwLock::new(BTreeMap::new()),
            full_running: AtomicBool::new(false),
            incremental_running: AtomicBool::new(false),
            full_stats: Mutex::new(JobStats::default()),
            incremental_stats: Mutex::new(JobStats::default()),
        }
    }

    /// Persists discovered documents to the `resources` container.
    pub fn with_store(mut self, store: Arc<dyn DocumentStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn is_running(&self, job: ScanJob) -> bool {
        self.running_flag(job).load(Ordering::SeqCst)
    }

    pub fn stats(&self, job: ScanJob) -> JobStats {
        self.stats_slot(job)
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Time of the last successful scan of a subscription.
    pub async fn last_scan_time(&self, subscription_id: &str) -> Option<DateTime<Utc>> {
        self.state
            .read()
            .await
            .get(subscription_id)
            .map(|s| s.last_scan)
    }

    /// Ids seen in the last scan of a subscription.
    pub async fn known_ids(&self, subscription_id: &str) -> HashSet<String> {
        self.state
            .read()
            .await
            .get(subscription_id)
            .map(SubscriptionState::ids)
            .unwrap_or_default()
    }

    /// Discovers every resource in every enabled subscription.
    #[instrument(skip(self))]
    pub async fn full_refresh(&self) -> SchedulerResult<ScanOutcome> {
        let Some(_guard) = RunningGuard::acquire(&self.full_running) else {
            debug!("Full refresh already running, skipping");
            return Ok(ScanOutcome::Skipped);
        };
        let job = ScanJob::FullRefresh;
        let started = Instant::now();
        let started_at = Utc::now();

        let subscriptions = match self.engine.list_subscriptions().await {
            Ok(subs) => subs,
            Err(e) => {
                self.finish_failed(job, started, &e.to_string());
                return Err(e.into());
            }
        };
        let targets: Vec<String> = subscriptions
            .into_iter()
            .filter(|s| {
                if !s.is_enabled() {
                    debug!(subscription_id = %s.subscription_id, state = %s.state, "Skipping subscription");
                }
                s.is_enabled()
            })
            .map(|s| s.subscription_id)
            .collect();

        let results = self
            .fan_out(job, &targets, |engine, sub| async move {
                engine.full_discovery(&sub, None).await
            })
            .await;

        let mut errors = Vec::new();
        let mut resource_count = 0;
        for (subscription_id, result) in results {
            match result {
                Ok(documents) => {
                    resource_count += documents.len();
                    self.replace_subscription(&subscription_id, started_at, documents)
                        .await;
                }
                Err(e) => errors.push(SubscriptionFailure {
                    subscription_id,
                    message: e.to_string(),
                }),
            }
        }

        let result = RunResult {
            run_id: Uuid::new_v4(),
            job,
            subscriptions_scanned: targets.len(),
            resource_count,
            errors,
            started_at,
            duration_ms: started.elapsed().as_millis() as u64,
        };
        self.finish(&result, started);
        Ok(ScanOutcome::Completed(result))
    }

    /// Applies changes since the last scan of every known subscription, or
    /// runs a full refresh when nothing has been scanned yet.
    #[instrument(skip(self))]
    pub async fn incremental_refresh(&self) -> SchedulerResult<ScanOutcome> {
        let guard = match RunningGuard::acquire(&self.incremental_running) {
            Some(guard) => guard,
            None => {
                debug!("Incremental refresh already running, skipping");
                return Ok(ScanOutcome::Skipped);
            }
        };

        let snapshot: Vec<(String, DateTime<Utc>, HashSet<String>)> = self
            .state
            .read()
            .await
            .iter()
            .map(|(sub, state)| (sub.clone(), state.last_scan, state.ids()))
            .collect();

        if snapshot.is_empty() {
            drop(guard);
            info!("No prior scan, running full refresh");
            return self.full_refresh().await;
        }

        let job = ScanJob::IncrementalRefresh;
        let started = Instant::now();
        let started_at = Utc::now();
        let targets: Vec<String> = snapshot.iter().map(|(sub, _, _)| sub.clone()).collect();
        let inputs: Arc<HashMap<String, (DateTime<Utc>, HashSet<String>)>> = Arc::new(
            snapshot
                .into_iter()
                .map(|(sub, last, ids)| (sub, (last, ids)))
                .collect(),
        );

        let results = self
            .fan_out(job, &targets, |engine, sub| {
                let inputs = Arc::clone(&inputs);
                async move {
                    let (last_scan, ids) = inputs
                        .get(&sub)
                        .cloned()
                        .unwrap_or_else(|| (Utc::now(), HashSet::new()));
                    engine.incremental_discovery(&sub, last_scan, Some(&ids)).await
                }
            })
            .await;

        let mut errors = Vec::new();
        let mut resource_count = 0;
        for (subscription_id, result) in results {
            match result {
                Ok(changes) => {
                    resource_count += changes.len();
                    self.apply_changes(&subscription_id, started_at, changes).await;
                }
                Err(e) => errors.push(SubscriptionFailure {
                    subscription_id,
                    message: e.to_string(),
                }),
            }
        }

        let result = RunResult {
            run_id: Uuid::new_v4(),
            job,
            subscriptions_scanned: targets.len(),
            resource_count,
            errors,
            started_at,
            duration_ms: started.elapsed().as_millis() as u64,
        };
        self.finish(&result, started);
        Ok(ScanOutcome::Completed(result))
    }

    /// Runs `scan` for every subscription, at most `max_concurrent_scans` at once.
    async fn fan_out<T, F, Fut>(
        &self,
        job: ScanJob,
        subscriptions: &[String],
        scan: F,
    ) -> Vec<(String, DiscoveryResult<T>)>
    where
        F: Fn(Arc<DiscoveryEngine>, String) -> Fut,
        Fut: Future<Output = DiscoveryResult<T>>,
    {
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_scans.max(1)));
        let scans = subscriptions.iter().map(|sub| {
            let semaphore = Arc::clone(&semaphore);
            let scan = scan(Arc::clone(&self.engine), sub.clone());
            let span = iw_observability::scan_span!(job.as_str(), sub);
            async move {
                let _permit = semaphore.acquire_owned().await.ok();
                (sub.clone(), scan.await)
            }
            .instrument(span)
        });
        join_all(scans).await
    }

    async fn replace_subscription(
        &self,
        subscription_id: &str,
        scanned_at: DateTime<Utc>,
        documents: Vec<ResourceDocument>,
    ) {
        let fresh = SubscriptionState::new(scanned_at, documents);
        let previous_types = self
            .state
            .read()
            .await
            .get(subscription_id)
            .map(SubscriptionState::types)
            .unwrap_or_default();

        // Types that vanished are cached as empty so stale L2 entries are overwritten.
        let types: BTreeSet<String> = fresh.types().union(&previous_types).cloned().collect();
        for resource_type in &types {
            self.cache
                .set(subscription_id, resource_type, fresh.group(resource_type))
                .await;
        }

        if let Some(store) = &self.store {
            for document in fresh.resources.values() {
                persist(store.as_ref(), document).await;
            }
        }

        self.state
            .write()
            .await
            .insert(subscription_id.to_string(), fresh);
    }

    async fn apply_changes(
        &self,
        subscription_id: &str,
        scanned_at: DateTime<Utc>,
        changes: ChangeSet,
    ) {
        let updated = {
            let mut state = self.state.write().await;
            let Some(entry) = state.get_mut(subscription_id) else {
                return;
            };
            let touched = entry.apply(&changes);
            entry.last_scan = scanned_at;
            touched
                .into_iter()
                .map(|t| {
                    let docs = entry.group(&t);
                    (t, docs)
                })
                .collect::<Vec<_>>()
        };

        for (resource_type, documents) in updated {
            self.cache.set(subscription_id, &resource_type, documents).await;
        }

        if let Some(store) = &self.store {
            for record in changes.upserts() {
                persist(store.as_ref(), &record.resource).await;
            }
            for record in &changes.deleted {
                let resource = &record.resource;
                if let Err(e) = store
                    .delete(RESOURCES_CONTAINER, &resource.partition_key, &resource.id)
                    .await
                {
                    warn!(resource_id = %resource.id, error = %e, "Failed to delete stored resource");
                }
            }
        }
    }

    fn running_flag(&self, job: ScanJob) -> &AtomicBool {
        match job {
            ScanJob::FullRefresh => &self.full_running,
            ScanJob::IncrementalRefresh => &self.incremental_running,
        }
    }

    fn stats_slot(&self, job: ScanJob) -> &Mutex<JobStats> {
        match job {
            ScanJob::FullRefresh => &self.full_stats,
            ScanJob::IncrementalRefresh => &self.incremental_stats,
        }
    }

    fn finish(&self, result: &RunResult, started: Instant) {
        let elapsed = started.elapsed();
        let last_error = result
            .errors
            .first()
            .map(|f| format!("{}: {}", f.subscription_id, f.message));
        {
            let mut stats = self
                .stats_slot(result.job)
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            stats.runs += 1;
            stats.last_resource_count = result.resource_count;
            stats.last_run_at = Some(result.started_at);
            stats.last_duration_ms = elapsed.as_millis() as u64;
            if !result.succeeded() {
                stats.failures += 1;
                stats.last_error = last_error;
            }
        }
        record_scan(result.job.as_str(), result.succeeded(), elapsed);

        if result.succeeded() {
            info!(
                run_id = %result.run_id,
                job = %result.job,
                subscriptions = result.subscriptions_scanned,
                resources = result.resource_count,
                duration_ms = result.duration_ms,
                "Scan complete"
            );
        } else {
            warn!(
                run_id = %result.run_id,
                job = %result.job,
                subscriptions = result.subscriptions_scanned,
                failed = result.errors.len(),
                "Scan completed with failures"
            );
        }
    }

    fn finish_failed(&self, job: ScanJob, started: Instant, message: &str) {
        let elapsed = started.elapsed();
        {
            let mut stats = self
                .stats_slot(job)
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            stats.runs += 1;
            stats.failures += 1;
            stats.last_resource_count = 0;
            stats.last_run_at = Some(Utc::now());
            stats.last_duration_ms = elapsed.as_millis() as u64;
            stats.last_error = Some(message.to_string());
        }
        record_scan(job.as_str(), false, elapsed);
        error!(job = %job, error = %message, "Scan failed");
    }

    /// Spawns both jobs on their intervals. Ticks are skipped while the
    /// discovery feature is unavailable.
    pub fn start(self: &Arc<Self>, intervals: SchedulerIntervals) -> SchedulerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let full = self.spawn_loop(ScanJob::FullRefresh, intervals.full, shutdown_rx.clone());
        let incremental =
            self.spawn_loop(ScanJob::IncrementalRefresh, intervals.incremental, shutdown_rx);
        info!(
            full_secs = intervals.full.as_secs(),
            incremental_secs = intervals.incremental.as_secs(),
            "Scheduler started"
        );
        SchedulerHandle {
            shutdown_tx,
            tasks: vec![full, incremental],
        }
    }

    fn spawn_loop(
        self: &Arc<Self>,
        job: ScanJob,
        period: std::time::Duration,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if !scheduler.rollout.is_available(Feature::Discovery) {
                            debug!(job = %job, "Discovery unavailable, skipping tick");
                            continue;
                        }
                        let outcome = match job {
                            ScanJob::FullRefresh => scheduler.full_refresh().await,
                            ScanJob::IncrementalRefresh => scheduler.incremental_refresh().await,
                        };
                        match outcome {
                            Ok(ScanOutcome::Completed(result)) if result.succeeded() => {
                                scheduler.rollout.record_success(Feature::Discovery);
                            }
                            Ok(ScanOutcome::Completed(result)) => {
                                let reason = format!("{} subscription scans failed", result.errors.len());
                                scheduler.rollout.record_failure(Feature::Discovery, &reason);
                            }
                            Ok(ScanOutcome::Skipped) => {}
                            Err(e) => {
                                scheduler.rollout.record_failure(Feature::Discovery, &e.to_string());
                            }
                        }
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            debug!(job = %job, "Scheduler loop shutting down");
                            break;
                        }
                    }
                }
            }
        })
    }
}

async fn persist(store: &dyn DocumentStore, document: &ResourceDocument) {
    let body = match document.to_value() {
        Ok(body) => body,
        Err(e) => {
            warn!(resource_id = %document.id, error = %e, "Failed to serialise resource");
            return;
        }
    };
    if let Err(e) = store.upsert(RESOURCES_CONTAINER, body).await {
        warn!(resource_id = %document.id, error = %e, "Failed to persist resource");
    }
}

/// Stops the background loops.
pub struct SchedulerHandle {
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl SchedulerHandle {
    /// Signals shutdown and waits for both loops to exit.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Scheduler task ended abnormally");
            }
        }
        info!("Scheduler stopped");
    }
}
