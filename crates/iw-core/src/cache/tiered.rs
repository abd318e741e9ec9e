//! L1 + L2 cache of resource listings.

use super::error::CacheResult;
use super::memory::{MemoryTier, DEFAULT_L1_CAPACITY};
use super::ttl::TtlPolicy;
use super::types::{cache_key, hit_rate, CacheFilters, CacheStatistics, L2CacheDocument, Tier};
use crate::models::ResourceDocument;
use chrono::{Duration as ChronoDuration, Utc};
use futures::future::join_all;
use iw_connectors::store::{DocumentQuery, CACHE_CONTAINER};
use iw_connectors::DocumentStore;
use iw_observability::metrics::{
    record_cache_l2_error, record_cache_lookup, record_cache_write, record_l1_entries,
};
use iw_observability::CacheTier;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// Two-tier cache of resource listings keyed by (subscription, type, filters).
///
/// L1 is an in-process map; L2 is an optional document store shared between
/// processes. A lookup increments exactly one of the hit/miss counters.
/// L2 failures never surface: reads degrade to misses and writes are logged.
pub struct TwoTierCache {
    l1: MemoryTier,
    store: Option<Arc<dyn DocumentStore>>,
    container: String,
    ttl: TtlPolicy,
    hits_l1: AtomicU64,
    hits_l2: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
}

impl TwoTierCache {
    /// Creates an L1-only cache.
    pub fn new(ttl: TtlPolicy, l1_capacity: usize) -> Self {
        Self {
            l1: MemoryTier::new(l1_capacity),
            store: None,
            container: CACHE_CONTAINER.to_string(),
            ttl,
            hits_l1: AtomicU64::new(0),
            hits_l2: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        }
    }

    /// Adds an L2 store.
    pub fn with_store(mut self, store: Arc<dyn DocumentStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Overrides the L2 container name.
    pub fn with_container(mut self, container: impl Into<String>) -> Self {
        self.container = container.into();
        self
    }

    /// Retention policy applied to both tiers.
    pub fn ttl_policy(&self) -> &TtlPolicy {
        &self.ttl
    }

    /// Whether an L2 store is attached.
    pub fn l2_enabled(&self) -> bool {
        self.store.is_some()
    }

    /// Looks up a listing: L1, then L2 (promoting hits into L1).
    #[instrument(skip(self, filters))]
    pub async fn get(
        &self,
        subscription_id: &str,
        resource_type: &str,
        filters: Option<&CacheFilters>,
    ) -> Option<Vec<ResourceDocument>> {
        let key = cache_key(subscription_id, resource_type, filters);

        if let Some(documents) = self.l1.get(&key).await {
            self.hits_l1.fetch_add(1, Ordering::Relaxed);
            record_cache_lookup(CacheTier::L1);
            debug!(items = documents.len(), "L1 hit");
            return Some(documents);
        }

        match self.read_l2(subscription_id, &key).await {
            Ok(Some(l2)) => {
                self.hits_l2.fetch_add(1, Ordering::Relaxed);
                record_cache_lookup(CacheTier::L2);
                debug!(items = l2.documents.len(), "L2 hit, promoting to L1");
                // A promoted entry never outlives its L2 source.
                let remaining = (l2.expires_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                self.l1
                    .insert(
                        key,
                        &l2.subscription_id,
                        &l2.resource_type,
                        l2.filters,
                        l2.documents.clone(),
                        self.ttl.l1_ttl(resource_type).min(remaining),
                        Tier::L2,
                    )
                    .await;
                Some(l2.documents)
            }
            Ok(None) => {
                self.record_miss();
                None
            }
            Err(e) => {
                warn!(error = %e, "L2 read failed, treating as miss");
                record_cache_l2_error("read");
                self.record_miss();
                None
            }
        }
    }

    fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
        record_cache_lookup(CacheTier::Miss);
    }

    async fn read_l2(
        &self,
        subscription_id: &str,
        key: &str,
    ) -> CacheResult<Option<L2CacheDocument>> {
        let Some(store) = &self.store else {
            return Ok(None);
        };
        let Some(stored) = store.read(&self.container, subscription_id, key).await? else {
            return Ok(None);
        };
        let document: L2CacheDocument = serde_json::from_value(stored.body)?;
        if document.expires_at <= Utc::now() {
            return Ok(None);
        }
        Ok(Some(document))
    }

    /// Looks up the same type across several subscriptions concurrently.
    pub async fn get_multi(
        &self,
        subscription_ids: &[String],
        resource_type: &str,
    ) -> HashMap<String, Option<Vec<ResourceDocument>>> {
        let lookups = subscription_ids.iter().map(|sub| async move {
            (sub.clone(), self.get(sub, resource_type, None).await)
        });
        join_all(lookups).await.into_iter().collect()
    }

    /// Caches an unfiltered listing.
    pub async fn set(
        &self,
        subscription_id: &str,
        resource_type: &str,
        documents: Vec<ResourceDocument>,
    ) {
        self.set_with_filters(subscription_id, resource_type, None, documents)
            .await
    }

    /// Caches a listing under a filter set. Tags are redacted before either
    /// tier sees the documents.
    #[instrument(skip(self, filters, documents), fields(items = documents.len()))]
    pub async fn set_with_filters(
        &self,
        subscription_id: &str,
        resource_type: &str,
        filters: Option<&CacheFilters>,
        mut documents: Vec<ResourceDocument>,
    ) {
        for document in &mut documents {
            document.redact();
        }

        let key = cache_key(subscription_id, resource_type, filters);
        let item_count = documents.len();
        self.l1
            .insert(
                key.clone(),
                subscription_id,
                resource_type,
                filters.cloned(),
                documents.clone(),
                self.ttl.l1_ttl(resource_type),
                Tier::L1,
            )
            .await;

        if let Err(e) = self
            .write_l2(subscription_id, resource_type, filters, key, documents)
            .await
        {
            warn!(error = %e, "L2 write failed, entry cached in L1 only");
            record_cache_l2_error("write");
        }

        self.writes.fetch_add(1, Ordering::Relaxed);
        record_cache_write(resource_type, item_count);
        record_l1_entries(self.l1.len().await);
    }

    async fn write_l2(
        &self,
        subscription_id: &str,
        resource_type: &str,
        filters: Option<&CacheFilters>,
        key: String,
        documents: Vec<ResourceDocument>,
    ) -> CacheResult<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let ttl = self.ttl.l2_ttl(resource_type);
        let now = Utc::now();
        let document = L2CacheDocument {
            id: key,
            partition_key: subscription_id.to_string(),
            subscription_id: subscription_id.to_string(),
            resource_type: resource_type.to_lowercase(),
            filters: filters.cloned(),
            item_count: documents.len(),
            documents,
            cached_at: now,
            expires_at: now + ChronoDuration::from_std(ttl).unwrap_or_else(|_| ChronoDuration::zero()),
            ttl: ttl.as_secs() as i64,
        };
        store
            .upsert(&self.container, serde_json::to_value(&document)?)
            .await?;
        Ok(())
    }

    /// Drops L1 entries for a subscription (optionally one type). L2 entries
    /// are left to expire.
    pub async fn invalidate(&self, subscription_id: &str, resource_type: Option<&str>) -> usize {
        let removed = self.l1.invalidate(subscription_id, resource_type).await;
        debug!(subscription_id, ?resource_type, removed, "Invalidated L1 entries");
        removed
    }

    /// Drops every L1 entry.
    pub async fn clear_all(&self) -> usize {
        self.l1.clear().await
    }

    /// Removes expired L1 entries.
    pub async fn purge_expired(&self) -> usize {
        self.l1.purge_expired().await
    }

    /// Live cached documents matching `predicate`, deduplicated by id.
    ///
    /// L1 is searched first. When it has no match the unexpired L2 listings
    /// are searched, so a lookup still sees data whose L1 copy has expired.
    /// An L2 failure is logged and treated as no match.
    pub async fn find_documents<F>(&self, predicate: F) -> Vec<ResourceDocument>
    where
        F: Fn(&ResourceDocument) -> bool,
    {
        let l1: Vec<ResourceDocument> = self
            .l1
            .live_documents()
            .await
            .into_iter()
            .filter(|d| predicate(d))
            .collect();
        if !l1.is_empty() || self.store.is_none() {
            return l1;
        }

        match self.l2_documents().await {
            Ok(documents) => documents.into_iter().filter(|d| predicate(d)).collect(),
            Err(e) => {
                warn!(error = %e, "L2 scan failed, searching L1 only");
                record_cache_l2_error("read");
                Vec::new()
            }
        }
    }

    /// Documents from every unexpired L2 listing, deduplicated by id.
    async fn l2_documents(&self) -> CacheResult<Vec<ResourceDocument>> {
        let Some(store) = &self.store else {
            return Ok(Vec::new());
        };
        let now = Utc::now();
        let mut query = DocumentQuery::new("SELECT * FROM c");
        let mut seen = HashSet::new();
        let mut documents = Vec::new();
        loop {
            let page = store.query(&self.container, &query).await?;
            for body in page.documents {
                let listing: L2CacheDocument = serde_json::from_value(body)?;
                if listing.expires_at <= now {
                    continue;
                }
                documents.extend(
                    listing
                        .documents
                        .into_iter()
                        .filter(|d| seen.insert(d.id.to_lowercase())),
                );
            }
            match page.continuation {
                Some(token) => query.continuation = Some(token),
                None => break,
            }
        }
        Ok(documents)
    }

    /// Lookup counters, hit rate and L1 occupancy.
    pub async fn statistics(&self) -> CacheStatistics {
        let hits_l1 = self.hits_l1.load(Ordering::Relaxed);
        let hits_l2 = self.hits_l2.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        CacheStatistics {
            hits_l1,
            hits_l2,
            misses,
            writes: self.writes.load(Ordering::Relaxed),
            hit_rate: hit_rate(hits_l1 + hits_l2, misses),
            ttl_overrides: self.ttl.overrides(),
            l1_entries: self.l1.len().await,
            l2_enabled: self.l2_enabled(),
        }
    }
}

impl Default for TwoTierCache {
    fn default() -> Self {
        Self::new(TtlPolicy::default(), DEFAULT_L1_CAPACITY)
    }
}
