//! Staged rollout controller with per-feature circuit breakers.
//!
//! Each feature carries an enabled flag and call counters. Once a feature
//! has seen `min_calls` outcomes and its error rate exceeds the threshold
//! its circuit opens and it is reported unavailable until the cooldown
//! elapses. Every transition is appended to a per-feature audit ring and
//! broadcast to subscribers.

use crate::feature::{Feature, RolloutError, RolloutStage};
use chrono::{DateTime, Utc};
use iw_observability::metrics::record_circuit_open;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

/// Audit entries kept per feature.
pub const MAX_STATE_CHANGES: usize = 10;

/// Rollout controller configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RolloutConfig {
    /// Stage applied at construction.
    pub stage: RolloutStage,
    /// Explicit per-feature flags applied after the stage.
    pub overrides: BTreeMap<Feature, bool>,
    /// Error rate above which a circuit opens.
    pub error_rate_threshold: f64,
    /// Calls required before the error rate is evaluated.
    pub min_calls: u64,
    /// Time an open circuit stays open, in seconds.
    pub cooldown_secs: u64,
}

impl Default for RolloutConfig {
    fn default() -> Self {
        Self {
            stage: RolloutStage::MIN,
            overrides: BTreeMap::new(),
            error_rate_threshold: 0.05,
            min_calls: 10,
            cooldown_secs: 300,
        }
    }
}

impl RolloutConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

/// Externally visible condition of a feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureCondition {
    Enabled,
    Disabled,
    CircuitOpen,
}

/// One audit entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateChange {
    pub old: FeatureCondition,
    pub new: FeatureCondition,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

/// Mutable per-feature state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FeatureState {
    pub enabled: bool,
    pub circuit_open: bool,
    pub successes: u64,
    pub failures: u64,
    pub total_calls: u64,
    pub last_failure_time: Option<DateTime<Utc>>,
    pub circuit_opened_at: Option<DateTime<Utc>>,
    pub state_changes: VecDeque<StateChange>,
}

impl FeatureState {
    pub fn condition(&self) -> FeatureCondition {
        if !self.enabled {
            FeatureCondition::Disabled
        } else if self.circuit_open {
            FeatureCondition::CircuitOpen
        } else {
            FeatureCondition::Enabled
        }
    }

    pub fn error_rate(&self) -> f64 {
        if self.total_calls == 0 {
            0.0
        } else {
            self.failures as f64 / self.total_calls as f64
        }
    }

    fn reset_counters(&mut self) {
        self.successes = 0;
        self.failures = 0;
        self.total_calls = 0;
        self.last_failure_time = None;
    }

    /// Appends an audit entry if the condition changed.
    fn record_transition(&mut self, old: FeatureCondition, reason: &str, now: DateTime<Utc>) {
        let new = self.condition();
        if old == new {
            return;
        }
        if self.state_changes.len() == MAX_STATE_CHANGES {
            self.state_changes.pop_front();
        }
        self.state_changes.push_back(StateChange {
            old,
            new,
            reason: reason.to_string(),
            timestamp: now,
        });
    }
}

/// Snapshot of one feature.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureStatus {
    pub feature: Feature,
    pub available: bool,
    pub error_rate: f64,
    #[serde(flatten)]
    pub state: FeatureState,
}

/// Snapshot of the whole controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RolloutStatus {
    pub stage: RolloutStage,
    pub error_rate_threshold: f64,
    pub min_calls: u64,
    pub cooldown_secs: u64,
    pub features: Vec<FeatureStatus>,
}

/// Events emitted by the rollout controller.
#[derive(Debug, Clone, PartialEq)]
pub enum RolloutEvent {
    FeatureEnabled {
        feature: Feature,
        reason: String,
        at: DateTime<Utc>,
    },
    FeatureDisabled {
        feature: Feature,
        reason: String,
        at: DateTime<Utc>,
    },
    CircuitOpened {
        feature: Feature,
        error_rate: f64,
        at: DateTime<Utc>,
    },
    CircuitClosed {
        feature: Feature,
        at: DateTime<Utc>,
    },
    StageChanged {
        stage: RolloutStage,
        at: DateTime<Utc>,
    },
}

/// Staged rollout controller.
///
/// Shared behind an `Arc`; every method takes `&self`.
pub struct RolloutController {
    config: RolloutConfig,
    stage: Mutex<RolloutStage>,
    features: HashMap<Feature, Mutex<FeatureState>>,
    sender: broadcast::Sender<RolloutEvent>,
}

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl RolloutController {
    /// Creates a controller at the configured stage with overrides applied.
    pub fn new(config: RolloutConfig) -> Self {
        let (sender, _) = broadcast::channel(64);
        let features = Feature::ALL
            .into_iter()
            .map(|f| {
                let state = FeatureState {
                    enabled: config.overrides.get(&f).copied().unwrap_or_else(|| config.stage.includes(f)),
                    ..Default::default()
                };
                (f, Mutex::new(state))
            })
            .collect();

        info!(
            stage = config.stage.number(),
            overrides = config.overrides.len(),
            "Rollout controller initialised"
        );

        Self {
            stage: Mutex::new(config.stage),
            config,
            features,
            sender,
        }
    }

    pub fn config(&self) -> &RolloutConfig {
        &self.config
    }

    fn state(&self, feature: Feature) -> &Mutex<FeatureState> {
        // Every variant is inserted in `new`.
        &self.features[&feature]
    }

    fn emit(&self, event: RolloutEvent) {
        // Ignore send errors (no receivers)
        let _ = self.sender.send(event);
    }

    /// Whether a feature may be used right now.
    ///
    /// An open circuit whose cooldown has elapsed is closed here, with its
    /// counters reset.
    pub fn is_available(&self, feature: Feature) -> bool {
        let now = Utc::now();
        let closed = {
            let mut state = guard(self.state(feature));
            if !state.enabled {
                return false;
            }
            if !state.circuit_open {
                return true;
            }
            let elapsed = state
                .circuit_opened_at
                .map(|at| now.signed_duration_since(at))
                .and_then(|d| d.to_std().ok())
                .unwrap_or(Duration::ZERO);
            if elapsed < self.config.cooldown() {
                return false;
            }
            let old = state.condition();
            state.circuit_open = false;
            state.circuit_opened_at = None;
            state.reset_counters();
            state.record_transition(old, "cooldown elapsed", now);
            true
        };

        if closed {
            info!(feature = %feature, "Circuit closed after cooldown");
            self.emit(RolloutEvent::CircuitClosed { feature, at: now });
        }
        closed
    }

    /// Records a successful call.
    pub fn record_success(&self, feature: Feature) {
        let mut state = guard(self.state(feature));
        state.successes += 1;
        state.total_calls += 1;
        let opened = self.evaluate(&mut state, "error rate exceeded");
        drop(state);
        if let Some(rate) = opened {
            self.on_circuit_opened(feature, rate, "error rate exceeded");
        }
    }

    /// Records a failed call.
    pub fn record_failure(&self, feature: Feature, reason: &str) {
        let mut state = guard(self.state(feature));
        state.failures += 1;
        state.total_calls += 1;
        state.last_failure_time = Some(Utc::now());
        let opened = self.evaluate(&mut state, reason);
        drop(state);
        match opened {
            Some(rate) => self.on_circuit_opened(feature, rate, reason),
            None => warn!(feature = %feature, reason = %reason, "Feature call failed"),
        }
    }

    /// Opens the circuit if the thresholds are crossed. Returns the error rate when it opened.
    fn evaluate(&self, state: &mut FeatureState, reason: &str) -> Option<f64> {
        if state.circuit_open || state.total_calls < self.config.min_calls {
            return None;
        }
        let rate = state.error_rate();
        if rate <= self.config.error_rate_threshold {
            return None;
        }
        let now = Utc::now();
        let old = state.condition();
        state.circuit_open = true;
        state.circuit_opened_at = Some(now);
        state.record_transition(old, &format!("circuit opened: {}", reason), now);
        Some(rate)
    }

    fn on_circuit_opened(&self, feature: Feature, error_rate: f64, reason: &str) {
        error!(
            feature = %feature,
            error_rate,
            threshold = self.config.error_rate_threshold,
            last_reason = %reason,
            "FEATURE FORCIBLY DISABLED - error rate above threshold, circuit opened"
        );
        record_circuit_open(feature.as_str());
        self.emit(RolloutEvent::CircuitOpened {
            feature,
            error_rate,
            at: Utc::now(),
        });
    }

    /// Enables a feature, closing its circuit and resetting its counters.
    pub fn enable(&self, feature: Feature, reason: &str) {
        let now = Utc::now();
        {
            let mut state = guard(self.state(feature));
            let old = state.condition();
            state.enabled = true;
            state.circuit_open = false;
            state.circuit_opened_at = None;
            state.reset_counters();
            state.record_transition(old, reason, now);
        }
        info!(feature = %feature, reason = %reason, "Feature enabled");
        self.emit(RolloutEvent::FeatureEnabled {
            feature,
            reason: reason.to_string(),
            at: now,
        });
    }

    /// Disables a feature.
    pub fn disable(&self, feature: Feature, reason: &str) {
        let now = Utc::now();
        {
            let mut state = guard(self.state(feature));
            let old = state.condition();
            state.enabled = false;
            state.record_transition(old, reason, now);
        }
        warn!(feature = %feature, reason = %reason, "Feature disabled");
        self.emit(RolloutEvent::FeatureDisabled {
            feature,
            reason: reason.to_string(),
            at: now,
        });
    }

    /// Enables every feature of `stage` and below, disables the rest.
    pub fn set_stage(&self, stage: RolloutStage) {
        let reason = format!("rollout {}", stage);
        for feature in Feature::ALL {
            let enabled = guard(self.state(feature)).enabled;
            match (stage.includes(feature), enabled) {
                (true, false) => self.enable(feature, &reason),
                (false, true) => self.disable(feature, &reason),
                _ => {}
            }
        }
        *guard(&self.stage) = stage;
        info!(stage = stage.number(), "Rollout stage set");
        self.emit(RolloutEvent::StageChanged {
            stage,
            at: Utc::now(),
        });
    }

    /// Parses and applies a numeric stage.
    pub fn set_stage_number(&self, stage: u8) -> Result<(), RolloutError> {
        self.set_stage(RolloutStage::new(stage)?);
        Ok(())
    }

    /// Returns to stage 1.
    pub fn rollback_all(&self, reason: &str) {
        error!(reason = %reason, "ROLLBACK - returning every feature to stage 1");
        self.set_stage(RolloutStage::MIN);
    }

    /// Resets a feature's counters without touching its flags.
    pub fn reset_metrics(&self, feature: Feature) {
        guard(self.state(feature)).reset_counters();
        info!(feature = %feature, "Feature metrics reset");
    }

    pub fn current_stage(&self) -> RolloutStage {
        *guard(&self.stage)
    }

    /// Snapshot of every feature.
    pub fn status(&self) -> RolloutStatus {
        let features = Feature::ALL
            .into_iter()
            .map(|feature| {
                let available = self.is_available(feature);
                let state = guard(self.state(feature)).clone();
                FeatureStatus {
                    feature,
                    available,
                    error_rate: state.error_rate(),
                    state,
                }
            })
            .collect();

        RolloutStatus {
            stage: self.current_stage(),
            error_rate_threshold: self.config.error_rate_threshold,
            min_calls: self.config.min_calls,
            cooldown_secs: self.config.cooldown_secs,
            features,
        }
    }

    /// Subscribes to rollout events sent after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<RolloutEvent> {
        self.sender.subscribe()
    }
}

impl Default for RolloutController {
    fn default() -> Self {
        Self::new(RolloutConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller_at(stage: u8) -> RolloutController {
        RolloutController::new(RolloutConfig {
            stage: RolloutStage::new(stage).unwrap(),
            ..Default::default()
        })
    }

    #[test]
    fn test_default_is_stage_one() {
        let controller = RolloutController::default();
        assert!(controller.is_available(Feature::Discovery));
        assert!(!controller.is_available(Feature::Reads));
        assert!(!controller.is_available(Feature::FastPath));
    }

    #[test]
    fn test_overrides_apply_after_stage() {
        let mut overrides = BTreeMap::new();
        overrides.insert(Feature::FastPath, true);
        overrides.insert(Feature::Discovery, false);
        let controller = RolloutController::new(RolloutConfig {
            overrides,
            ..Default::default()
        });
        assert!(!controller.is_available(Feature::Discovery));
        assert!(controller.is_available(Feature::FastPath));
    }

    #[test]
    fn test_circuit_opens_after_min_calls() {
        let controller = controller_at(4);
        for _ in 0..8 {
            controller.record_success(Feature::Reads);
        }
        controller.record_failure(Feature::Reads, "timeout");
        // 9 calls: below the minimum, stays closed despite an 11% error rate.
        assert!(controller.is_available(Feature::Reads));

        controller.record_success(Feature::Reads);
        // 10 calls, 10% error rate.
        assert!(!controller.is_available(Feature::Reads));
        let status = controller.status();
        let reads = status
            .features
            .iter()
            .find(|f| f.feature == Feature::Reads)
            .unwrap();
        assert!(reads.state.circuit_open);
        assert!(reads.state.circuit_opened_at.is_some());
        assert_eq!(
            reads.state.state_changes.back().unwrap().new,
            FeatureCondition::CircuitOpen
        );
    }

    #[test]
    fn test_error_rate_at_threshold_stays_closed() {
        let controller = RolloutController::new(RolloutConfig {
            stage: RolloutStage::MAX,
            error_rate_threshold: 0.1,
            ..Default::default()
        });
        for _ in 0..9 {
            controller.record_success(Feature::Discovery);
        }
        controller.record_failure(Feature::Discovery, "boom");
        assert!(controller.is_available(Feature::Discovery));
    }

    #[test]
    fn test_circuit_resets_after_cooldown() {
        let controller = RolloutController::new(RolloutConfig {
            stage: RolloutStage::MAX,
            cooldown_secs: 0,
            ..Default::default()
        });
        for _ in 0..10 {
            controller.record_failure(Feature::Discovery, "down");
        }
        assert!(guard(controller.state(Feature::Discovery)).circuit_open);

        assert!(controller.is_available(Feature::Discovery));
        let state = guard(controller.state(Feature::Discovery)).clone();
        assert!(!state.circuit_open);
        assert_eq!(state.total_calls, 0);
        assert_eq!(state.failures, 0);
    }

    #[test]
    fn test_open_circuit_within_cooldown_is_unavailable() {
        let controller = controller_at(4);
        for _ in 0..10 {
            controller.record_failure(Feature::FastPath, "bad");
        }
        assert!(!controller.is_available(Feature::FastPath));
        assert!(!controller.is_available(Feature::FastPath));
    }

    #[test]
    fn test_enable_clears_circuit_and_counters() {
        let controller = controller_at(4);
        for _ in 0..10 {
            controller.record_failure(Feature::Reads, "bad");
        }
        assert!(!controller.is_available(Feature::Reads));
        controller.enable(Feature::Reads, "operator override");
        assert!(controller.is_available(Feature::Reads));
        let state = guard(controller.state(Feature::Reads)).clone();
        assert_eq!(state.total_calls, 0);
        assert_eq!(state.state_changes.back().unwrap().reason, "operator override");
    }

    #[test]
    fn test_set_stage_and_rollback() {
        let controller = RolloutController::default();
        controller.set_stage(RolloutStage::new(3).unwrap());
        assert!(controller.is_available(Feature::ParameterResolution));
        assert!(!controller.is_available(Feature::FastPath));
        assert_eq!(controller.current_stage().number(), 3);

        controller.rollback_all("incident");
        assert!(controller.is_available(Feature::Discovery));
        assert!(!controller.is_available(Feature::Reads));
        assert!(!controller.is_available(Feature::ParameterResolution));
        assert_eq!(controller.current_stage(), RolloutStage::MIN);

        assert_eq!(
            controller.set_stage_number(9),
            Err(RolloutError::InvalidStage(9))
        );
    }

    #[test]
    fn test_audit_history_is_capped() {
        let controller = RolloutController::default();
        for i in 0..15 {
            controller.enable(Feature::Reads, &format!("on {}", i));
            controller.disable(Feature::Reads, &format!("off {}", i));
        }
        let state = guard(controller.state(Feature::Reads)).clone();
        assert_eq!(state.state_changes.len(), MAX_STATE_CHANGES);
        assert_eq!(state.state_changes.back().unwrap().reason, "off 14");
    }

    #[test]
    fn test_reset_metrics_keeps_flags() {
        let controller = controller_at(2);
        controller.record_failure(Feature::Reads, "x");
        controller.reset_metrics(Feature::Reads);
        let state = guard(controller.state(Feature::Reads)).clone();
        assert!(state.enabled);
        assert_eq!(state.failures, 0);
    }

    #[test]
    fn test_status_serializes() {
        let controller = controller_at(2);
        let json = serde_json::to_value(controller.status()).unwrap();
        assert_eq!(json["stage"], 2);
        assert_eq!(json["features"][1]["feature"], "reads");
        assert_eq!(json["features"][1]["available"], true);
    }

    #[tokio::test]
    async fn test_subscribe_receives_events() {
        let controller = RolloutController::default();
        let mut rx = controller.subscribe();
        controller.disable(Feature::Discovery, "maintenance");
        match rx.recv().await.unwrap() {
            RolloutEvent::FeatureDisabled { feature, reason, .. } => {
                assert_eq!(feature, Feature::Discovery);
                assert_eq!(reason, "maintenance");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
}
