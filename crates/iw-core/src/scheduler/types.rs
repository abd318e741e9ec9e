//! Scheduler configuration, outcomes and run statistics.

use crate::discovery::DiscoveryError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Errors that abort a whole scheduler run.
#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("Discovery failed: {0}")]
    Discovery(#[from] DiscoveryError),
}

/// Result type for scheduler runs.
pub type SchedulerResult<T> = Result<T, SchedulerError>;

/// Refresh cadence and fan-out limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub full_refresh_secs: u64,
    pub incremental_refresh_secs: u64,
    /// Subscriptions scanned at once.
    pub max_concurrent_scans: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            full_refresh_secs: 24 * 60 * 60,
            incremental_refresh_secs: 15 * 60,
            max_concurrent_scans: 4,
        }
    }
}

impl SchedulerConfig {
    pub fn intervals(&self) -> SchedulerIntervals {
        SchedulerIntervals {
            full: Duration::from_secs(self.full_refresh_secs.max(1)),
            incremental: Duration::from_secs(self.incremental_refresh_secs.max(1)),
        }
    }
}

/// Tick periods for the background loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerIntervals {
    pub full: Duration,
    pub incremental: Duration,
}

/// The two scheduled jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanJob {
    FullRefresh,
    IncrementalRefresh,
}

impl ScanJob {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanJob::FullRefresh => "full_refresh",
            ScanJob::IncrementalRefresh => "incremental_refresh",
        }
    }
}

impl fmt::Display for ScanJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A subscription that failed during an otherwise completed run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionFailure {
    pub subscription_id: String,
    pub message: String,
}

/// Summary of one completed run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub run_id: Uuid,
    pub job: ScanJob,
    pub subscriptions_scanned: usize,
    /// Documents discovered (full) or changes applied (incremental).
    pub resource_count: usize,
    pub errors: Vec<SubscriptionFailure>,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl RunResult {
    pub fn succeeded(&self) -> bool {
        self.errors.is_empty()
    }
}

/// What a call to a refresh job did.
#[derive(Debug, Clone, PartialEq)]
pub enum ScanOutcome {
    Completed(RunResult),
    /// The same job was already running.
    Skipped,
}

impl ScanOutcome {
    pub fn is_skipped(&self) -> bool {
        matches!(self, ScanOutcome::Skipped)
    }

    pub fn result(&self) -> Option<&RunResult> {
        match self {
            ScanOutcome::Completed(result) => Some(result),
            ScanOutcome::Skipped => None,
        }
    }
}

/// Cumulative statistics for one job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStats {
    pub runs: u64,
    pub last_resource_count: usize,
    pub failures: u64,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_duration_ms: u64,
    pub last_error: Option<String>,
}
