//! Background full and incremental discovery jobs.

mod runner;
mod types;

pub use runner::{DiscoveryScheduler, SchedulerHandle};
pub use types::{
    JobStats, RunResult, ScanJob, ScanOutcome, SchedulerConfig, SchedulerError,
    SchedulerIntervals, SchedulerResult, SubscriptionFailure,
};
