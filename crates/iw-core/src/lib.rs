//! # iw-core
//!
//! Resource inventory for Inventory Warden.
//!
//! This crate discovers cloud resources, keeps them in a two-tier cache,
//! refreshes them on a schedule and serves reads and tool-parameter
//! resolution through [`InventoryClient`].

pub mod cache;
pub mod client;
pub mod config;
pub mod context;
pub mod discovery;
pub mod models;
pub mod query;
pub mod scheduler;

pub use cache::{CacheFilters, CacheStatistics, TtlPolicy, TwoTierCache};
pub use client::{InventoryClient, ToolParameters, DISAMBIGUATION_FLAG, MATCHES_FIELD};
pub use config::{CacheConfig, ConfigError, InventoryConfig};
pub use context::InventoryContext;
pub use discovery::{DiscoveryConfig, DiscoveryEngine, DiscoveryError, DiscoveryResult};
pub use models::{
    ChangeRecord, ChangeSet, ChangeType, RelationshipEdge, RelationshipType, ResourceDocument,
    Subscription,
};
pub use query::{BenchmarkReport, InventoryQueries, QueryBenchmark, QueryShape};
pub use scheduler::{
    DiscoveryScheduler, JobStats, ScanJob, ScanOutcome, SchedulerConfig, SchedulerError,
    SchedulerHandle, SchedulerIntervals,
};
