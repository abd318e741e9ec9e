//! # iw-observability
//!
//! Logging and metrics infrastructure for Inventory Warden.
//!
//! This crate provides structured logging with tracing and the metric
//! names/helpers recorded by the discovery, cache, query and rollout layers.

pub mod logging;
pub mod metrics;

pub use crate::logging::{init_logging, init_logging_with_config, LoggingConfig};
pub use crate::metrics::{describe_metrics, CacheTier};
