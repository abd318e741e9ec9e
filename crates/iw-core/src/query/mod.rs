//! Query construction and request-charge benchmarking for the resources
//! container.

mod benchmark;
mod builder;

pub use benchmark::{
    BenchmarkReport, BenchmarkSample, QueryBenchmark, QueryMeasurement, DEFAULT_TARGET_RU,
};
pub use builder::{point_read_target, InventoryQueries, QueryShape};
