//! Discovery of subscriptions, resources, changes and relationships.

mod engine;
mod enrichment;
mod error;
pub mod kql;
mod relationships;

pub use engine::{DiscoveryConfig, DiscoveryEngine};
pub use error::{DiscoveryError, DiscoveryResult};
pub use relationships::MAX_RELATIONSHIP_DEPTH;
