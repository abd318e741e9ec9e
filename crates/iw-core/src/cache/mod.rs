//! Two-tier cache of discovered resource listings.
//!
//! Listings are keyed by subscription, resource type and an optional filter
//! set. L1 is an in-process map bounded by entry count; L2 is an optional
//! partitioned document store. Retention is chosen per resource type by
//! [`TtlPolicy`].
//!
//! # Example
//!
//! ```ignore
//! use iw_core::cache::{TtlPolicy, TwoTierCache};
//!
//! let cache = TwoTierCache::new(TtlPolicy::default(), 1000);
//! cache.set("sub-1", "microsoft.compute/virtualmachines", documents).await;
//! let hit = cache.get("sub-1", "microsoft.compute/virtualmachines", None).await;
//! ```

mod error;
mod memory;
mod tiered;
mod ttl;
mod types;

pub use error::{CacheError, CacheResult};
pub use memory::{MemoryTier, DEFAULT_L1_CAPACITY};
pub use tiered::TwoTierCache;
pub use ttl::{TtlPolicy, DEFAULT_L1_TTL, DEFAULT_L2_TTL};
pub use types::{cache_key, CacheEntry, CacheFilters, CacheStatistics, L2CacheDocument, Tier};
