//! Cache types and structures.

use crate::models::ResourceDocument;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::time::Duration;

/// Extra dimensions a cached listing was keyed on (location, resource group,
/// tag filters). Ordered, so equal filter sets always hash to the same key.
pub type CacheFilters = BTreeMap<String, String>;

/// Tier an L1 entry was filled from: a direct write or an L2 promotion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Tier {
    L1,
    L2,
}

/// Computes the composite cache key for a listing.
///
/// Subscription and type compare case-insensitively; filter keys are
/// lower-cased, filter values are kept verbatim.
pub fn cache_key(
    subscription_id: &str,
    resource_type: &str,
    filters: Option<&CacheFilters>,
) -> String {
    let canonical: BTreeMap<String, &str> = filters
        .map(|f| f.iter().map(|(k, v)| (k.to_lowercase(), v.as_str())).collect())
        .unwrap_or_default();
    let filters_json = serde_json::to_string(&canonical).unwrap_or_default();

    let mut hasher = Sha256::new();
    hasher.update(subscription_id.to_lowercase().as_bytes());
    hasher.update(b"\n");
    hasher.update(resource_type.to_lowercase().as_bytes());
    hasher.update(b"\n");
    hasher.update(filters_json.as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// A cached listing.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: String,
    pub subscription_id: String,
    pub resource_type: String,
    pub filters: Option<CacheFilters>,
    pub documents: Vec<ResourceDocument>,
    pub expires_at: DateTime<Utc>,
    /// Lifetime in L1, applied by the tier's expiry policy.
    pub ttl: Duration,
    pub tier: Tier,
    /// Insertion order.
    pub sequence: u64,
}

impl CacheEntry {
    /// Returns true if this entry has expired.
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }
}

/// The L2 representation of a cached listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct L2CacheDocument {
    pub id: String,
    pub partition_key: String,
    pub subscription_id: String,
    pub resource_type: String,
    #[serde(default)]
    pub filters: Option<CacheFilters>,
    pub documents: Vec<ResourceDocument>,
    pub item_count: usize,
    pub cached_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub ttl: i64,
}

/// Snapshot of cache counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStatistics {
    pub hits_l1: u64,
    pub hits_l2: u64,
    pub misses: u64,
    pub writes: u64,
    /// (hits_l1 + hits_l2) / lookups, 0.0 if no lookups.
    pub hit_rate: f64,
    /// Per-type TTL overrides, in seconds.
    pub ttl_overrides: BTreeMap<String, u64>,
    pub l1_entries: usize,
    pub l2_enabled: bool,
}

impl CacheStatistics {
    /// Every lookup counted, hits and misses.
    pub fn total_lookups(&self) -> u64 {
        self.hits_l1 + self.hits_l2 + self.misses
    }
}

pub(crate) fn hit_rate(hits: u64, misses: u64) -> f64 {
    if hits + misses > 0 {
        hits as f64 / (hits + misses) as f64
    } else {
        0.0
    }
}
