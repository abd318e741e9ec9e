//! In-process L1 tier.

use super::types::{CacheEntry, CacheFilters, Tier};
use crate::models::ResourceDocument;
use chrono::{Duration as ChronoDuration, Utc};
use moka::future::Cache as MokaCache;
use moka::notification::RemovalCause;
use moka::policy::EvictionPolicy;
use moka::Expiry;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Default number of L1 entries.
pub const DEFAULT_L1_CAPACITY: usize = 1000;

/// Expires each entry after its own resource-type TTL.
struct EntryExpiry;

impl Expiry<String, CacheEntry> for EntryExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &CacheEntry,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &CacheEntry,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

/// Bounded in-memory cache of listings, backed by moka.
///
/// Capacity is counted in entries. When full, the least recently used entry
/// is evicted.
pub struct MemoryTier {
    cache: MokaCache<String, CacheEntry>,
    capacity: usize,
    sequence: AtomicU64,
}

impl MemoryTier {
    /// Creates a tier holding at most `capacity` listings.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let cache = MokaCache::builder()
            .max_capacity(capacity as u64)
            .eviction_policy(EvictionPolicy::lru())
            .expire_after(EntryExpiry)
            .eviction_listener(|key: Arc<String>, _value, cause| {
                if cause == RemovalCause::Size {
                    debug!(key = %key, "Evicted L1 entry at capacity");
                }
            })
            .build();
        Self {
            cache,
            capacity,
            sequence: AtomicU64::new(0),
        }
    }

    /// Maximum number of listings held.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns a live entry's documents. Expired entries are never returned.
    pub async fn get(&self, key: &str) -> Option<Vec<ResourceDocument>> {
        self.cache.get(key).await.map(|entry| entry.documents)
    }

    /// Inserts or replaces a listing that lives for `ttl`.
    #[allow(clippy::too_many_arguments)]
    pub async fn insert(
        &self,
        key: String,
        subscription_id: &str,
        resource_type: &str,
        filters: Option<CacheFilters>,
        documents: Vec<ResourceDocument>,
        ttl: Duration,
        tier: Tier,
    ) {
        let entry = CacheEntry {
            key: key.clone(),
            subscription_id: subscription_id.to_string(),
            resource_type: resource_type.to_lowercase(),
            filters,
            documents,
            expires_at: Utc::now()
                + ChronoDuration::from_std(ttl).unwrap_or_else(|_| ChronoDuration::zero()),
            ttl,
            tier,
            sequence: self.sequence.fetch_add(1, Ordering::SeqCst),
        };
        self.cache.insert(key, entry).await;
    }

    /// Removes entries for a subscription, optionally only one type.
    /// Returns how many live entries were removed.
    pub async fn invalidate(&self, subscription_id: &str, resource_type: Option<&str>) -> usize {
        let doomed: Vec<Arc<String>> = self
            .cache
            .iter()
            .filter(|(_, e)| {
                e.subscription_id.eq_ignore_ascii_case(subscription_id)
                    && resource_type.map_or(true, |t| e.resource_type.eq_ignore_ascii_case(t))
            })
            .map(|(key, _)| key)
            .collect();
        for key in &doomed {
            self.cache.invalidate(key.as_str()).await;
        }
        doomed.len()
    }

    /// Removes every entry. Returns how many live entries there were.
    pub async fn clear(&self) -> usize {
        let count = self.len().await;
        self.cache.invalidate_all();
        self.cache.run_pending_tasks().await;
        count
    }

    /// Runs moka's maintenance pass, dropping expired and over-capacity
    /// entries. Returns how many entries it removed.
    pub async fn purge_expired(&self) -> usize {
        let before = self.cache.entry_count();
        self.cache.run_pending_tasks().await;
        before.saturating_sub(self.cache.entry_count()) as usize
    }

    /// Number of live entries.
    pub async fn len(&self) -> usize {
        self.cache.run_pending_tasks().await;
        self.cache.iter().count()
    }

    /// Whether no live entry remains.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Documents from every live entry in insertion order, deduplicated by id.
    pub async fn live_documents(&self) -> Vec<ResourceDocument> {
        let mut entries: Vec<CacheEntry> = self.cache.iter().map(|(_, e)| e).collect();
        entries.sort_by_key(|e| e.sequence);

        let mut seen = HashSet::new();
        entries
            .into_iter()
            .flat_map(|e| e.documents)
            .filter(|d| seen.insert(d.id.to_lowercase()))
            .collect()
    }
}

impl Default for MemoryTier {
    fn default() -> Self {
        Self::new(DEFAULT_L1_CAPACITY)
    }
}

impl std::fmt::Debug for MemoryTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTier")
            .field("capacity", &self.capacity)
            .field("entries", &self.cache.entry_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINUTE: Duration = Duration::from_secs(60);

    fn doc(name: &str) -> ResourceDocument {
        ResourceDocument::from_id(
            &format!("/subscriptions/s/resourceGroups/rg/providers/Microsoft.Compute/virtualMachines/{}", name),
            "s",
            Utc::now(),
        )
    }

    async fn put(tier: &MemoryTier, key: &str, sub: &str, ty: &str, docs: Vec<ResourceDocument>, ttl: Duration) {
        tier.insert(key.into(), sub, ty, None, docs, ttl, Tier::L1).await;
    }

    #[tokio::test]
    async fn test_insert_and_get() {
        let tier = MemoryTier::new(10);
        put(&tier, "k", "s", "vm", vec![doc("a")], MINUTE).await;
        assert_eq!(tier.get("k").await.unwrap().len(), 1);
        assert!(tier.get("missing").await.is_none());
    }

    #[tokio::test]
    async fn test_zero_ttl_entry_is_never_served() {
        let tier = MemoryTier::new(10);
        put(&tier, "k", "s", "vm", vec![doc("a")], Duration::ZERO).await;
        assert!(tier.get("k").await.is_none());
        assert_eq!(tier.len().await, 0);
    }

    #[tokio::test]
    async fn test_per_entry_ttl() {
        let tier = MemoryTier::new(10);
        put(&tier, "short", "s", "vm", vec![doc("a")], Duration::from_millis(30)).await;
        put(&tier, "long", "s", "vnet", vec![doc("b")], MINUTE).await;
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(tier.get("short").await.is_none());
        assert!(tier.get("long").await.is_some());
    }

    #[tokio::test]
    async fn test_capacity_is_bounded() {
        let tier = MemoryTier::new(2);
        put(&tier, "first", "s", "vm", vec![doc("a")], MINUTE).await;
        put(&tier, "second", "s", "vm", vec![doc("b")], MINUTE).await;
        put(&tier, "third", "s", "vm", vec![doc("c")], MINUTE).await;
        assert_eq!(tier.len().await, 2);
        assert!(tier.get("third").await.is_some());
    }

    #[tokio::test]
    async fn test_invalidate_by_subscription_and_type() {
        let tier = MemoryTier::new(10);
        put(&tier, "a", "s1", "vm", vec![], MINUTE).await;
        put(&tier, "b", "s1", "site", vec![], MINUTE).await;
        put(&tier, "c", "s2", "vm", vec![], MINUTE).await;

        assert_eq!(tier.invalidate("S1", Some("VM")).await, 1);
        assert_eq!(tier.invalidate("s1", None).await, 1);
        assert_eq!(tier.len().await, 1);
        assert_eq!(tier.clear().await, 1);
        assert!(tier.is_empty().await);
    }

    #[tokio::test]
    async fn test_live_documents_deduplicates() {
        let tier = MemoryTier::new(10);
        put(&tier, "a", "s", "vm", vec![doc("x"), doc("y")], MINUTE).await;
        put(&tier, "b", "s", "vm", vec![doc("x")], MINUTE).await;
        put(&tier, "c", "s", "vm", vec![doc("z")], Duration::ZERO).await;
        assert_eq!(tier.live_documents().await.len(), 2);
    }
}
