//! In-memory document store with a synthetic request-charge model.
//!
//! Charges approximate a provisioned-throughput store closely enough for the
//! query benchmark to rank query shapes:
//!
//! - point read: 1 RU
//! - query: 2.3 RU base plus 0.05 RU per scanned document
//! - substring scans read every document in scope and cost 2.5x
//! - cross-partition queries add 3 RU per partition beyond the first
//! - writes: 5 RU plus 0.2 RU per KiB

use super::{
    document_keys, DocumentQuery, DocumentStore, QueryResponse, SortOrder, StoreError,
    StoreResult, StoredDocument,
};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Value};
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::RwLock;
use tracing::debug;

pub const POINT_READ_CHARGE: f64 = 1.0;
pub const QUERY_BASE_CHARGE: f64 = 2.3;
pub const PER_DOCUMENT_CHARGE: f64 = 0.05;
pub const SUBSTRING_SCAN_MULTIPLIER: f64 = 2.5;
pub const PER_EXTRA_PARTITION_CHARGE: f64 = 3.0;
pub const WRITE_BASE_CHARGE: f64 = 5.0;
const WRITE_PER_KIB_CHARGE: f64 = 0.2;

#[derive(Debug, Clone)]
struct Entry {
    body: Value,
    expires_at: Option<DateTime<Utc>>,
}

impl Entry {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

type Partition = BTreeMap<String, Entry>;
type Container = BTreeMap<String, Partition>;

/// Partitioned in-memory store.
pub struct InMemoryDocumentStore {
    name: String,
    containers: RwLock<HashMap<String, Container>>,
    default_ttl_secs: Option<i64>,
    unavailable: AtomicBool,
    upserts: AtomicU64,
    reads: AtomicU64,
    queries: AtomicU64,
}

impl InMemoryDocumentStore {
    /// Creates an empty store. Documents without a `ttl` never expire.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            containers: RwLock::new(HashMap::new()),
            default_ttl_secs: None,
            unavailable: AtomicBool::new(false),
            upserts: AtomicU64::new(0),
            reads: AtomicU64::new(0),
            queries: AtomicU64::new(0),
        }
    }

    /// Sets the container default TTL applied to documents without a `ttl` field.
    pub fn with_default_ttl(mut self, ttl_secs: i64) -> Self {
        self.default_ttl_secs = Some(ttl_secs);
        self
    }

    /// Makes every operation fail with `StoreError::Unavailable` while set.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Live documents in a container.
    pub async fn document_count(&self, container: &str) -> usize {
        let now = Utc::now();
        let containers = self.containers.read().await;
        containers
            .get(container)
            .map(|c| {
                c.values()
                    .flat_map(|p| p.values())
                    .filter(|e| e.is_live(now))
                    .count()
            })
            .unwrap_or(0)
    }

    /// Removes expired documents from every container. Returns how many were removed.
    pub async fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let mut removed = 0;
        let mut containers = self.containers.write().await;
        for container in containers.values_mut() {
            for partition in container.values_mut() {
                let before = partition.len();
                partition.retain(|_, e| e.is_live(now));
                removed += before - partition.len();
            }
            container.retain(|_, p| !p.is_empty());
        }
        removed
    }

    /// (upserts, reads, queries) received so far.
    pub fn operation_counts(&self) -> (u64, u64, u64) {
        (
            self.upserts.load(Ordering::SeqCst),
            self.reads.load(Ordering::SeqCst),
            self.queries.load(Ordering::SeqCst),
        )
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(format!("{} is unavailable", self.name)));
        }
        Ok(())
    }

    fn expiry(&self, document: &Value, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let ttl = document
            .get("ttl")
            .and_then(Value::as_i64)
            .or(self.default_ttl_secs)?;
        if ttl < 0 {
            return None;
        }
        Some(now + Duration::seconds(ttl))
    }
}

/// Total order over JSON scalars used for `ORDER BY`.
fn compare_values(a: Option<&Value>, b: Option<&Value>) -> CmpOrdering {
    match (a, b) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(CmpOrdering::Equal),
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(_), None) => CmpOrdering::Greater,
        (None, Some(_)) => CmpOrdering::Less,
        _ => CmpOrdering::Equal,
    }
}

fn round_charge(charge: f64) -> f64 {
    (charge * 100.0).round() / 100.0
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn upsert(&self, container: &str, document: Value) -> StoreResult<f64> {
        self.check_available()?;
        let (id, partition_key) = document_keys(&document)?;
        let size = document.to_string().len();
        let now = Utc::now();
        let entry = Entry {
            expires_at: self.expiry(&document, now),
            body: document,
        };

        let mut containers = self.containers.write().await;
        containers
            .entry(container.to_string())
            .or_default()
            .entry(partition_key)
            .or_default()
            .insert(id, entry);
        drop(containers);

        self.upserts.fetch_add(1, Ordering::SeqCst);
        Ok(round_charge(
            WRITE_BASE_CHARGE + WRITE_PER_KIB_CHARGE * (size as f64 / 1024.0),
        ))
    }

    async fn query(&self, container: &str, query: &DocumentQuery) -> StoreResult<QueryResponse> {
        self.check_available()?;
        self.queries.fetch_add(1, Ordering::SeqCst);
        let now = Utc::now();

        let (mut matched, scanned, partitions) = {
            let containers = self.containers.read().await;
            let Some(container) = containers.get(container) else {
                return Ok(QueryResponse {
                    documents: Vec::new(),
                    request_charge: QUERY_BASE_CHARGE,
                    continuation: None,
                });
            };

            let in_scope: Vec<&Partition> = match &query.partition_key {
                Some(pk) => container.get(pk).into_iter().collect(),
                None => container.values().collect(),
            };
            let live: Vec<&Value> = in_scope
                .iter()
                .flat_map(|p| p.values())
                .filter(|e| e.is_live(now))
                .map(|e| &e.body)
                .collect();
            let matched: Vec<Value> = live
                .iter()
                .filter(|doc| query.filters.iter().all(|f| f.matches(doc)))
                .map(|doc| (*doc).clone())
                .collect();
            // Index seeks read only matches; scans and aggregates read everything in scope.
            let scanned = if query.has_substring_scan() || query.group_count.is_some() {
                live.len()
            } else {
                matched.len()
            };
            (matched, scanned, in_scope.len())
        };

        let mut charge = QUERY_BASE_CHARGE + PER_DOCUMENT_CHARGE * scanned as f64;
        if query.has_substring_scan() {
            charge *= SUBSTRING_SCAN_MULTIPLIER;
        }
        if query.is_cross_partition() {
            charge += PER_EXTRA_PARTITION_CHARGE * partitions.saturating_sub(1) as f64;
        }

        if let Some(field) = &query.group_count {
            let mut groups: BTreeMap<String, u64> = BTreeMap::new();
            for doc in &matched {
                let key = doc
                    .get(field)
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                *groups.entry(key).or_default() += 1;
            }
            matched = groups
                .into_iter()
                .map(|(value, count)| {
                    let mut row = serde_json::Map::new();
                    row.insert(field.clone(), Value::String(value));
                    row.insert("count".to_string(), json!(count));
                    Value::Object(row)
                })
                .collect();
        }

        if let Some((field, order)) = &query.order_by {
            matched.sort_by(|a, b| {
                let ordering = compare_values(a.get(field), b.get(field));
                match order {
                    SortOrder::Asc => ordering,
                    SortOrder::Desc => ordering.reverse(),
                }
            });
        }

        let offset = query.offset.unwrap_or(0);
        let mut rows: Vec<Value> = matched.into_iter().skip(offset).collect();
        if let Some(limit) = query.limit {
            rows.truncate(limit);
        }

        let start = match query.continuation.as_deref() {
            Some(token) => token
                .parse::<usize>()
                .map_err(|_| StoreError::InvalidQuery(format!("Invalid continuation: {}", token)))?,
            None => 0,
        };
        let total = rows.len();
        let page: Vec<Value> = match query.max_item_count {
            Some(size) => rows.into_iter().skip(start).take(size.max(1)).collect(),
            None => rows.into_iter().skip(start).collect(),
        };
        let next = start + page.len();
        let continuation = (query.max_item_count.is_some() && next < total).then(|| next.to_string());

        let request_charge = round_charge(charge);
        debug!(
            store = %self.name,
            scanned,
            returned = page.len(),
            request_charge,
            "In-memory query executed"
        );

        Ok(QueryResponse {
            documents: page,
            request_charge,
            continuation,
        })
    }

    async fn read(
        &self,
        container: &str,
        partition_key: &str,
        id: &str,
    ) -> StoreResult<Option<StoredDocument>> {
        self.check_available()?;
        self.reads.fetch_add(1, Ordering::SeqCst);
        let now = Utc::now();
        let containers = self.containers.read().await;
        Ok(containers
            .get(container)
            .and_then(|c| c.get(partition_key))
            .and_then(|p| p.get(id))
            .filter(|e| e.is_live(now))
            .map(|e| StoredDocument {
                body: e.body.clone(),
                request_charge: POINT_READ_CHARGE,
            }))
    }

    async fn delete(&self, container: &str, partition_key: &str, id: &str) -> StoreResult<bool> {
        self.check_available()?;
        let mut containers = self.containers.write().await;
        Ok(containers
            .get_mut(container)
            .and_then(|c| c.get_mut(partition_key))
            .and_then(|p| p.remove(id))
            .is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::FieldFilter;

    fn resource(sub: &str, name: &str, resource_type: &str, location: &str) -> Value {
        json!({
            "id": format!("/subscriptions/{}/providers/{}/{}", sub, resource_type, name),
            "partition_key": sub,
            "subscription_id": sub,
            "resource_name": name,
            "resource_type": resource_type,
            "location": location,
            "tags": {"env": "prod"}
        })
    }

    async fn seeded() -> InMemoryDocumentStore {
        let store = InMemoryDocumentStore::new("test");
        for i in 0..10 {
            let doc = resource("sub-1", &format!("vm-{}", i), "vm", "eastus");
            store.upsert("resources", doc).await.unwrap();
        }
        for i in 0..10 {
            let doc = resource("sub-2", &format!("app-{}", i), "site", "westus");
            store.upsert("resources", doc).await.unwrap();
        }
        store
    }

    #[tokio::test]
    async fn test_point_read_costs_one_unit() {
        let store = seeded().await;
        let id = "/subscriptions/sub-1/providers/vm/vm-3";
        let hit = store.read("resources", "sub-1", id).await.unwrap().unwrap();
        assert_eq!(hit.request_charge, POINT_READ_CHARGE);
        assert!(store.read("resources", "sub-2", id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_partition_scoped_equality_is_cheap() {
        let store = seeded().await;
        let query = DocumentQuery::new("SELECT * FROM c WHERE c.resource_type = @type")
            .with_parameter("@type", "vm")
            .with_partition_key("sub-1")
            .with_filter(FieldFilter::Equals {
                field: "resource_type".into(),
                value: json!("vm"),
            });
        let response = store.query("resources", &query).await.unwrap();
        assert_eq!(response.documents.len(), 10);
        assert!((response.request_charge - 2.8).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_substring_scan_and_fan_out_cost_more() {
        let store = seeded().await;
        let scan = DocumentQuery::new("SELECT * FROM c WHERE CONTAINS(LOWER(c.resource_name), @f)")
            .with_partition_key("sub-1")
            .with_filter(FieldFilter::ContainsIgnoreCase {
                field: "resource_name".into(),
                fragment: "vm-1".into(),
            });
        let response = store.query("resources", &scan).await.unwrap();
        assert_eq!(response.documents.len(), 1);
        assert!((response.request_charge - 7.0).abs() < 1e-9);

        let fan_out = DocumentQuery::new("SELECT * FROM c WHERE c.location = @loc").with_filter(
            FieldFilter::Equals {
                field: "location".into(),
                value: json!("westus"),
            },
        );
        let response = store.query("resources", &fan_out).await.unwrap();
        assert_eq!(response.documents.len(), 10);
        assert!((response.request_charge - 5.8).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_group_count_and_paging() {
        let store = seeded().await;
        let mut grouped = DocumentQuery::new("SELECT c.resource_type, COUNT(1) AS count FROM c");
        grouped.group_count = Some("resource_type".to_string());
        let response = store.query("resources", &grouped).await.unwrap();
        assert_eq!(response.documents.len(), 2);
        assert_eq!(response.documents[0]["count"], 10);

        let mut paged = DocumentQuery::new("SELECT * FROM c").with_partition_key("sub-1");
        paged.max_item_count = Some(4);
        paged.order_by = Some(("resource_name".to_string(), SortOrder::Desc));
        let first = store.query("resources", &paged).await.unwrap();
        assert_eq!(first.documents.len(), 4);
        assert_eq!(first.documents[0]["resource_name"], "vm-9");
        assert_eq!(first.continuation.as_deref(), Some("4"));

        paged.continuation = Some("8".to_string());
        let last = store.query("resources", &paged).await.unwrap();
        assert_eq!(last.documents.len(), 2);
        assert!(last.continuation.is_none());
    }

    #[tokio::test]
    async fn test_expired_documents_are_invisible() {
        let store = InMemoryDocumentStore::new("ttl");
        let mut doc = resource("sub-1", "vm-0", "vm", "eastus");
        doc["ttl"] = json!(0);
        store.upsert("resources", doc).await.unwrap();
        assert_eq!(store.document_count("resources").await, 0);
        assert_eq!(store.purge_expired().await, 1);
    }

    #[tokio::test]
    async fn test_unavailable_and_invalid_documents() {
        let store = InMemoryDocumentStore::new("flaky");
        assert!(matches!(
            store.upsert("c", json!({"id": "x"})).await,
            Err(StoreError::InvalidDocument(_))
        ));
        store.set_unavailable(true);
        assert!(matches!(
            store.read("c", "p", "x").await,
            Err(StoreError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_delete() {
        let store = seeded().await;
        let id = "/subscriptions/sub-1/providers/vm/vm-0";
        assert!(store.delete("resources", "sub-1", id).await.unwrap());
        assert!(!store.delete("resources", "sub-1", id).await.unwrap());
        assert_eq!(store.document_count("resources").await, 19);
    }
}
