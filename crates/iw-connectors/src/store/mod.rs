//! Partitioned document-store boundary used as the L2 cache tier and as the
//! queryable resource container.
//!
//! A [`DocumentQuery`] carries both the SQL text sent to a real store and a
//! structured description of the same predicate ([`FieldFilter`]), which the
//! in-memory store evaluates directly.

pub mod cosmos;
pub mod memory;

pub use cosmos::{CosmosConfig, CosmosDocumentStore};
pub use memory::InMemoryDocumentStore;

use crate::traits::ConnectorError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Container holding cached query results (L2 tier).
pub const CACHE_CONTAINER: &str = "inventory-cache";

/// Container holding individual resource documents.
pub const RESOURCES_CONTAINER: &str = "resources";

/// Field every stored document is partitioned on.
pub const PARTITION_KEY_FIELD: &str = "partition_key";

/// Errors raised by document stores.
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    #[error("Store request failed: {0}")]
    Connector(#[from] ConnectorError),

    #[error("Invalid document: {0}")]
    InvalidDocument(String),

    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// A named query parameter (`@name`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryParameter {
    pub name: String,
    pub value: Value,
}

/// Structured predicate over a top-level document field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum FieldFilter {
    /// `c.{field} = value`; strings compare case-insensitively.
    Equals { field: String, value: Value },
    /// `CONTAINS(LOWER(c.{field}), fragment)`; a substring scan.
    ContainsIgnoreCase { field: String, fragment: String },
    /// `c.{field} >= value`.
    GreaterOrEqual { field: String, value: Value },
    /// `c.tags[key] = value`.
    TagEquals { key: String, value: String },
}

impl FieldFilter {
    /// Whether evaluating this filter requires reading every document in scope.
    pub fn is_scan(&self) -> bool {
        matches!(self, FieldFilter::ContainsIgnoreCase { .. })
    }

    /// Evaluates the filter against a document.
    pub fn matches(&self, document: &Value) -> bool {
        match self {
            FieldFilter::Equals { field, value } => match (document.get(field), value) {
                (Some(Value::String(actual)), Value::String(expected)) => {
                    actual.eq_ignore_ascii_case(expected)
                }
                (Some(actual), expected) => actual == expected,
                (None, _) => false,
            },
            FieldFilter::ContainsIgnoreCase { field, fragment } => document
                .get(field)
                .and_then(Value::as_str)
                .is_some_and(|s| s.to_lowercase().contains(&fragment.to_lowercase())),
            FieldFilter::GreaterOrEqual { field, value } => match (document.get(field), value) {
                (Some(Value::String(actual)), Value::String(bound)) => actual >= bound,
                (Some(Value::Number(actual)), Value::Number(bound)) => {
                    match (actual.as_f64(), bound.as_f64()) {
                        (Some(a), Some(b)) => a >= b,
                        _ => false,
                    }
                }
                _ => false,
            },
            FieldFilter::TagEquals { key, value } => document
                .get("tags")
                .and_then(|tags| tags.get(key))
                .and_then(Value::as_str)
                .is_some_and(|v| v == value),
        }
    }
}

/// Sort direction for `ORDER BY`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SortOrder {
    Asc,
    Desc,
}

impl SortOrder {
    pub fn as_str(&self) -> &'static str {
        match self {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        }
    }
}

/// A query against one container.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocumentQuery {
    /// SQL text with `@name` parameters.
    pub sql: String,
    /// Bound parameters.
    pub parameters: Vec<QueryParameter>,
    /// Partition the query is scoped to; `None` fans out across partitions.
    pub partition_key: Option<String>,
    /// Structured form of the `WHERE` clause.
    pub filters: Vec<FieldFilter>,
    /// When set, rows are `{field: value, "count": n}` grouped on this field.
    pub group_count: Option<String>,
    /// Ordering applied before paging.
    pub order_by: Option<(String, SortOrder)>,
    /// Rows skipped (`OFFSET`).
    pub offset: Option<usize>,
    /// Rows returned (`LIMIT`).
    pub limit: Option<usize>,
    /// Page size hint for continuation-based paging.
    pub max_item_count: Option<usize>,
    /// Continuation token from the previous page.
    pub continuation: Option<String>,
}

impl DocumentQuery {
    /// Creates a query from SQL text.
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            ..Default::default()
        }
    }

    /// Binds an `@name` parameter.
    pub fn with_parameter(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.push(QueryParameter {
            name: name.into(),
            value: value.into(),
        });
        self
    }

    /// Scopes the query to one partition.
    pub fn with_partition_key(mut self, partition_key: impl Into<String>) -> Self {
        self.partition_key = Some(partition_key.into());
        self
    }

    /// Adds a structured filter.
    pub fn with_filter(mut self, filter: FieldFilter) -> Self {
        self.filters.push(filter);
        self
    }

    /// Returns a bound parameter value.
    pub fn parameter(&self, name: &str) -> Option<&Value> {
        self.parameters
            .iter()
            .find(|p| p.name == name)
            .map(|p| &p.value)
    }

    /// Whether any filter forces a full scan.
    pub fn has_substring_scan(&self) -> bool {
        self.filters.iter().any(FieldFilter::is_scan)
    }

    /// Whether the query fans out across partitions.
    pub fn is_cross_partition(&self) -> bool {
        self.partition_key.is_none()
    }
}

/// One page of query results.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryResponse {
    pub documents: Vec<Value>,
    /// Request units consumed.
    pub request_charge: f64,
    /// Continuation token; `None` when exhausted.
    pub continuation: Option<String>,
}

/// A document returned by a point read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredDocument {
    pub body: Value,
    /// Request units consumed.
    pub request_charge: f64,
}

/// Path-based composite index over document fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompositeIndex {
    /// Field paths in index order, e.g. `/resource_type`.
    pub paths: Vec<String>,
}

/// Indexing policy for the resources container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexingPolicy {
    pub indexing_mode: String,
    pub included_paths: Vec<String>,
    pub excluded_paths: Vec<String>,
    pub composite_indexes: Vec<CompositeIndex>,
}

impl IndexingPolicy {
    /// The policy the query layer is tuned for.
    pub fn inventory_default() -> Self {
        let composite = |paths: &[&str]| CompositeIndex {
            paths: paths.iter().map(|p| p.to_string()).collect(),
        };
        Self {
            indexing_mode: "consistent".to_string(),
            included_paths: vec!["/*".to_string()],
            excluded_paths: vec![
                "/selected_properties/*".to_string(),
                "/enriched_properties/*".to_string(),
                "/\"_etag\"/?".to_string(),
            ],
            composite_indexes: vec![
                composite(&["/subscription_id", "/resource_type", "/location"]),
                composite(&["/resource_type", "/last_seen"]),
                composite(&["/subscription_id", "/resource_group", "/resource_name"]),
            ],
        }
    }

    /// Whether a composite index starts with exactly these paths, in order.
    pub fn covers(&self, paths: &[&str]) -> bool {
        self.composite_indexes.iter().any(|index| {
            index.paths.len() >= paths.len()
                && index.paths.iter().zip(paths).all(|(a, b)| a == b)
        })
    }
}

/// Partitioned document store.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Store name for logging.
    fn name(&self) -> &str;

    /// Inserts or replaces a document. The document must carry string `id`
    /// and `partition_key` fields. Returns the request charge.
    async fn upsert(&self, container: &str, document: Value) -> StoreResult<f64>;

    /// Runs a query.
    async fn query(&self, container: &str, query: &DocumentQuery) -> StoreResult<QueryResponse>;

    /// Point read by partition key and id.
    async fn read(
        &self,
        container: &str,
        partition_key: &str,
        id: &str,
    ) -> StoreResult<Option<StoredDocument>>;

    /// Deletes a document. Returns whether it existed.
    async fn delete(&self, container: &str, partition_key: &str, id: &str) -> StoreResult<bool>;
}

/// Extracts the `id` and `partition_key` of a document about to be written.
pub(crate) fn document_keys(document: &Value) -> StoreResult<(String, String)> {
    let field = |name: &str| {
        document
            .get(name)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .ok_or_else(|| StoreError::InvalidDocument(format!("missing string field '{}'", name)))
    };
    Ok((field("id")?, field(PARTITION_KEY_FIELD)?))
}
