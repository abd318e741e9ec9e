//! Cost-aware queries against the resources container.
//!
//! Every shape except the cross-subscription listing is scoped to one
//! subscription partition, and equality predicates are ordered to match the
//! composite indexes of [`IndexingPolicy::inventory_default`].

use chrono::{DateTime, SecondsFormat, Utc};
use iw_connectors::store::{RESOURCES_CONTAINER, SortOrder};
use iw_connectors::{
    DocumentQuery, DocumentStore, FieldFilter, IndexingPolicy, QueryResponse, StoreResult,
};
use serde_json::json;
use std::fmt;

/// Charge reported for a point read that found nothing.
const POINT_READ_MISS_CHARGE: f64 = 1.0;

/// The query shapes the inventory serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryShape {
    ResourcesByType,
    SearchByName,
    ByTag,
    RelationshipLookup,
    ByTypeAndLocation,
    CountByType,
    ChangedSince,
    AllSubscriptionsByType,
}

impl QueryShape {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryShape::ResourcesByType => "resources_by_type",
            QueryShape::SearchByName => "search_by_name",
            QueryShape::ByTag => "by_tag",
            QueryShape::RelationshipLookup => "relationship_lookup",
            QueryShape::ByTypeAndLocation => "by_type_and_location",
            QueryShape::CountByType => "count_by_type",
            QueryShape::ChangedSince => "changed_since",
            QueryShape::AllSubscriptionsByType => "all_subscriptions_by_type",
        }
    }
}

impl fmt::Display for QueryShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Builds inventory queries.
#[derive(Debug, Clone)]
pub struct InventoryQueries {
    container: String,
    policy: IndexingPolicy,
}

impl Default for InventoryQueries {
    fn default() -> Self {
        Self::new(RESOURCES_CONTAINER)
    }
}

fn equals(field: &str, value: impl Into<serde_json::Value>) -> FieldFilter {
    FieldFilter::Equals {
        field: field.to_string(),
        value: value.into(),
    }
}

impl InventoryQueries {
    pub fn new(container: impl Into<String>) -> Self {
        Self {
            container: container.into(),
            policy: IndexingPolicy::inventory_default(),
        }
    }

    pub fn container(&self) -> &str {
        &self.container
    }

    /// Composite-index layout the shapes are written against.
    pub fn indexing_policy(&self) -> &IndexingPolicy {
        &self.policy
    }

    /// Resources of one type, optionally in one location.
    pub fn resources_by_type(
        &self,
        subscription_id: &str,
        resource_type: &str,
        location: Option<&str>,
    ) -> DocumentQuery {
        match location {
            Some(location) => self.by_type_and_location(subscription_id, resource_type, location),
            None => DocumentQuery::new(
                "SELECT * FROM c WHERE c.subscription_id = @subscription_id AND c.resource_type = @resource_type",
            )
            .with_parameter("@subscription_id", subscription_id)
            .with_parameter("@resource_type", resource_type.to_lowercase())
            .with_partition_key(subscription_id)
            .with_filter(equals("subscription_id", subscription_id))
            .with_filter(equals("resource_type", resource_type.to_lowercase())),
        }
    }

    /// Case-insensitive substring search on the resource name.
    pub fn search_by_name(&self, subscription_id: &str, fragment: &str) -> DocumentQuery {
        let fragment = fragment.to_lowercase();
        DocumentQuery::new("SELECT * FROM c WHERE CONTAINS(LOWER(c.resource_name), @fragment)")
            .with_parameter("@fragment", fragment.clone())
            .with_partition_key(subscription_id)
            .with_filter(FieldFilter::ContainsIgnoreCase {
                field: "resource_name".to_string(),
                fragment,
            })
    }

    /// Resources carrying `tags[key] == value`.
    pub fn by_tag(&self, subscription_id: &str, key: &str, value: &str) -> DocumentQuery {
        DocumentQuery::new("SELECT * FROM c WHERE c.tags[@tag_key] = @tag_value")
            .with_parameter("@tag_key", key)
            .with_parameter("@tag_value", value)
            .with_partition_key(subscription_id)
            .with_filter(FieldFilter::TagEquals {
                key: key.to_string(),
                value: value.to_string(),
            })
    }

    /// One document by id. Executed as a point read.
    pub fn relationship_lookup(&self, subscription_id: &str, resource_id: &str) -> DocumentQuery {
        DocumentQuery::new("SELECT * FROM c WHERE c.id = @id")
            .with_parameter("@id", resource_id)
            .with_partition_key(subscription_id)
            .with_filter(equals("id", resource_id))
    }

    /// Type and location, in composite-index order.
    pub fn by_type_and_location(
        &self,
        subscription_id: &str,
        resource_type: &str,
        location: &str,
    ) -> DocumentQuery {
        DocumentQuery::new(
            "SELECT * FROM c WHERE c.subscription_id = @subscription_id AND c.resource_type = @resource_type AND c.location = @location",
        )
        .with_parameter("@subscription_id", subscription_id)
        .with_parameter("@resource_type", resource_type.to_lowercase())
        .with_parameter("@location", location.to_lowercase())
        .with_partition_key(subscription_id)
        .with_filter(equals("subscription_id", subscription_id))
        .with_filter(equals("resource_type", resource_type.to_lowercase()))
        .with_filter(equals("location", location.to_lowercase()))
    }

    /// Document count per resource type.
    pub fn count_by_type(&self, subscription_id: &str) -> DocumentQuery {
        let mut query = DocumentQuery::new(
            "SELECT c.resource_type, COUNT(1) AS count FROM c GROUP BY c.resource_type",
        )
        .with_partition_key(subscription_id);
        query.group_count = Some("resource_type".to_string());
        query
    }

    /// Documents seen at or after `since`.
    pub fn changed_since(&self, subscription_id: &str, since: DateTime<Utc>) -> DocumentQuery {
        let since = since.to_rfc3339_opts(SecondsFormat::AutoSi, true);
        DocumentQuery::new("SELECT * FROM c WHERE c.last_seen >= @since")
            .with_parameter("@since", since.clone())
            .with_partition_key(subscription_id)
            .with_filter(FieldFilter::GreaterOrEqual {
                field: "last_seen".to_string(),
                value: json!(since),
            })
    }

    /// One type across every subscription. Fans out over all partitions.
    pub fn all_subscriptions_by_type(&self, resource_type: &str) -> DocumentQuery {
        DocumentQuery::new("SELECT * FROM c WHERE c.resource_type = @resource_type")
            .with_parameter("@resource_type", resource_type.to_lowercase())
            .with_filter(equals("resource_type", resource_type.to_lowercase()))
    }

    /// Adds `ORDER BY c.{field}`.
    pub fn ordered(mut query: DocumentQuery, field: &str, order: SortOrder) -> DocumentQuery {
        query.order_by = Some((field.to_string(), order));
        query
    }

    /// Adds `OFFSET {offset} LIMIT {limit}`.
    pub fn paged(mut query: DocumentQuery, offset: usize, limit: usize) -> DocumentQuery {
        query.offset = Some(offset);
        query.limit = Some(limit);
        query
    }

    /// Runs a query, using a point read when the query is a single id
    /// equality inside one partition.
    pub async fn execute(
        &self,
        store: &dyn DocumentStore,
        query: &DocumentQuery,
    ) -> StoreResult<QueryResponse> {
        if let Some((partition_key, id)) = point_read_target(query) {
            let hit = store.read(&self.container, partition_key, id).await?;
            return Ok(match hit {
                Some(stored) => QueryResponse {
                    request_charge: stored.request_charge,
                    documents: vec![stored.body],
                    continuation: None,
                },
                None => QueryResponse {
                    documents: Vec::new(),
                    request_charge: POINT_READ_MISS_CHARGE,
                    continuation: None,
                },
            });
        }
        store.query(&self.container, query).await
    }
}

/// `(partition_key, id)` when the query can be served by a point read.
pub fn point_read_target(query: &DocumentQuery) -> Option<(&str, &str)> {
    let partition_key = query.partition_key.as_deref()?;
    match query.filters.as_slice() {
        [FieldFilter::Equals { field, value }] if field == "id" && query.group_count.is_none() => {
            value.as_str().map(|id| (partition_key, id))
        }
        _ => None,
    }
}
