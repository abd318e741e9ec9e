//! Subscription and resource discovery against the Resource Graph.

use super::error::{DiscoveryError, DiscoveryResult};
use super::kql;
use crate::models::{ChangeSet, ChangeType, ResourceDocument, Subscription};
use chrono::{DateTime, SecondsFormat, Utc};
use iw_connectors::{
    ConnectorHealth, ConnectorResult, GraphQueryRequest, ResourceGraph, ResourceInspector,
    SubscriptionSource,
};
use iw_observability::metrics::{record_discovery_page, record_discovery_resources};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

/// Paging limits for graph queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Rows requested per page.
    pub page_size: u32,
    /// Pages followed before a listing is cut short.
    pub max_pages: usize,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            page_size: 1000,
            max_pages: 1000,
        }
    }
}

/// Finds subscriptions and resources, tracks changes between scans, and
/// resolves relationships and live properties for single resources.
pub struct DiscoveryEngine {
    pub(super) graph: Arc<dyn ResourceGraph>,
    subscriptions: Arc<dyn SubscriptionSource>,
    pub(super) inspector: Option<Arc<dyn ResourceInspector>>,
    config: DiscoveryConfig,
}

impl DiscoveryEngine {
    /// Creates an engine without live inspection.
    pub fn new(graph: Arc<dyn ResourceGraph>, subscriptions: Arc<dyn SubscriptionSource>) -> Self {
        Self {
            graph,
            subscriptions,
            inspector: None,
            config: DiscoveryConfig::default(),
        }
    }

    /// Adds the connector used by `enrich_properties`.
    pub fn with_inspector(mut self, inspector: Arc<dyn ResourceInspector>) -> Self {
        self.inspector = Some(inspector);
        self
    }

    pub fn with_config(mut self, config: DiscoveryConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    /// Lists every subscription the credential can reach.
    #[instrument(skip(self))]
    pub async fn list_subscriptions(&self) -> DiscoveryResult<Vec<Subscription>> {
        let raw = self.subscriptions.list_subscriptions().await.map_err(|e| {
            error!(error = %e, "Subscription listing failed");
            DiscoveryError::Subscriptions(e)
        })?;

        let now = Utc::now();
        let subscriptions: Vec<Subscription> = raw
            .into_iter()
            .map(|s| Subscription::from_raw(s, now))
            .collect();
        info!(count = subscriptions.len(), "Listed subscriptions");
        Ok(subscriptions)
    }

    /// Lists every resource in a subscription, optionally of one type.
    #[instrument(skip(self))]
    pub async fn full_discovery(
        &self,
        subscription_id: &str,
        resource_type: Option<&str>,
    ) -> DiscoveryResult<Vec<ResourceDocument>> {
        if subscription_id.trim().is_empty() {
            return Err(DiscoveryError::InvalidInput(
                "subscription_id must not be empty".to_string(),
            ));
        }

        let request = match resource_type {
            Some(t) => GraphQueryRequest::new(vec![subscription_id.to_string()], kql::full_listing_by_type())
                .with_parameter("resource_type", t),
            None => GraphQueryRequest::new(vec![subscription_id.to_string()], kql::full_listing()),
        };

        let rows = self.fetch_all(subscription_id, request).await.map_err(|e| {
            error!(subscription_id = %subscription_id, error = %e, "Full discovery failed");
            e
        })?;

        let now = Utc::now();
        let documents = normalise_rows(&rows, subscription_id, now);
        record_discovery_resources(subscription_id, documents.len());
        info!(
            subscription_id = %subscription_id,
            resources = documents.len(),
            "Full discovery complete"
        );
        Ok(documents)
    }

    /// Finds resources created, modified or deleted since the last scan.
    ///
    /// Deletions are only detected when `cached_ids` is non-empty: the
    /// current id set is compared against it, ignoring case.
    #[instrument(skip(self, cached_ids))]
    pub async fn incremental_discovery(
        &self,
        subscription_id: &str,
        last_scan_time: DateTime<Utc>,
        cached_ids: Option<&HashSet<String>>,
    ) -> DiscoveryResult<ChangeSet> {
        if subscription_id.trim().is_empty() {
            return Err(DiscoveryError::InvalidInput(
                "subscription_id must not be empty".to_string(),
            ));
        }

        let now = Utc::now();
        let known: HashSet<String> = cached_ids
            .map(|ids| ids.iter().map(|id| id.to_lowercase()).collect())
            .unwrap_or_default();

        let request = GraphQueryRequest::new(vec![subscription_id.to_string()], kql::changed_since())
            .with_parameter(
                "since",
                last_scan_time.to_rfc3339_opts(SecondsFormat::Secs, true),
            );
        let rows = self.fetch_all(subscription_id, request).await.map_err(|e| {
            error!(subscription_id = %subscription_id, error = %e, "Change query failed");
            e
        })?;

        let mut changes = ChangeSet::empty(now);
        for document in normalise_rows(&rows, subscription_id, now) {
            let change_type = if known.contains(&document.id.to_lowercase()) {
                ChangeType::Modified
            } else {
                ChangeType::Created
            };
            changes.push(document, change_type);
        }

        if let Some(cached) = cached_ids.filter(|ids| !ids.is_empty()) {
            let request = GraphQueryRequest::new(vec![subscription_id.to_string()], kql::ID_LISTING);
            let rows = self.fetch_all(subscription_id, request).await.map_err(|e| {
                error!(subscription_id = %subscription_id, error = %e, "Id listing failed");
                e
            })?;
            let current: HashSet<String> = rows
                .iter()
                .filter_map(|row| row.get("id").and_then(Value::as_str))
                .map(str::to_lowercase)
                .collect();

            let mut gone: Vec<&String> = cached
                .iter()
                .filter(|id| !current.contains(&id.to_lowercase()))
                .collect();
            gone.sort();
            for id in gone {
                changes.push(
                    ResourceDocument::from_id(id, subscription_id, now),
                    ChangeType::Deleted,
                );
            }
        }

        info!(
            subscription_id = %subscription_id,
            created = changes.created.len(),
            modified = changes.modified.len(),
            deleted = changes.deleted.len(),
            "Incremental discovery complete"
        );
        Ok(changes)
    }

    /// Health of the Resource Graph connector.
    pub async fn health_check(&self) -> ConnectorResult<ConnectorHealth> {
        self.graph.health_check().await
    }

    /// Runs a query and follows skip tokens until exhausted.
    ///
    /// Reaching the page cap with a token outstanding is an error: a partial
    /// listing would report live resources as deleted.
    async fn fetch_all(
        &self,
        subscription_id: &str,
        request: GraphQueryRequest,
    ) -> DiscoveryResult<Vec<Value>> {
        let mut request = request.with_top(self.config.page_size);
        let mut rows = Vec::new();
        let mut pages = 0usize;

        loop {
            let page = self
                .graph
                .query(&request)
                .await
                .map_err(|e| DiscoveryError::query(subscription_id, e))?;
            pages += 1;
            record_discovery_page();
            debug!(page = pages, rows = page.rows.len(), "Fetched graph page");
            rows.extend(page.rows);

            match page.skip_token {
                Some(token) if pages < self.config.max_pages => {
                    request = request.next_page(token);
                }
                Some(_) => {
                    warn!(
                        subscription_id = %subscription_id,
                        pages,
                        "Page limit reached with pages outstanding"
                    );
                    return Err(DiscoveryError::Truncated {
                        subscription_id: subscription_id.to_string(),
                        pages,
                    });
                }
                None => break,
            }
        }

        Ok(rows)
    }
}

/// Normalises rows, skipping any that cannot become a document.
fn normalise_rows(rows: &[Value], subscription_id: &str, now: DateTime<Utc>) -> Vec<ResourceDocument> {
    rows.iter()
        .filter_map(|row| match ResourceDocument::from_graph_row(row, subscription_id, now) {
            Ok(document) => Some(document),
            Err(e) => {
                warn!(subscription_id = %subscription_id, error = %e, "Skipping malformed row");
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use iw_connectors::testing::{assert_unhealthy, sample_site_row, sample_vm_row, sample_vnet_row};
    use iw_connectors::{ConnectorError, MockResourceGraph, MockSubscriptionSource};
    use serde_json::json;

    fn engine_with(graph: Arc<MockResourceGraph>) -> DiscoveryEngine {
        let subs = Arc::new(MockSubscriptionSource::with_ids("subs", &["sub-1", "sub-2"]));
        DiscoveryEngine::new(graph, subs)
    }

    fn with_change_time(mut row: Value, at: &str) -> Value {
        row["changeTime"] = json!(at);
        row
    }

    #[tokio::test]
    async fn test_list_subscriptions() {
        let engine = engine_with(Arc::new(MockResourceGraph::new("graph")));
        let subs = engine.list_subscriptions().await.unwrap();
        assert_eq!(subs.len(), 2);
        assert!(subs.iter().all(|s| s.is_enabled()));
    }

    #[tokio::test]
    async fn test_list_subscriptions_propagates_errors() {
        let source = Arc::new(MockSubscriptionSource::with_ids("subs", &[]));
        source
            .set_failure(Some(ConnectorError::AuthenticationFailed("expired".into())))
            .await;
        let engine = DiscoveryEngine::new(Arc::new(MockResourceGraph::new("graph")), source);
        assert!(matches!(
            engine.list_subscriptions().await,
            Err(DiscoveryError::Subscriptions(_))
        ));
    }

    #[tokio::test]
    async fn test_full_discovery_follows_pages() {
        let rows = (0..7)
            .map(|i| sample_vm_row("sub-1", "rg-a", &format!("vm-{}", i)))
            .collect();
        let graph = Arc::new(MockResourceGraph::with_rows("graph", rows));
        graph.set_page_size(3).await;
        let engine = engine_with(graph.clone());

        let docs = engine.full_discovery("sub-1", None).await.unwrap();
        assert_eq!(docs.len(), 7);
        assert_eq!(graph.query_count(), 3);
        assert!(docs
            .iter()
            .all(|d| d.resource_type == "microsoft.compute/virtualmachines"));
    }

    #[tokio::test]
    async fn test_full_discovery_type_filter_and_scope() {
        let graph = Arc::new(MockResourceGraph::with_rows(
            "graph",
            vec![
                sample_vm_row("sub-1", "rg-a", "vm-1"),
                sample_site_row("sub-1", "rg-a", "site-1"),
                sample_vm_row("sub-2", "rg-b", "vm-2"),
            ],
        ));
        let engine = engine_with(graph);

        let docs = engine
            .full_discovery("sub-1", Some("Microsoft.Compute/virtualMachines"))
            .await
            .unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].resource_name, "vm-1");
    }

    #[tokio::test]
    async fn test_full_discovery_page_cap() {
        let rows = (0..10)
            .map(|i| sample_vm_row("sub-1", "rg-a", &format!("vm-{}", i)))
            .collect();
        let graph = Arc::new(MockResourceGraph::with_rows("graph", rows));
        graph.set_page_size(2).await;
        let engine = engine_with(graph.clone()).with_config(DiscoveryConfig {
            page_size: 2,
            max_pages: 2,
        });

        match engine.full_discovery("sub-1", None).await {
            Err(DiscoveryError::Truncated { subscription_id, pages }) => {
                assert_eq!(subscription_id, "sub-1");
                assert_eq!(pages, 2);
            }
            other => panic!("expected truncation, got {:?}", other),
        }
        assert_eq!(graph.query_count(), 2);

        // Exactly filling the cap is not a truncation.
        let engine = engine.with_config(DiscoveryConfig {
            page_size: 2,
            max_pages: 5,
        });
        assert_eq!(engine.full_discovery("sub-1", None).await.unwrap().len(), 10);
    }

    #[tokio::test]
    async fn test_incremental_truncated_id_listing_reports_no_deletes() {
        let rows: Vec<Value> = (0..6)
            .map(|i| sample_vm_row("sub-1", "rg-a", &format!("vm-{}", i)))
            .collect();
        let cached: HashSet<String> = rows
            .iter()
            .map(|r| r["id"].as_str().unwrap().to_string())
            .collect();
        let graph = Arc::new(MockResourceGraph::with_rows("graph", rows));
        graph.set_page_size(2).await;
        let engine = engine_with(graph).with_config(DiscoveryConfig {
            page_size: 2,
            max_pages: 2,
        });

        let since = Utc::now() - chrono::Duration::hours(1);
        let result = engine
            .incremental_discovery("sub-1", since, Some(&cached))
            .await;
        assert!(matches!(result, Err(DiscoveryError::Truncated { .. })));
    }

    #[tokio::test]
    async fn test_full_discovery_skips_rows_without_id() {
        let graph = Arc::new(MockResourceGraph::with_rows(
            "graph",
            vec![
                sample_vm_row("sub-1", "rg-a", "vm-1"),
                json!({"name": "orphan", "type": "x/y", "subscriptionId": "sub-1"}),
            ],
        ));
        let docs = engine_with(graph).full_discovery("sub-1", None).await.unwrap();
        assert_eq!(docs.len(), 1);
    }

    #[tokio::test]
    async fn test_full_discovery_failure_is_fatal() {
        let graph = Arc::new(MockResourceGraph::new("graph"));
        graph
            .set_failure(Some(ConnectorError::RateLimited(30)))
            .await;
        let result = engine_with(graph).full_discovery("sub-1", None).await;
        match result {
            Err(DiscoveryError::Query { subscription_id, .. }) => assert_eq!(subscription_id, "sub-1"),
            other => panic!("expected query error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_full_discovery_rejects_empty_subscription() {
        let engine = engine_with(Arc::new(MockResourceGraph::new("graph")));
        assert!(matches!(
            engine.full_discovery("  ", None).await,
            Err(DiscoveryError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_incremental_classifies_changes() {
        let vm1 = sample_vm_row("sub-1", "rg-a", "vm-1");
        let vm1_id = vm1["id"].as_str().unwrap().to_string();
        let graph = Arc::new(MockResourceGraph::with_rows(
            "graph",
            vec![
                with_change_time(vm1, "2024-03-02T00:00:00Z"),
                with_change_time(sample_vm_row("sub-1", "rg-a", "vm-new"), "2024-03-02T00:00:00Z"),
                with_change_time(sample_vnet_row("sub-1", "rg-a", "vnet-1"), "2024-02-01T00:00:00Z"),
            ],
        ));
        let engine = engine_with(graph);

        let vnet_id = iw_connectors::testing::resource_id(
            "sub-1",
            "rg-a",
            "Microsoft.Network/virtualNetworks",
            "vnet-1",
        );
        let gone_id = iw_connectors::testing::resource_id(
            "sub-1",
            "rg-a",
            "Microsoft.Compute/virtualMachines",
            "vm-gone",
        );
        // Cached ids differ in case from the live ones.
        let cached: HashSet<String> = [vm1_id.to_uppercase(), vnet_id, gone_id.clone()]
            .into_iter()
            .collect();

        let since = DateTime::parse_from_rfc3339("2024-03-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let changes = engine
            .incremental_discovery("sub-1", since, Some(&cached))
            .await
            .unwrap();

        assert_eq!(changes.modified.len(), 1);
        assert!(changes.modified[0].resource.same_resource(&vm1_id));
        assert_eq!(changes.created.len(), 1);
        assert_eq!(changes.created[0].resource.resource_name, "vm-new");
        assert_eq!(changes.deleted.len(), 1);
        assert_eq!(changes.deleted[0].resource.id, gone_id);
        assert_eq!(changes.deleted[0].change_type, ChangeType::Deleted);
        assert_eq!(changes.deleted[0].resource.resource_name, "vm-gone");
    }

    #[tokio::test]
    async fn test_incremental_without_cache_reports_no_deletes() {
        let graph = Arc::new(MockResourceGraph::with_rows(
            "graph",
            vec![with_change_time(
                sample_vm_row("sub-1", "rg-a", "vm-1"),
                "2024-03-02T00:00:00Z",
            )],
        ));
        let engine = engine_with(graph.clone());
        let since = DateTime::parse_from_rfc3339("2024-03-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);

        let changes = engine.incremental_discovery("sub-1", since, None).await.unwrap();
        assert_eq!(changes.created.len(), 1);
        assert!(changes.deleted.is_empty());
        // No id listing was issued.
        assert_eq!(graph.query_count(), 1);

        let empty = HashSet::new();
        let changes = engine
            .incremental_discovery("sub-1", since, Some(&empty))
            .await
            .unwrap();
        assert!(changes.deleted.is_empty());
        assert_eq!(graph.query_count(), 2);
    }

    #[tokio::test]
    async fn test_health_check_delegates_to_graph() {
        let graph = Arc::new(MockResourceGraph::new("graph"));
        graph.set_healthy(false).await;
        let engine = engine_with(graph);
        assert_unhealthy(&engine.health_check().await);
    }
}
