//! Read facade used by tool callers.
//!
//! Every call consults the rollout controller first: a feature that is
//! disabled or has an open circuit is skipped rather than failing the call.

use crate::cache::CacheFilters;
use crate::context::InventoryContext;
use crate::models::{RelationshipEdge, ResourceDocument};
use chrono::Utc;
use iw_policy::Feature;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::{debug, error, instrument, warn};

/// Parameters passed to a tool, keyed by name.
pub type ToolParameters = Map<String, Value>;

/// Set when a resource name matched more than one cached resource.
pub const DISAMBIGUATION_FLAG: &str = "_disambiguation_required";
/// Candidate resources listed alongside [`DISAMBIGUATION_FLAG`].
pub const MATCHES_FIELD: &str = "_matches";

/// Serves resource reads and parameter resolution from the cache, falling
/// back to live discovery.
#[derive(Clone)]
pub struct InventoryClient {
    context: Arc<InventoryContext>,
}

impl InventoryClient {
    pub fn new(context: Arc<InventoryContext>) -> Self {
        Self { context }
    }

    pub fn context(&self) -> &Arc<InventoryContext> {
        &self.context
    }

    fn available(&self, feature: Feature) -> bool {
        self.context.rollout().is_available(feature)
    }

    /// Fills missing `subscription_id` and `resource_group` parameters.
    ///
    /// Supplied values are never overwritten. The resource group comes from
    /// a name lookup over cached resources: one match fills it, several
    /// matches add a disambiguation list instead, none falls back to the
    /// configured default.
    #[instrument(skip(self, params))]
    pub async fn resolve_tool_parameters(
        &self,
        tool_name: &str,
        mut params: ToolParameters,
    ) -> ToolParameters {
        let config = self.context.config();
        if !has_value(&params, "subscription_id") {
            if let Some(sub) = &config.subscription_id {
                params.insert("subscription_id".to_string(), json!(sub));
            }
        }

        if !self.available(Feature::ParameterResolution) {
            debug!("Parameter resolution unavailable");
            return params;
        }
        if has_value(&params, "resource_group") {
            return params;
        }

        let name = string_param(&params, "resource_name").or_else(|| string_param(&params, "name"));
        let matches = match &name {
            Some(name) => {
                let resource_type = string_param(&params, "resource_type").map(|t| t.to_lowercase());
                self.context
                    .cache()
                    .find_documents(|d| {
                        d.resource_name.eq_ignore_ascii_case(name)
                            && resource_type.as_ref().map_or(true, |t| &d.resource_type == t)
                    })
                    .await
            }
            None => Vec::new(),
        };

        match matches.as_slice() {
            [] => {
                if let Some(group) = &config.resource_group {
                    params.insert("resource_group".to_string(), json!(group));
                }
            }
            [only] => {
                params.insert("resource_group".to_string(), json!(only.resource_group));
                if !has_value(&params, "subscription_id") {
                    params.insert("subscription_id".to_string(), json!(only.subscription_id));
                }
            }
            several => {
                debug!(matches = several.len(), "Resource name is ambiguous");
                params.insert(DISAMBIGUATION_FLAG.to_string(), json!(true));
                params.insert(
                    MATCHES_FIELD.to_string(),
                    Value::Array(several.iter().map(match_summary).collect()),
                );
            }
        }

        self.context
            .rollout()
            .record_success(Feature::ParameterResolution);
        params
    }

    /// Resources of one type, cache first.
    ///
    /// `refresh` bypasses the cache. On a miss the discovery engine is asked
    /// (when configured and available) and its result is written through.
    /// Any failure degrades to an empty list.
    #[instrument(skip(self, filters))]
    pub async fn get_resources(
        &self,
        resource_type: &str,
        subscription_id: Option<&str>,
        filters: Option<&CacheFilters>,
        refresh: bool,
    ) -> Vec<ResourceDocument> {
        let Some(sub) = subscription_id
            .map(str::to_string)
            .or_else(|| self.context.config().subscription_id.clone())
        else {
            warn!("No subscription supplied or configured");
            return Vec::new();
        };
        let resource_type = resource_type.to_lowercase();
        let filters = filters.filter(|f| !f.is_empty());
        let cache = self.context.cache();
        let rollout = self.context.rollout();

        if !refresh && self.available(Feature::Reads) {
            let fast = self.available(Feature::FastPath);
            if fast {
                if let Some(hit) = cache.get(&sub, &resource_type, filters).await {
                    rollout.record_success(Feature::FastPath);
                    return hit;
                }
            }
            if !fast || filters.is_some() {
                if let Some(all) = cache.get(&sub, &resource_type, None).await {
                    rollout.record_success(Feature::Reads);
                    return apply_filters(all, filters);
                }
            }
        }

        let Some(engine) = self.context.engine() else {
            debug!("No discovery engine, returning empty result");
            return Vec::new();
        };
        if !self.available(Feature::Discovery) {
            debug!("Discovery unavailable, returning empty result");
            return Vec::new();
        }

        match engine.full_discovery(&sub, Some(&resource_type)).await {
            Ok(documents) => {
                rollout.record_success(Feature::Discovery);
                cache.set(&sub, &resource_type, documents.clone()).await;
                let filtered = apply_filters(documents, filters);
                if filters.is_some() {
                    cache
                        .set_with_filters(&sub, &resource_type, filters, filtered.clone())
                        .await;
                }
                filtered
            }
            Err(e) => {
                error!(subscription_id = %sub, error = %e, "Discovery for read failed");
                rollout.record_failure(Feature::Discovery, &e.to_string());
                Vec::new()
            }
        }
    }

    /// Whether a resource with this name is known, ignoring case.
    #[instrument(skip(self))]
    pub async fn check_resource_exists(
        &self,
        resource_name: &str,
        resource_type: Option<&str>,
        subscription_id: Option<&str>,
    ) -> bool {
        let resource_type = resource_type.map(str::to_lowercase);
        let matches = |d: &ResourceDocument| {
            d.resource_name.eq_ignore_ascii_case(resource_name)
                && resource_type.as_ref().map_or(true, |t| &d.resource_type == t)
                && subscription_id.map_or(true, |s| d.subscription_id.eq_ignore_ascii_case(s))
        };

        if self.available(Feature::Reads)
            && !self.context.cache().find_documents(&matches).await.is_empty()
        {
            return true;
        }

        match &resource_type {
            Some(t) => self
                .get_resources(t, subscription_id, None, false)
                .await
                .iter()
                .any(|d| matches(d)),
            None => false,
        }
    }

    /// Relationship edges around a resource, up to `depth` hops.
    #[instrument(skip(self))]
    pub async fn get_resource_relationships(
        &self,
        resource_id: &str,
        depth: u8,
    ) -> Vec<RelationshipEdge> {
        let Some(engine) = self.context.engine() else {
            debug!("No discovery engine, no relationships");
            return Vec::new();
        };
        if !self.available(Feature::Discovery) {
            debug!("Discovery unavailable, no relationships");
            return Vec::new();
        }

        let resource = self
            .context
            .cache()
            .find_documents(|d| d.same_resource(resource_id))
            .await
            .into_iter()
            .next()
            .unwrap_or_else(|| {
                let default_sub = self
                    .context
                    .config()
                    .subscription_id
                    .clone()
                    .unwrap_or_default();
                ResourceDocument::from_id(resource_id, &default_sub, Utc::now())
            });

        engine.extract_relationships(&resource, depth).await
    }
}

fn string_param(params: &ToolParameters, name: &str) -> Option<String> {
    params
        .get(name)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn has_value(params: &ToolParameters, name: &str) -> bool {
    match params.get(name) {
        None | Some(Value::Null) => false,
        Some(Value::String(s)) => !s.trim().is_empty(),
        Some(_) => true,
    }
}

fn match_summary(document: &ResourceDocument) -> Value {
    json!({
        "id": document.id,
        "resource_name": document.resource_name,
        "resource_group": document.resource_group,
        "subscription_id": document.subscription_id,
        "resource_type": document.resource_type,
        "location": document.location,
    })
}

/// Keeps documents matching every filter. `tag:<key>` matches a tag value;
/// other keys match a field or selected property, ignoring case.
fn apply_filters(
    documents: Vec<ResourceDocument>,
    filters: Option<&CacheFilters>,
) -> Vec<ResourceDocument> {
    let Some(filters) = filters else {
        return documents;
    };
    documents
        .into_iter()
        .filter(|d| filters.iter().all(|(k, v)| filter_matches(d, k, v)))
        .collect()
}

fn filter_matches(document: &ResourceDocument, key: &str, expected: &str) -> bool {
    if let Some(tag) = key.strip_prefix("tag:") {
        return document.tags.get(tag).is_some_and(|v| v == expected);
    }
    let actual = match key {
        "resource_group" => Some(document.resource_group.clone()),
        "location" => Some(document.location.clone()),
        "name" | "resource_name" => Some(document.resource_name.clone()),
        other => document.selected_properties.get(other).map(|v| match v {
            Value::String(s) => s.clone(),
            v => v.to_string(),
        }),
    };
    actual.is_some_and(|a| a.eq_ignore_ascii_case(expected))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InventoryConfig;
    use crate::discovery::DiscoveryEngine;
    use iw_connectors::testing::{sample_site_row, sample_vm_row};
    use iw_connectors::{ConnectorError, MockResourceGraph, MockSubscriptionSource};
    use iw_policy::RolloutStage;

    const VM: &str = "microsoft.compute/virtualmachines";
    const SITE: &str = "microsoft.web/sites";

    fn doc(row: Value) -> ResourceDocument {
        ResourceDocument::from_graph_row(&row, "sub-1", Utc::now()).unwrap()
    }

    fn client_at(stage: u8, rows: Vec<Value>) -> (InventoryClient, Arc<MockResourceGraph>) {
        let mut config = InventoryConfig::default();
        config.subscription_id = Some("sub-1".to_string());
        config.resource_group = Some("rg-default".to_string());
        config.rollout.stage = RolloutStage::new(stage).unwrap();
        let graph = Arc::new(MockResourceGraph::with_rows("graph", rows));
        let engine = DiscoveryEngine::new(
            graph.clone(),
            Arc::new(MockSubscriptionSource::with_ids("subs", &["sub-1"])),
        );
        let context = InventoryContext::new(config).with_discovery(engine);
        (InventoryClient::new(Arc::new(context)), graph)
    }

    fn params(pairs: Value) -> ToolParameters {
        pairs.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_resolution_single_match() {
        let (client, _) = client_at(3, vec![]);
        client
            .context()
            .cache()
            .set("sub-1", SITE, vec![doc(sample_site_row("sub-1", "rg-web", "shop"))])
            .await;

        let resolved = client
            .resolve_tool_parameters("restart_app", params(json!({"resource_name": "SHOP"})))
            .await;
        assert_eq!(resolved["resource_group"], "rg-web");
        assert_eq!(resolved["subscription_id"], "sub-1");
        assert!(!resolved.contains_key(DISAMBIGUATION_FLAG));
    }

    #[tokio::test]
    async fn test_resolution_ambiguous_name() {
        let (client, _) = client_at(3, vec![]);
        client
            .context()
            .cache()
            .set(
                "sub-1",
                SITE,
                vec![
                    doc(sample_site_row("sub-1", "rg-a", "shop")),
                    doc(sample_site_row("sub-1", "rg-b", "shop")),
                ],
            )
            .await;

        let resolved = client
            .resolve_tool_parameters("restart_app", params(json!({"name": "shop"})))
            .await;
        assert_eq!(resolved[DISAMBIGUATION_FLAG], true);
        let matches = resolved[MATCHES_FIELD].as_array().unwrap();
        assert_eq!(matches.len(), 2);
        assert!(matches[0].get("location").is_some());
        assert!(!resolved.contains_key("resource_group"));
    }

    fn client_with_expired_l1() -> InventoryClient {
        let mut config = InventoryConfig::default();
        config.subscription_id = Some("sub-1".to_string());
        config.resource_group = Some("rg-default".to_string());
        config.cache.l1_ttl_secs = 0;
        config.rollout.stage = RolloutStage::new(3).unwrap();
        let context = InventoryContext::new(config)
            .with_store(Arc::new(iw_connectors::InMemoryDocumentStore::new("l2")));
        InventoryClient::new(Arc::new(context))
    }

    #[tokio::test]
    async fn test_resolution_reads_l2_when_l1_expired() {
        let client = client_with_expired_l1();
        client
            .context()
            .cache()
            .set(
                "sub-1",
                SITE,
                vec![
                    doc(sample_site_row("sub-1", "rg-a", "shop")),
                    doc(sample_site_row("sub-1", "rg-b", "shop")),
                    doc(sample_site_row("sub-1", "rg-c", "blog")),
                ],
            )
            .await;
        assert_eq!(client.context().cache().statistics().await.l1_entries, 0);

        let resolved = client
            .resolve_tool_parameters("restart_app", params(json!({"resource_name": "shop"})))
            .await;
        assert_eq!(resolved[DISAMBIGUATION_FLAG], true);
        assert_eq!(resolved[MATCHES_FIELD].as_array().unwrap().len(), 2);
        assert!(!resolved.contains_key("resource_group"));

        let resolved = client
            .resolve_tool_parameters("restart_app", params(json!({"resource_name": "blog"})))
            .await;
        assert_eq!(resolved["resource_group"], "rg-c");

        assert!(client.check_resource_exists("BLOG", None, None).await);
        assert!(!client.check_resource_exists("wiki", None, None).await);
    }

    #[tokio::test]
    async fn test_resolution_defaults_and_preserves_supplied_values() {
        let (client, _) = client_at(3, vec![]);
        let resolved = client
            .resolve_tool_parameters("list", params(json!({"resource_name": "unknown"})))
            .await;
        assert_eq!(resolved["resource_group"], "rg-default");

        let resolved = client
            .resolve_tool_parameters(
                "list",
                params(json!({"subscription_id": "sub-x", "resource_group": "rg-x"})),
            )
            .await;
        assert_eq!(resolved["subscription_id"], "sub-x");
        assert_eq!(resolved["resource_group"], "rg-x");
    }

    #[tokio::test]
    async fn test_resolution_gated_to_subscription_fill() {
        let (client, _) = client_at(2, vec![]);
        let resolved = client
            .resolve_tool_parameters("list", params(json!({"resource_name": "unknown"})))
            .await;
        assert_eq!(resolved["subscription_id"], "sub-1");
        assert!(!resolved.contains_key("resource_group"));
    }

    #[tokio::test]
    async fn test_get_resources_discovers_then_serves_from_cache() {
        let (client, graph) = client_at(
            2,
            vec![
                sample_vm_row("sub-1", "rg-a", "vm-1"),
                sample_vm_row("sub-1", "rg-b", "vm-2"),
            ],
        );

        let first = client.get_resources(VM, None, None, false).await;
        assert_eq!(first.len(), 2);
        assert_eq!(graph.query_count(), 1);

        let second = client.get_resources(VM, Some("sub-1"), None, false).await;
        assert_eq!(second.len(), 2);
        assert_eq!(graph.query_count(), 1);

        let mut filters = CacheFilters::new();
        filters.insert("resource_group".to_string(), "RG-B".to_string());
        let filtered = client.get_resources(VM, None, Some(&filters), false).await;
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].resource_name, "vm-2");

        client.get_resources(VM, None, None, true).await;
        assert_eq!(graph.query_count(), 2);
    }

    #[tokio::test]
    async fn test_get_resources_degrades_on_discovery_failure() {
        let (client, graph) = client_at(2, vec![]);
        graph
            .set_failure(Some(ConnectorError::ConnectionFailed("down".into())))
            .await;
        assert!(client.get_resources(VM, None, None, false).await.is_empty());
        let status = client.context().rollout().status();
        let discovery = status
            .features
            .iter()
            .find(|f| f.feature == Feature::Discovery)
            .unwrap();
        assert!(discovery.error_rate > 0.0);
    }

    #[tokio::test]
    async fn test_fast_path_returns_filtered_entry_directly() {
        let (client, graph) = client_at(4, vec![sample_vm_row("sub-1", "rg-a", "vm-1")]);
        let mut filters = CacheFilters::new();
        filters.insert("location".to_string(), "eastus".to_string());

        let discovered = client.get_resources(VM, None, Some(&filters), false).await;
        assert_eq!(discovered.len(), 1);
        let cached = client.get_resources(VM, None, Some(&filters), false).await;
        assert_eq!(cached, discovered);
        assert_eq!(graph.query_count(), 1);
    }

    #[tokio::test]
    async fn test_check_resource_exists() {
        let (client, _) = client_at(2, vec![sample_vm_row("sub-1", "rg-a", "vm-1")]);
        assert!(client.check_resource_exists("VM-1", Some(VM), None).await);
        assert!(client.check_resource_exists("vm-1", None, None).await);
        assert!(!client.check_resource_exists("vm-9", None, None).await);
        assert!(!client.check_resource_exists("vm-1", None, Some("sub-2")).await);
    }

    #[tokio::test]
    async fn test_relationships_without_cached_document() {
        let vm = sample_vm_row("sub-1", "rg-a", "vm-1");
        let id = vm["id"].as_str().unwrap().to_string();
        let (client, _) = client_at(1, vec![vm]);
        let edges = client.get_resource_relationships(&id, 1).await;
        assert_eq!(edges.len(), 2);
    }

    #[tokio::test]
    async fn test_no_engine_yields_empty() {
        let context = InventoryContext::new(InventoryConfig::default());
        let client = InventoryClient::new(Arc::new(context));
        assert!(client.get_resources(VM, Some("sub-1"), None, false).await.is_empty());
        assert!(client.get_resource_relationships("/subscriptions/s", 1).await.is_empty());
    }
}
