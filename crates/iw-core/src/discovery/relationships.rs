//! Relationship extraction.
//!
//! Walks outward from a resource breadth-first. Known resource types are
//! expanded from the reference fields their schema carries; anything else
//! falls back to a lookup of resources that mention the id. Every id is
//! visited at most once, so cycles stop at the first edge that closes them.

use super::engine::DiscoveryEngine;
use super::kql;
use crate::models::{RelationshipEdge, RelationshipType, ResourceDocument, ResourceId};
use iw_connectors::{ConnectorResult, GraphQueryRequest};
use serde_json::Value;
use std::collections::{HashSet, VecDeque};
use tracing::{debug, instrument, warn};

/// Deepest traversal supported.
pub const MAX_RELATIONSHIP_DEPTH: u8 = 2;

struct Node {
    id: String,
    subscription_id: String,
    level: u8,
}

impl DiscoveryEngine {
    /// Edges reachable from `resource` within `depth` hops (clamped to 1..=2).
    ///
    /// Returns an empty list for a resource without an id or when any
    /// lookup fails.
    #[instrument(skip(self, resource), fields(resource_id = %resource.id))]
    pub async fn extract_relationships(
        &self,
        resource: &ResourceDocument,
        depth: u8,
    ) -> Vec<RelationshipEdge> {
        if resource.id.trim().is_empty() {
            warn!("Resource has no id, no relationships extracted");
            return Vec::new();
        }
        let depth = depth.clamp(1, MAX_RELATIONSHIP_DEPTH);

        match self.walk(resource, depth).await {
            Ok(edges) => {
                debug!(edges = edges.len(), depth, "Relationships extracted");
                edges
            }
            Err(e) => {
                warn!(error = %e, "Relationship lookup failed");
                Vec::new()
            }
        }
    }

    async fn walk(
        &self,
        resource: &ResourceDocument,
        depth: u8,
    ) -> ConnectorResult<Vec<RelationshipEdge>> {
        let mut visited: HashSet<String> = HashSet::new();
        visited.insert(resource.id.to_lowercase());

        let mut queue = VecDeque::new();
        queue.push_back(Node {
            id: resource.id.clone(),
            subscription_id: resource.subscription_id.clone(),
            level: 0,
        });

        let mut edges = Vec::new();
        while let Some(node) = queue.pop_front() {
            if node.level >= depth {
                continue;
            }
            for (target, relationship_type) in self.neighbours(&node).await? {
                if !visited.insert(target.to_lowercase()) {
                    continue;
                }
                let subscription_id = ResourceId::parse(&target)
                    .map(|p| p.subscription_id)
                    .unwrap_or_else(|_| node.subscription_id.clone());
                edges.push(RelationshipEdge {
                    source: node.id.clone(),
                    target: target.clone(),
                    relationship_type,
                    depth: node.level + 1,
                });
                queue.push_back(Node {
                    id: target,
                    subscription_id,
                    level: node.level + 1,
                });
            }
        }
        Ok(edges)
    }

    async fn neighbours(&self, node: &Node) -> ConnectorResult<Vec<(String, RelationshipType)>> {
        let resource_type = ResourceId::parse(&node.id)
            .map(|p| p.resource_type)
            .unwrap_or_default();

        if !is_known_type(&resource_type) {
            return self.referencing(node).await;
        }

        let request = GraphQueryRequest::new(vec![node.subscription_id.clone()], kql::RESOURCE_BY_ID)
            .with_parameter("resource_id", node.id.clone());
        let page = self.graph.query(&request).await?;
        let Some(row) = page.rows.first() else {
            return Ok(Vec::new());
        };
        let properties = row.get("properties").unwrap_or(&Value::Null);
        Ok(schema_references(&resource_type, &node.subscription_id, properties))
    }

    async fn referencing(&self, node: &Node) -> ConnectorResult<Vec<(String, RelationshipType)>> {
        let request =
            GraphQueryRequest::new(vec![node.subscription_id.clone()], kql::REFERENCING_RESOURCES)
                .with_parameter("resource_id", node.id.clone());
        let page = self.graph.query(&request).await?;
        Ok(page
            .rows
            .iter()
            .filter_map(|row| row.get("id").and_then(Value::as_str))
            .map(|id| (id.to_string(), RelationshipType::RelatedTo))
            .collect())
    }
}

const VIRTUAL_MACHINE: &str = "microsoft.compute/virtualmachines";
const NETWORK_INTERFACE: &str = "microsoft.network/networkinterfaces";
const VIRTUAL_NETWORK: &str = "microsoft.network/virtualnetworks";
const WEB_SITE: &str = "microsoft.web/sites";
const MANAGED_CLUSTER: &str = "microsoft.containerservice/managedclusters";

fn is_known_type(resource_type: &str) -> bool {
    matches!(
        resource_type,
        VIRTUAL_MACHINE | NETWORK_INTERFACE | VIRTUAL_NETWORK | WEB_SITE | MANAGED_CLUSTER
    )
}

fn ids_at<'a>(items: Option<&'a Value>, pointer: &'a str) -> impl Iterator<Item = String> + 'a {
    items
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(move |item| item.pointer(pointer).and_then(Value::as_str))
        .map(str::to_string)
}

/// References carried by the properties of a known resource type.
fn schema_references(
    resource_type: &str,
    subscription_id: &str,
    properties: &Value,
) -> Vec<(String, RelationshipType)> {
    let mut out = Vec::new();
    match resource_type {
        VIRTUAL_MACHINE => {
            for nic in ids_at(properties.pointer("/networkProfile/networkInterfaces"), "/id") {
                out.push((nic, RelationshipType::DependsOn));
            }
            if let Some(os_disk) = properties
                .pointer("/storageProfile/osDisk/managedDisk/id")
                .and_then(Value::as_str)
            {
                out.push((os_disk.to_string(), RelationshipType::AttachedTo));
            }
            for disk in ids_at(properties.pointer("/storageProfile/dataDisks"), "/managedDisk/id") {
                out.push((disk, RelationshipType::AttachedTo));
            }
        }
        NETWORK_INTERFACE => {
            for subnet in ids_at(properties.get("ipConfigurations"), "/properties/subnet/id") {
                let vnet = parent_network(&subnet);
                out.push((subnet, RelationshipType::DependsOn));
                if let Some(vnet) = vnet {
                    out.push((vnet, RelationshipType::DependsOn));
                }
            }
        }
        VIRTUAL_NETWORK => {
            for subnet in ids_at(properties.get("subnets"), "/id") {
                out.push((subnet, RelationshipType::Contains));
            }
        }
        WEB_SITE => {
            if let Some(plan) = properties.get("serverFarmId").and_then(Value::as_str) {
                out.push((plan.to_string(), RelationshipType::DependsOn));
            }
        }
        MANAGED_CLUSTER => {
            if let Some(group) = properties.get("nodeResourceGroup").and_then(Value::as_str) {
                out.push((
                    format!("/subscriptions/{}/resourceGroups/{}", subscription_id, group),
                    RelationshipType::Contains,
                ));
            }
        }
        _ => {}
    }
    out
}

/// The virtual network a subnet id belongs to.
fn parent_network(subnet_id: &str) -> Option<String> {
    subnet_id
        .to_ascii_lowercase()
        .rfind("/subnets/")
        .map(|at| subnet_id[..at].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use iw_connectors::testing::{resource_id, sample_nic_row, sample_vm_row, sample_vnet_row};
    use iw_connectors::{ConnectorError, MockResourceGraph, MockSubscriptionSource};
    use serde_json::json;
    use std::sync::Arc;

    fn engine(rows: Vec<Value>) -> (Arc<MockResourceGraph>, DiscoveryEngine) {
        let graph = Arc::new(MockResourceGraph::with_rows("graph", rows));
        let subs = Arc::new(MockSubscriptionSource::with_ids("subs", &["sub-1"]));
        (graph.clone(), DiscoveryEngine::new(graph, subs))
    }

    fn doc(row: &Value) -> ResourceDocument {
        ResourceDocument::from_graph_row(row, "sub-1", Utc::now()).unwrap()
    }

    fn targets(edges: &[RelationshipEdge]) -> Vec<String> {
        edges.iter().map(|e| e.target.clone()).collect()
    }

    fn network_rows() -> (Value, Value, Value) {
        let vnet = sample_vnet_row("sub-1", "rg-net", "vnet-1");
        let subnet = format!("{}/subnets/default", vnet["id"].as_str().unwrap());
        let vm = sample_vm_row("sub-1", "rg-net", "vm-1");
        let nic = sample_nic_row("sub-1", "rg-net", "vm-1-nic", &subnet);
        (vm, nic, vnet)
    }

    #[tokio::test]
    async fn test_vm_depth_one() {
        let (vm, nic, vnet) = network_rows();
        let (_, engine) = engine(vec![vm.clone(), nic, vnet]);

        let edges = engine.extract_relationships(&doc(&vm), 1).await;
        assert_eq!(edges.len(), 2);
        assert_eq!(edges[0].relationship_type, RelationshipType::DependsOn);
        assert!(edges[0].target.ends_with("/networkInterfaces/vm-1-nic"));
        assert_eq!(edges[1].relationship_type, RelationshipType::AttachedTo);
        assert!(edges[1].target.ends_with("/disks/vm-1-data"));
        assert!(edges.iter().all(|e| e.depth == 1));
    }

    #[tokio::test]
    async fn test_vm_depth_two_reaches_network() {
        let (vm, nic, vnet) = network_rows();
        let vnet_id = vnet["id"].as_str().unwrap().to_string();
        let (_, engine) = engine(vec![vm.clone(), nic, vnet]);

        let edges = engine.extract_relationships(&doc(&vm), 2).await;
        let second: Vec<&RelationshipEdge> = edges.iter().filter(|e| e.depth == 2).collect();
        assert!(second
            .iter()
            .any(|e| e.target.ends_with("/subnets/default") && e.source.ends_with("vm-1-nic")));
        assert!(second.iter().any(|e| e.target == vnet_id));

        let mut pairs: Vec<(String, String)> = edges
            .iter()
            .map(|e| (e.source.to_lowercase(), e.target.to_lowercase()))
            .collect();
        let total = pairs.len();
        pairs.sort();
        pairs.dedup();
        assert_eq!(pairs.len(), total);
    }

    #[tokio::test]
    async fn test_depth_is_clamped() {
        let (vm, nic, vnet) = network_rows();
        let (_, engine) = engine(vec![vm.clone(), nic, vnet]);
        let zero = engine.extract_relationships(&doc(&vm), 0).await;
        let one = engine.extract_relationships(&doc(&vm), 1).await;
        let nine = engine.extract_relationships(&doc(&vm), 9).await;
        let two = engine.extract_relationships(&doc(&vm), 2).await;
        assert_eq!(zero, one);
        assert_eq!(nine, two);
        assert!(nine.iter().all(|e| e.depth <= 2));
    }

    #[tokio::test]
    async fn test_vnet_contains_subnets() {
        let vnet = sample_vnet_row("sub-1", "rg-net", "vnet-1");
        let (_, engine) = engine(vec![vnet.clone()]);
        let edges = engine.extract_relationships(&doc(&vnet), 1).await;
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].relationship_type, RelationshipType::Contains);
    }

    #[tokio::test]
    async fn test_cycle_yields_first_edge_only() {
        // Two unknown-type resources that mention each other.
        let a_id = resource_id("sub-1", "rg", "Contoso.Widgets/widgets", "a");
        let b_id = resource_id("sub-1", "rg", "Contoso.Widgets/widgets", "b");
        let a = json!({"id": a_id, "type": "Contoso.Widgets/widgets", "subscriptionId": "sub-1",
                       "properties": {"peer": b_id}});
        let b = json!({"id": b_id, "type": "Contoso.Widgets/widgets", "subscriptionId": "sub-1",
                       "properties": {"peer": a_id}});
        let (_, engine) = engine(vec![a.clone(), b]);

        let edges = engine.extract_relationships(&doc(&a), 2).await;
        assert_eq!(targets(&edges), vec![b_id]);
        assert_eq!(edges[0].relationship_type, RelationshipType::RelatedTo);
    }

    #[tokio::test]
    async fn test_missing_id_and_query_errors_yield_nothing() {
        let (vm, nic, vnet) = network_rows();
        let (graph, engine) = engine(vec![vm.clone(), nic, vnet]);

        let mut anonymous = doc(&vm);
        anonymous.id = String::new();
        assert!(engine.extract_relationships(&anonymous, 2).await.is_empty());

        graph
            .set_failure(Some(ConnectorError::Timeout("slow".into())))
            .await;
        assert!(engine.extract_relationships(&doc(&vm), 2).await.is_empty());
    }

    #[test]
    fn test_aks_node_group_and_site_plan() {
        let aks = schema_references(
            MANAGED_CLUSTER,
            "sub-1",
            &json!({"nodeResourceGroup": "MC_rg_aks_eastus"}),
        );
        assert_eq!(
            aks,
            vec![(
                "/subscriptions/sub-1/resourceGroups/MC_rg_aks_eastus".to_string(),
                RelationshipType::Contains
            )]
        );

        let site = schema_references(WEB_SITE, "sub-1", &json!({"serverFarmId": "/plan"}));
        assert_eq!(site, vec![("/plan".to_string(), RelationshipType::DependsOn)]);
    }
}
