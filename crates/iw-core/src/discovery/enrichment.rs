//! Live property enrichment for single resources.

use super::engine::DiscoveryEngine;
use crate::models::ResourceDocument;
use chrono::Utc;
use iw_connectors::traits::WEB_API_VERSION;
use iw_connectors::{ConnectorResult, ResourceInspector};
use serde_json::{json, Map, Value};
use tracing::{debug, instrument, warn};

impl DiscoveryEngine {
    /// Adds live properties under `enriched_properties`.
    ///
    /// Never fails: unsupported types and failed calls are reported inside
    /// the enriched payload.
    #[instrument(skip(self, resource), fields(resource_id = %resource.id))]
    pub async fn enrich_properties(&self, mut resource: ResourceDocument) -> ResourceDocument {
        let enriched = match self.inspector.as_deref() {
            None => error_payload("no resource inspector configured"),
            Some(inspector) => match resource.resource_type.as_str() {
                "microsoft.compute/virtualmachines" => {
                    outcome(virtual_machine(inspector, &resource.id).await)
                }
                "microsoft.web/sites" => outcome(web_site(inspector, &resource.id).await),
                other => {
                    debug!(resource_type = %other, "No enrichment for resource type");
                    let mut payload = Map::new();
                    payload.insert("supported".to_string(), json!(false));
                    payload.insert("message".to_string(), json!("not yet implemented"));
                    payload
                }
            },
        };

        resource.enriched_properties = Some(enriched);
        resource.enriched_at = Some(Utc::now());
        resource
    }
}

fn outcome(result: ConnectorResult<Map<String, Value>>) -> Map<String, Value> {
    result.unwrap_or_else(|e| {
        warn!(error = %e, "Enrichment call failed");
        error_payload(&e.to_string())
    })
}

fn error_payload(message: &str) -> Map<String, Value> {
    let mut payload = Map::new();
    payload.insert("error".to_string(), json!(message));
    payload
}

async fn virtual_machine(
    inspector: &dyn ResourceInspector,
    resource_id: &str,
) -> ConnectorResult<Map<String, Value>> {
    let view = inspector.instance_view(resource_id).await?;
    let statuses: Vec<&Value> = view
        .get("statuses")
        .and_then(Value::as_array)
        .map(|s| s.iter().collect())
        .unwrap_or_default();

    let power_state = statuses
        .iter()
        .filter_map(|s| s.get("code").and_then(Value::as_str))
        .find_map(|code| code.strip_prefix("PowerState/"))
        .unwrap_or("unknown");
    let agent_status = view
        .pointer("/vmAgent/statuses/0/displayStatus")
        .and_then(Value::as_str)
        .unwrap_or("unknown");
    let status_list: Vec<Value> = statuses
        .iter()
        .map(|s| {
            json!({
                "code": s.get("code").cloned().unwrap_or(Value::Null),
                "display_status": s.get("displayStatus").cloned().unwrap_or(Value::Null),
            })
        })
        .collect();

    let mut out = Map::new();
    out.insert("power_state".to_string(), json!(power_state));
    out.insert("vm_agent_status".to_string(), json!(agent_status));
    out.insert("statuses".to_string(), Value::Array(status_list));
    Ok(out)
}

async fn web_site(
    inspector: &dyn ResourceInspector,
    resource_id: &str,
) -> ConnectorResult<Map<String, Value>> {
    let site = inspector.get_resource(resource_id, WEB_API_VERSION).await?;
    let config = inspector.site_config(resource_id).await?;
    let props = site.get("properties").unwrap_or(&Value::Null);
    let config_props = config.get("properties").unwrap_or(&Value::Null);

    let runtime_stack = ["linuxFxVersion", "windowsFxVersion", "netFrameworkVersion"]
        .iter()
        .filter_map(|field| config_props.get(*field).and_then(Value::as_str))
        .find(|v| !v.is_empty())
        .unwrap_or("unknown");

    let mut out = Map::new();
    out.insert(
        "state".to_string(),
        props.get("state").cloned().unwrap_or(Value::Null),
    );
    out.insert("runtime_stack".to_string(), json!(runtime_stack));
    out.insert(
        "host_names".to_string(),
        props.get("hostNames").cloned().unwrap_or_else(|| json!([])),
    );
    out.insert(
        "availability_state".to_string(),
        props.get("availabilityState").cloned().unwrap_or(Value::Null),
    );
    Ok(out)
}
