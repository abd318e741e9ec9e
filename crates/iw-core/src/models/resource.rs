//! Normalised resource documents.
//!
//! `ResourceDocument::from_graph_row` is the only way a discovered row becomes
//! a document, so type lower-casing, partitioning and tag redaction always
//! happen before anything is cached or stored.

use chrono::{DateTime, Utc};
use iw_connectors::secure_string::REDACTED;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::OnceLock;
use thiserror::Error;

/// Stored documents expire after 7 days unless rediscovered.
pub const DEFAULT_DOCUMENT_TTL_SECS: i64 = 7 * 24 * 60 * 60;

/// Resource type recorded when an id cannot be parsed.
pub const UNKNOWN_RESOURCE_TYPE: &str = "unknown";

/// Errors raised while normalising a discovered row.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModelError {
    #[error("Row is missing required field: {0}")]
    MissingField(&'static str),

    #[error("Malformed resource id: {0}")]
    MalformedId(String),
}

/// Parent/child/dependency links recorded on a document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Relationships {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub child_ids: Vec<String>,
    #[serde(default)]
    pub dependency_ids: Vec<String>,
}

/// A discovered resource, normalised for caching and storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceDocument {
    pub id: String,
    pub partition_key: String,
    pub subscription_id: String,
    pub resource_name: String,
    /// Always lower-case.
    pub resource_type: String,
    pub location: String,
    pub resource_group: String,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    #[serde(default)]
    pub selected_properties: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relationships: Option<Relationships>,
    pub discovered_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub ttl: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enriched_properties: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enriched_at: Option<DateTime<Utc>>,
}

const SENSITIVE_KEYWORDS: [&str; 5] = ["password", "secret", "token", "key", "credential"];

fn sensitive_key_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(&format!("(?i){}", SENSITIVE_KEYWORDS.join("|"))).ok())
        .as_ref()
}

/// Whether a tag key looks like it holds a credential.
pub fn is_sensitive_tag_key(key: &str) -> bool {
    match sensitive_key_pattern() {
        Some(pattern) => pattern.is_match(key),
        None => {
            let key = key.to_lowercase();
            SENSITIVE_KEYWORDS.iter().any(|k| key.contains(k))
        }
    }
}

/// Replaces the values of sensitive tag keys with the redaction marker.
pub fn redact_tags(tags: &mut BTreeMap<String, String>) {
    for (key, value) in tags.iter_mut() {
        if is_sensitive_tag_key(key) && value.as_str() != REDACTED {
            *value = REDACTED.to_string();
        }
    }
}

/// Components of an ARM resource id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceId {
    pub subscription_id: String,
    pub resource_group: String,
    /// Lower-cased `namespace/type[/subtype...]`.
    pub resource_type: String,
    pub name: String,
}

impl ResourceId {
    /// Parses `/subscriptions/{s}/resourceGroups/{rg}/providers/{ns}/{type}/{name}[/{sub}/{name}...]`.
    pub fn parse(id: &str) -> Result<Self, ModelError> {
        let segments: Vec<&str> = id.trim_matches('/').split('/').collect();
        let malformed = || ModelError::MalformedId(id.to_string());

        if segments.len() < 2 || !segments[0].eq_ignore_ascii_case("subscriptions") {
            return Err(malformed());
        }
        let subscription_id = segments[1].to_string();

        let resource_group = segments
            .iter()
            .position(|s| s.eq_ignore_ascii_case("resourceGroups"))
            .and_then(|i| segments.get(i + 1))
            .map(|s| s.to_string())
            .unwrap_or_default();

        let Some(providers) = segments
            .iter()
            .rposition(|s| s.eq_ignore_ascii_case("providers"))
        else {
            // Subscription or resource group ids carry no provider segment.
            let (resource_type, name) = if resource_group.is_empty() {
                ("microsoft.resources/subscriptions", subscription_id.clone())
            } else {
                ("microsoft.resources/resourcegroups", resource_group.clone())
            };
            return Ok(Self {
                subscription_id,
                resource_group,
                resource_type: resource_type.to_string(),
                name,
            });
        };

        let rest = &segments[providers + 1..];
        if rest.len() < 3 || rest.len() % 2 == 0 {
            return Err(malformed());
        }
        let mut type_parts = vec![rest[0].to_lowercase()];
        type_parts.extend(rest[1..].iter().step_by(2).map(|s| s.to_lowercase()));
        let name = rest[rest.len() - 1].to_string();

        Ok(Self {
            subscription_id,
            resource_group,
            resource_type: type_parts.join("/"),
            name,
        })
    }
}

fn str_at<'a>(value: &'a Value, pointer: &str) -> Option<&'a str> {
    value.pointer(pointer).and_then(Value::as_str)
}

fn copy(out: &mut Map<String, Value>, name: &str, value: Option<&Value>) {
    if let Some(v) = value.filter(|v| !v.is_null()) {
        out.insert(name.to_string(), v.clone());
    }
}

/// Type-specific subset of a row kept on the document.
fn select_properties(resource_type: &str, row: &Value) -> Map<String, Value> {
    let mut out = Map::new();
    let props = row.get("properties").unwrap_or(&Value::Null);
    copy(&mut out, "provisioning_state", props.get("provisioningState"));

    match resource_type {
        "microsoft.compute/virtualmachines" => {
            copy(&mut out, "vm_size", props.pointer("/hardwareProfile/vmSize"));
            copy(&mut out, "os_type", props.pointer("/storageProfile/osDisk/osType"));
            copy(
                &mut out,
                "power_state",
                props.pointer("/extended/instanceView/powerState/code"),
            );
            copy(&mut out, "availability_zone", row.pointer("/zones/0"));
        }
        "microsoft.web/sites" => {
            copy(&mut out, "state", props.get("state"));
            copy(&mut out, "default_host_name", props.get("defaultHostName"));
            copy(&mut out, "https_only", props.get("httpsOnly"));
            copy(&mut out, "kind", row.get("kind"));
        }
        "microsoft.network/virtualnetworks" => {
            copy(
                &mut out,
                "address_prefixes",
                props.pointer("/addressSpace/addressPrefixes"),
            );
        }
        "microsoft.storage/storageaccounts" => {
            copy(&mut out, "sku", row.pointer("/sku/name"));
            copy(&mut out, "kind", row.get("kind"));
            copy(&mut out, "access_tier", props.get("accessTier"));
            copy(&mut out, "https_only", props.get("supportsHttpsTrafficOnly"));
        }
        "microsoft.sql/servers" => {
            copy(&mut out, "version", props.get("version"));
            copy(
                &mut out,
                "fully_qualified_domain_name",
                props.get("fullyQualifiedDomainName"),
            );
            copy(&mut out, "state", props.get("state"));
        }
        "microsoft.containerservice/managedclusters" => {
            copy(&mut out, "kubernetes_version", props.get("kubernetesVersion"));
            copy(&mut out, "node_resource_group", props.get("nodeResourceGroup"));
        }
        _ => {}
    }
    out
}

impl ResourceDocument {
    /// Normalises a Resource Graph row.
    ///
    /// `default_subscription` is used when the row carries no
    /// `subscriptionId`. The row must carry an `id`; `type` and `name` fall
    /// back to what the id encodes.
    pub fn from_graph_row(
        row: &Value,
        default_subscription: &str,
        now: DateTime<Utc>,
    ) -> Result<Self, ModelError> {
        let id = str_at(row, "/id")
            .filter(|s| !s.is_empty())
            .ok_or(ModelError::MissingField("id"))?;
        let parsed = ResourceId::parse(id).ok();

        let subscription_id = str_at(row, "/subscriptionId")
            .map(str::to_string)
            .or_else(|| parsed.as_ref().map(|p| p.subscription_id.clone()))
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| default_subscription.to_string());
        let resource_type = str_at(row, "/type")
            .map(str::to_lowercase)
            .or_else(|| parsed.as_ref().map(|p| p.resource_type.clone()))
            .ok_or(ModelError::MissingField("type"))?;
        let resource_name = str_at(row, "/name")
            .map(str::to_string)
            .or_else(|| parsed.as_ref().map(|p| p.name.clone()))
            .ok_or(ModelError::MissingField("name"))?;
        let resource_group = str_at(row, "/resourceGroup")
            .map(str::to_string)
            .or_else(|| parsed.as_ref().map(|p| p.resource_group.clone()))
            .unwrap_or_default();

        let mut tags: BTreeMap<String, String> = row
            .get("tags")
            .and_then(Value::as_object)
            .map(|t| {
                t.iter()
                    .map(|(k, v)| {
                        let value = v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string());
                        (k.clone(), value)
                    })
                    .collect()
            })
            .unwrap_or_default();
        redact_tags(&mut tags);

        Ok(Self {
            id: id.to_string(),
            partition_key: subscription_id.clone(),
            subscription_id,
            resource_name,
            selected_properties: select_properties(&resource_type, row),
            resource_type,
            location: str_at(row, "/location").unwrap_or_default().to_string(),
            resource_group,
            tags,
            relationships: None,
            discovered_at: now,
            last_seen: now,
            ttl: DEFAULT_DOCUMENT_TTL_SECS,
            enriched_properties: None,
            enriched_at: None,
        })
    }

    /// A minimal document carrying only what the id encodes. Used for
    /// deletions and for relationship lookups of uncached resources.
    /// An unparsable id yields [`UNKNOWN_RESOURCE_TYPE`] as its type.
    pub fn from_id(id: &str, default_subscription: &str, now: DateTime<Utc>) -> Self {
        let parsed = ResourceId::parse(id).ok();
        let subscription_id = parsed
            .as_ref()
            .map(|p| p.subscription_id.clone())
            .unwrap_or_else(|| default_subscription.to_string());
        Self {
            id: id.to_string(),
            partition_key: subscription_id.clone(),
            subscription_id,
            resource_name: parsed.as_ref().map(|p| p.name.clone()).unwrap_or_default(),
            resource_type: parsed
                .as_ref()
                .map(|p| p.resource_type.clone())
                .unwrap_or_else(|| UNKNOWN_RESOURCE_TYPE.to_string()),
            location: String::new(),
            resource_group: parsed.map(|p| p.resource_group).unwrap_or_default(),
            tags: BTreeMap::new(),
            selected_properties: Map::new(),
            relationships: None,
            discovered_at: now,
            last_seen: now,
            ttl: DEFAULT_DOCUMENT_TTL_SECS,
            enriched_properties: None,
            enriched_at: None,
        }
    }

    /// Re-applies tag redaction.
    pub fn redact(&mut self) {
        redact_tags(&mut self.tags);
    }

    /// Case-insensitive id comparison (ARM ids are case-insensitive).
    pub fn same_resource(&self, other_id: &str) -> bool {
        self.id.eq_ignore_ascii_case(other_id)
    }

    /// Serialises for the document store.
    pub fn to_value(&self) -> serde_json::Result<Value> {
        serde_json::to_value(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use iw_connectors::testing::{sample_site_row, sample_vm_row, sample_vnet_row};
    use serde_json::json;

    #[test]
    fn test_vm_row_normalisation() {
        let row = sample_vm_row("sub-1", "rg-web", "vm-1");
        let doc = ResourceDocument::from_graph_row(&row, "ignored", Utc::now()).unwrap();

        assert_eq!(doc.resource_type, "microsoft.compute/virtualmachines");
        assert_eq!(doc.partition_key, "sub-1");
        assert_eq!(doc.subscription_id, "sub-1");
        assert_eq!(doc.resource_group, "rg-web");
        assert_eq!(doc.ttl, DEFAULT_DOCUMENT_TTL_SECS);
        assert_eq!(doc.selected_properties["vm_size"], "Standard_D2s_v3");
        assert_eq!(doc.selected_properties["os_type"], "Linux");
        assert_eq!(doc.selected_properties["power_state"], "PowerState/running");
        assert_eq!(doc.selected_properties["availability_zone"], "1");
        assert_eq!(doc.selected_properties["provisioning_state"], "Succeeded");
    }

    #[test]
    fn test_site_and_vnet_properties() {
        let site = ResourceDocument::from_graph_row(
            &sample_site_row("sub-1", "rg", "app"),
            "sub-1",
            Utc::now(),
        )
        .unwrap();
        assert_eq!(site.selected_properties["default_host_name"], "app.azurewebsites.net");
        assert_eq!(site.selected_properties["https_only"], true);
        assert_eq!(site.selected_properties["kind"], "app,linux");

        let vnet = ResourceDocument::from_graph_row(
            &sample_vnet_row("sub-1", "rg", "vnet"),
            "sub-1",
            Utc::now(),
        )
        .unwrap();
        assert_eq!(vnet.selected_properties["address_prefixes"], json!(["10.0.0.0/16"]));
    }

    #[test]
    fn test_sensitive_tags_redacted() {
        let row = json!({
            "id": "/subscriptions/s/resourceGroups/rg/providers/Microsoft.Sql/servers/db",
            "name": "db",
            "type": "Microsoft.Sql/servers",
            "tags": {
                "DB_Password": "hunter2",
                "apiKey": "abc",
                "Credentials": "x",
                "owner": "team-a",
                "AuthToken": "t",
                "client-secret": "s"
            }
        });
        let doc = ResourceDocument::from_graph_row(&row, "s", Utc::now()).unwrap();
        assert_eq!(doc.tags["DB_Password"], REDACTED);
        assert_eq!(doc.tags["apiKey"], REDACTED);
        assert_eq!(doc.tags["Credentials"], REDACTED);
        assert_eq!(doc.tags["AuthToken"], REDACTED);
        assert_eq!(doc.tags["client-secret"], REDACTED);
        assert_eq!(doc.tags["owner"], "team-a");
    }

    #[test]
    fn test_missing_fields_fall_back_to_id() {
        let row = json!({"id": "/subscriptions/s1/resourceGroups/rg/providers/Microsoft.Network/virtualNetworks/v1/subnets/default"});
        let doc = ResourceDocument::from_graph_row(&row, "other", Utc::now()).unwrap();
        assert_eq!(doc.subscription_id, "s1");
        assert_eq!(doc.resource_type, "microsoft.network/virtualnetworks/subnets");
        assert_eq!(doc.resource_name, "default");

        assert_eq!(
            ResourceDocument::from_graph_row(&json!({"name": "x"}), "s", Utc::now()),
            Err(ModelError::MissingField("id"))
        );
    }

    #[test]
    fn test_resource_id_parse() {
        let parsed = ResourceId::parse(
            "/subscriptions/abc/resourceGroups/RG-1/providers/Microsoft.Compute/virtualMachines/vm-9",
        )
        .unwrap();
        assert_eq!(parsed.subscription_id, "abc");
        assert_eq!(parsed.resource_group, "RG-1");
        assert_eq!(parsed.resource_type, "microsoft.compute/virtualmachines");
        assert_eq!(parsed.name, "vm-9");

        let rg = ResourceId::parse("/subscriptions/abc/resourceGroups/MC_rg_aks_eastus").unwrap();
        assert_eq!(rg.resource_type, "microsoft.resources/resourcegroups");
        assert_eq!(rg.name, "MC_rg_aks_eastus");

        assert!(ResourceId::parse("not-an-id").is_err());
        assert!(ResourceId::parse("/subscriptions/abc/resourceGroups/rg/providers/Microsoft.Compute").is_err());
    }

    #[test]
    fn test_from_id_parses_or_marks_unknown() {
        let now = Utc::now();
        let doc = ResourceDocument::from_id(
            "/subscriptions/sub-9/resourceGroups/rg-x/providers/Microsoft.Web/sites/shop",
            "sub-1",
            now,
        );
        assert_eq!(doc.subscription_id, "sub-9");
        assert_eq!(doc.resource_group, "rg-x");
        assert_eq!(doc.resource_name, "shop");
        assert_eq!(doc.resource_type, "microsoft.web/sites");

        let doc = ResourceDocument::from_id("not-an-id", "sub-1", now);
        assert_eq!(doc.resource_type, UNKNOWN_RESOURCE_TYPE);
        assert_eq!(doc.subscription_id, "sub-1");
        assert_eq!(doc.partition_key, "sub-1");
        assert!(doc.resource_name.is_empty());
    }

    #[test]
    fn test_document_round_trips_through_json() {
        let doc = ResourceDocument::from_graph_row(
            &sample_vm_row("sub-1", "rg", "vm"),
            "sub-1",
            Utc::now(),
        )
        .unwrap();
        let value = doc.to_value().unwrap();
        assert_eq!(value["partition_key"], "sub-1");
        assert!(value.get("enriched_properties").is_none());
        let back: ResourceDocument = serde_json::from_value(value).unwrap();
        assert_eq!(back, doc);
    }
}
