//! Live ARM calls used to enrich cached resources.

use crate::http::HttpClient;
use crate::traits::{Connector, ConnectorHealth, ConnectorResult, ResourceInspector};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::instrument;

/// API version for virtual machine instance views.
pub const COMPUTE_API_VERSION: &str = "2024-03-01";

/// ARM inspector configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArmInspectorConfig {
    /// Base connector configuration.
    #[serde(flatten)]
    pub connector: crate::traits::ConnectorConfig,
}

/// Issues per-resource GETs against Azure Resource Manager.
pub struct ArmResourceInspector {
    config: ArmInspectorConfig,
    client: HttpClient,
}

impl ArmResourceInspector {
    /// Creates a new inspector.
    pub fn new(config: ArmInspectorConfig) -> ConnectorResult<Self> {
        let client = HttpClient::new(config.connector.clone())?;
        Ok(Self { config, client })
    }

    /// Builds `{resource_id}{suffix}?api-version=...`.
    fn resource_path(resource_id: &str, suffix: &str, api_version: &str) -> String {
        format!(
            "/{}{}?api-version={}",
            resource_id.trim_start_matches('/'),
            suffix,
            api_version
        )
    }
}

#[async_trait]
impl Connector for ArmResourceInspector {
    fn name(&self) -> &str {
        &self.config.connector.name
    }

    fn connector_type(&self) -> &str {
        "resource_inspector"
    }

    async fn health_check(&self) -> ConnectorResult<ConnectorHealth> {
        let path = "/providers?api-version=2021-04-01&$top=1";
        match self.client.get(path).await {
            Ok(response) if response.status().is_success() => Ok(ConnectorHealth::Healthy),
            Ok(response) => Ok(ConnectorHealth::Degraded(format!(
                "Unexpected status {}",
                response.status()
            ))),
            Err(e) => Ok(ConnectorHealth::Unhealthy(e.to_string())),
        }
    }

    async fn test_connection(&self) -> ConnectorResult<bool> {
        Ok(matches!(self.health_check().await?, ConnectorHealth::Healthy))
    }
}

#[async_trait]
impl ResourceInspector for ArmResourceInspector {
    #[instrument(skip(self))]
    async fn instance_view(&self, resource_id: &str) -> ConnectorResult<serde_json::Value> {
        let path = Self::resource_path(resource_id, "/instanceView", COMPUTE_API_VERSION);
        self.client.get_json(&path).await
    }

    #[instrument(skip(self))]
    async fn get_resource(
        &self,
        resource_id: &str,
        api_version: &str,
    ) -> ConnectorResult<serde_json::Value> {
        let path = Self::resource_path(resource_id, "", api_version);
        self.client.get_json(&path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_path_instance_view() {
        let path = ArmResourceInspector::resource_path(
            "/subscriptions/s/resourceGroups/rg/providers/Microsoft.Compute/virtualMachines/vm1",
            "/instanceView",
            COMPUTE_API_VERSION,
        );
        assert_eq!(
            path,
            "/subscriptions/s/resourceGroups/rg/providers/Microsoft.Compute/virtualMachines/vm1/instanceView?api-version=2024-03-01"
        );
    }

    #[test]
    fn test_resource_path_plain_get() {
        let path = ArmResourceInspector::resource_path(
            "/subscriptions/s/resourceGroups/rg/providers/Microsoft.Web/sites/app/config/web",
            "",
            "2023-01-01",
        );
        assert!(path.ends_with("/config/web?api-version=2023-01-01"));
        assert!(!path.starts_with("//"));
    }
}
