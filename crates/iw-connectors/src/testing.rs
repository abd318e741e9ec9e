//! Testing harness for connector implementations.
//!
//! Provides config helpers and sample Resource Graph rows shaped like the
//! `objectArray` result format.

use crate::traits::{AuthConfig, ConnectorConfig, ConnectorHealth, ConnectorResult};
use serde_json::{json, Value};
use std::collections::HashMap;

/// Creates a test connector config with sensible defaults.
pub fn test_connector_config(name: &str, base_url: &str) -> ConnectorConfig {
    ConnectorConfig {
        name: name.to_string(),
        base_url: base_url.to_string(),
        auth: AuthConfig::None,
        timeout_secs: 30,
        max_retries: 0,
        verify_tls: true,
        headers: HashMap::new(),
    }
}

/// Creates a test connector config with bearer token auth.
pub fn test_connector_config_with_bearer(
    name: &str,
    base_url: &str,
    token: &str,
) -> ConnectorConfig {
    ConnectorConfig {
        auth: AuthConfig::BearerToken {
            token: crate::SecureString::new(token.to_string()),
        },
        ..test_connector_config(name, base_url)
    }
}

/// Builds an ARM resource id.
pub fn resource_id(subscription_id: &str, resource_group: &str, provider_type: &str, name: &str) -> String {
    format!(
        "/subscriptions/{}/resourceGroups/{}/providers/{}/{}",
        subscription_id, resource_group, provider_type, name
    )
}

fn row(
    subscription_id: &str,
    resource_group: &str,
    provider_type: &str,
    name: &str,
    properties: Value,
) -> Value {
    json!({
        "id": resource_id(subscription_id, resource_group, provider_type, name),
        "name": name,
        "type": provider_type,
        "location": "eastus",
        "resourceGroup": resource_group,
        "subscriptionId": subscription_id,
        "tags": {"environment": "test"},
        "properties": properties
    })
}

/// A virtual machine row with one NIC and one data disk.
pub fn sample_vm_row(subscription_id: &str, resource_group: &str, name: &str) -> Value {
    let nic = resource_id(
        subscription_id,
        resource_group,
        "Microsoft.Network/networkInterfaces",
        &format!("{}-nic", name),
    );
    let disk = resource_id(
        subscription_id,
        resource_group,
        "Microsoft.Compute/disks",
        &format!("{}-data", name),
    );
    let mut vm = row(
        subscription_id,
        resource_group,
        "Microsoft.Compute/virtualMachines",
        name,
        json!({
            "hardwareProfile": {"vmSize": "Standard_D2s_v3"},
            "storageProfile": {
                "osDisk": {"osType": "Linux"},
                "dataDisks": [{"lun": 0, "managedDisk": {"id": disk}}]
            },
            "networkProfile": {"networkInterfaces": [{"id": nic}]},
            "provisioningState": "Succeeded",
            "extended": {"instanceView": {"powerState": {"code": "PowerState/running"}}}
        }),
    );
    vm["zones"] = json!(["1"]);
    vm
}

/// An App Service site row.
pub fn sample_site_row(subscription_id: &str, resource_group: &str, name: &str) -> Value {
    let plan = resource_id(
        subscription_id,
        resource_group,
        "Microsoft.Web/serverFarms",
        &format!("{}-plan", name),
    );
    let mut site = row(
        subscription_id,
        resource_group,
        "Microsoft.Web/sites",
        name,
        json!({
            "state": "Running",
            "defaultHostName": format!("{}.azurewebsites.net", name),
            "httpsOnly": true,
            "serverFarmId": plan,
            "provisioningState": "Succeeded"
        }),
    );
    site["kind"] = json!("app,linux");
    site
}

/// A virtual network row with one subnet.
pub fn sample_vnet_row(subscription_id: &str, resource_group: &str, name: &str) -> Value {
    let vnet_id = resource_id(
        subscription_id,
        resource_group,
        "Microsoft.Network/virtualNetworks",
        name,
    );
    row(
        subscription_id,
        resource_group,
        "Microsoft.Network/virtualNetworks",
        name,
        json!({
            "addressSpace": {"addressPrefixes": ["10.0.0.0/16"]},
            "subnets": [{"id": format!("{}/subnets/default", vnet_id), "name": "default"}],
            "provisioningState": "Succeeded"
        }),
    )
}

/// A network interface row attached to a subnet.
pub fn sample_nic_row(
    subscription_id: &str,
    resource_group: &str,
    name: &str,
    subnet_id: &str,
) -> Value {
    row(
        subscription_id,
        resource_group,
        "Microsoft.Network/networkInterfaces",
        name,
        json!({
            "ipConfigurations": [{"properties": {"subnet": {"id": subnet_id}}}],
            "provisioningState": "Succeeded"
        }),
    )
}

/// Asserts that a connector health check returns healthy.
pub fn assert_healthy(result: &ConnectorResult<ConnectorHealth>) {
    match result {
        Ok(ConnectorHealth::Healthy) => {}
        other => panic!("Expected Healthy, got {:?}", other),
    }
}

/// Asserts that a connector health check returns unhealthy.
pub fn assert_unhealthy(result: &ConnectorResult<ConnectorHealth>) {
    match result {
        Ok(ConnectorHealth::Unhealthy(_)) => {}
        other => panic!("Expected Unhealthy, got {:?}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_rows_are_consistent() {
        let vm = sample_vm_row("sub-1", "rg-a", "vm-1");
        assert_eq!(vm["subscriptionId"], "sub-1");
        assert!(vm["id"].as_str().unwrap().ends_with("/virtualMachines/vm-1"));
        let nic = vm["properties"]["networkProfile"]["networkInterfaces"][0]["id"]
            .as_str()
            .unwrap();
        assert!(nic.ends_with("/networkInterfaces/vm-1-nic"));
    }

    #[test]
    fn test_bearer_config() {
        let config = test_connector_config_with_bearer("x", "https://example.com", "secret");
        assert!(matches!(config.auth, AuthConfig::BearerToken { .. }));
        assert_eq!(config.max_retries, 0);
    }
}
