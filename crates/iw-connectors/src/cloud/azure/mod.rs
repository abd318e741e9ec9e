//! Azure Resource Manager connectors.

pub mod inspector;
pub mod resource_graph;
pub mod subscriptions;

pub use inspector::{ArmInspectorConfig, ArmResourceInspector};
pub use resource_graph::{ResourceGraphConfig, ResourceGraphConnector};
pub use subscriptions::{ArmSubscriptionConnector, SubscriptionListConfig};

/// Default Azure Resource Manager endpoint.
pub const ARM_ENDPOINT: &str = "https://management.azure.com";
