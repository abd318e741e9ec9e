//! # iw-connectors
//!
//! Cloud API and document-store connectors for Inventory Warden.
//!
//! This crate defines the boundary traits the inventory engine talks to
//! (resource graph queries, subscription listing, live resource inspection,
//! partitioned document storage) together with Azure implementations and
//! in-process mocks.

pub mod cloud;
pub mod http;
pub mod secure_string;
pub mod store;
pub mod testing;
pub mod traits;

pub use secure_string::SecureString;

// Re-export traits
pub use traits::{
    AuthConfig, Connector, ConnectorConfig, ConnectorError, ConnectorHealth, ConnectorResult,
    GraphQueryPage, GraphQueryRequest, RawSubscription, ResourceGraph, ResourceInspector,
    SubscriptionSource,
};

// Re-export connector implementations
pub use cloud::azure::{
    ArmInspectorConfig, ArmResourceInspector, ArmSubscriptionConnector, ResourceGraphConfig,
    ResourceGraphConnector, SubscriptionListConfig,
};
pub use cloud::mock::{MockResourceGraph, MockResourceInspector, MockSubscriptionSource};
pub use store::{
    CosmosConfig, CosmosDocumentStore, DocumentQuery, DocumentStore, FieldFilter,
    InMemoryDocumentStore, IndexingPolicy, QueryResponse, SortOrder, StoreError, StoreResult,
    StoredDocument,
};
