//! Connector trait definitions for Inventory Warden.
//!
//! This module defines the cloud-side interfaces the discovery engine talks
//! to: a graph-style resource query API, subscription listing, and live
//! per-resource inspection calls.

use crate::secure_string::SecureString;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;

/// Errors that can occur in connectors.
#[derive(Error, Debug, Clone)]
pub enum ConnectorError {
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Authorization denied: {0}")]
    AuthorizationDenied(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Rate limited: retry after {0} seconds")]
    RateLimited(u64),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type for connector operations.
pub type ConnectorResult<T> = Result<T, ConnectorError>;

/// Health status of a connector.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConnectorHealth {
    /// Connector is healthy and operational.
    Healthy,
    /// Connector is degraded but still functional.
    Degraded(String),
    /// Connector is unhealthy and not operational.
    Unhealthy(String),
    /// Health status is unknown.
    Unknown,
}

/// Configuration for a connector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorConfig {
    /// Connector name/identifier.
    pub name: String,
    /// Base URL for the API.
    pub base_url: String,
    /// Authentication configuration.
    pub auth: AuthConfig,
    /// Request timeout in seconds. Bounds every discovery and relationship call.
    pub timeout_secs: u64,
    /// Maximum retries.
    pub max_retries: u32,
    /// Whether to verify TLS certificates.
    pub verify_tls: bool,
    /// Additional headers to include.
    pub headers: HashMap<String, String>,
}

/// Authentication configuration.
///
/// Credential acquisition happens outside this crate; connectors only carry
/// the resulting secret, wrapped in `SecureString`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthConfig {
    /// No authentication.
    None,
    /// Bearer token authentication (ARM, Resource Graph).
    BearerToken {
        /// The bearer token (zeroized on drop).
        token: SecureString,
    },
    /// Entra ID token presented in the document-store `type=aad` header format.
    AadToken {
        /// The access token (zeroized on drop).
        token: SecureString,
    },
    /// OAuth2 client credentials.
    OAuth2 {
        /// The client ID.
        client_id: String,
        /// The client secret (zeroized on drop).
        client_secret: SecureString,
        /// The token URL.
        token_url: String,
        /// The scopes to request.
        scopes: Vec<String>,
    },
}

/// Base trait for all connectors.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Returns the connector name.
    fn name(&self) -> &str;

    /// Returns the connector type (e.g., "resource_graph", "subscriptions").
    fn connector_type(&self) -> &str;

    /// Returns the capabilities this connector provides.
    fn capabilities(&self) -> Vec<String> {
        vec!["health_check".to_string(), "test_connection".to_string()]
    }

    /// Checks the health of the connector.
    async fn health_check(&self) -> ConnectorResult<ConnectorHealth>;

    /// Tests the connection to the external system.
    async fn test_connection(&self) -> ConnectorResult<bool>;
}

/// A single page request against a graph-style resource query API.
///
/// Parameters are substituted into `{name}` placeholders of the query text
/// as quoted KQL string literals by [`GraphQueryRequest::render`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GraphQueryRequest {
    /// Subscriptions the query is scoped to.
    pub subscriptions: Vec<String>,
    /// Query text with `{name}` placeholders.
    pub query: String,
    /// Named parameters, substituted on render.
    pub parameters: BTreeMap<String, String>,
    /// Continuation token from the previous page.
    pub skip_token: Option<String>,
    /// Page size.
    pub top: Option<u32>,
}

impl GraphQueryRequest {
    /// Creates a request for the given subscriptions and query text.
    pub fn new(subscriptions: Vec<String>, query: impl Into<String>) -> Self {
        Self {
            subscriptions,
            query: query.into(),
            ..Default::default()
        }
    }

    /// Adds a named parameter.
    pub fn with_parameter(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(name.into(), value.into());
        self
    }

    /// Sets the page size.
    pub fn with_top(mut self, top: u32) -> Self {
        self.top = Some(top);
        self
    }

    /// Returns a copy of this request positioned at the given continuation token.
    pub fn next_page(&self, skip_token: String) -> Self {
        let mut next = self.clone();
        next.skip_token = Some(skip_token);
        next
    }

    /// Returns a parameter value.
    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).map(String::as_str)
    }

    /// Renders the query with every placeholder replaced by an escaped literal.
    ///
    /// A placeholder without a bound parameter is an error rather than being
    /// sent to the API verbatim.
    pub fn render(&self) -> ConnectorResult<String> {
        let mut rendered = String::with_capacity(self.query.len());
        let mut rest = self.query.as_str();
        while let Some(start) = rest.find('{') {
            rendered.push_str(&rest[..start]);
            let after = &rest[start + 1..];
            match after.find('}') {
                Some(end) if is_placeholder(&after[..end]) => {
                    let name = &after[..end];
                    let value = self.parameters.get(name).ok_or_else(|| {
                        ConnectorError::InvalidRequest(format!(
                            "Unbound query parameter: {}",
                            name
                        ))
                    })?;
                    rendered.push_str(&kql_string_literal(value));
                    rest = &after[end + 1..];
                }
                _ => {
                    rendered.push('{');
                    rest = after;
                }
            }
        }
        rendered.push_str(rest);
        Ok(rendered)
    }
}

fn is_placeholder(candidate: &str) -> bool {
    !candidate.is_empty()
        && candidate
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Quotes a value as a KQL string literal.
pub fn kql_string_literal(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
}

/// One page of rows from the resource query API.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphQueryPage {
    /// Raw result rows.
    pub rows: Vec<serde_json::Value>,
    /// Continuation token; `None` when the result set is exhausted.
    pub skip_token: Option<String>,
    /// Total records matching the query, when reported.
    pub total_records: Option<u64>,
}

/// Graph-style resource query API (Azure Resource Graph).
#[async_trait]
pub trait ResourceGraph: Connector {
    /// Executes one page of a query.
    async fn query(&self, request: &GraphQueryRequest) -> ConnectorResult<GraphQueryPage>;
}

/// A subscription as reported by the listing API.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RawSubscription {
    /// Stable subscription identifier.
    pub subscription_id: String,
    /// Display name.
    #[serde(default)]
    pub display_name: String,
    /// Lifecycle state (e.g., "Enabled").
    #[serde(default)]
    pub state: String,
    /// Owning tenant.
    #[serde(default)]
    pub tenant_id: String,
}

/// Subscription listing API.
#[async_trait]
pub trait SubscriptionSource: Connector {
    /// Lists every subscription reachable by the configured credential.
    async fn list_subscriptions(&self) -> ConnectorResult<Vec<RawSubscription>>;
}

/// Live per-resource calls used for enrichment.
#[async_trait]
pub trait ResourceInspector: Connector {
    /// Fetches the instance view of a compute resource.
    async fn instance_view(&self, resource_id: &str) -> ConnectorResult<serde_json::Value>;

    /// Fetches a resource (or sub-resource path) at the given API version.
    async fn get_resource(
        &self,
        resource_id: &str,
        api_version: &str,
    ) -> ConnectorResult<serde_json::Value>;

    /// Fetches the web configuration of an App Service site.
    async fn site_config(&self, resource_id: &str) -> ConnectorResult<serde_json::Value> {
        let path = format!("{}/config/web", resource_id.trim_end_matches('/'));
        self.get_resource(&path, WEB_API_VERSION).await
    }
}

/// API version used for App Service (`Microsoft.Web`) calls.
pub const WEB_API_VERSION: &str = "2023-01-01";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_substitutes_and_escapes() {
        let request = GraphQueryRequest::new(
            vec!["sub-1".to_string()],
            "resources | where type =~ {resource_type} and name == {name}",
        )
        .with_parameter("resource_type", "microsoft.compute/virtualmachines")
        .with_parameter("name", "o'brien");

        let rendered = request.render().unwrap();
        assert_eq!(
            rendered,
            "resources | where type =~ 'microsoft.compute/virtualmachines' and name == 'o\\'brien'"
        );
    }

    #[test]
    fn test_render_rejects_unbound_parameter() {
        let request = GraphQueryRequest::new(vec![], "resources | where id =~ {resource_id}");
        assert!(matches!(
            request.render(),
            Err(ConnectorError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_render_leaves_dynamic_literals_alone() {
        let request = GraphQueryRequest::new(vec![], "resources | extend x = pack('a', 1) | project x");
        assert!(request.render().is_ok());

        let request = GraphQueryRequest::new(vec![], "print bag = dynamic({})");
        assert!(request.render().is_ok());
    }

    #[test]
    fn test_render_does_not_expand_placeholders_inside_values() {
        let request = GraphQueryRequest::new(vec![], "resources | where name == {name} and id =~ {id}")
            .with_parameter("name", "{id}")
            .with_parameter("id", "abc");
        assert_eq!(
            request.render().unwrap(),
            "resources | where name == '{id}' and id =~ 'abc'"
        );
    }

    #[test]
    fn test_next_page_keeps_parameters() {
        let request = GraphQueryRequest::new(vec!["sub-1".to_string()], "resources")
            .with_parameter("resource_type", "x")
            .with_top(100);
        let next = request.next_page("token-2".to_string());
        assert_eq!(next.skip_token.as_deref(), Some("token-2"));
        assert_eq!(next.parameter("resource_type"), Some("x"));
        assert_eq!(next.top, Some(100));
    }

    #[test]
    fn test_raw_subscription_deserializes_camel_case() {
        let json = serde_json::json!({
            "subscriptionId": "sub-1",
            "displayName": "Production",
            "state": "Enabled",
            "tenantId": "tenant-1"
        });
        let sub: RawSubscription = serde_json::from_value(json).unwrap();
        assert_eq!(sub.subscription_id, "sub-1");
        assert_eq!(sub.display_name, "Production");
    }
}
