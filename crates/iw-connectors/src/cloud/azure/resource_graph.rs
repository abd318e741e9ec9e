//! Azure Resource Graph connector.
//!
//! Runs KQL queries against the `resources` and `resourcechanges` tables,
//! one page per call. Callers follow `skip_token` until it is `None`.

use crate::http::{HttpClient, RateLimitConfig};
use crate::traits::{
    Connector, ConnectorError, ConnectorHealth, ConnectorResult, GraphQueryPage,
    GraphQueryRequest, ResourceGraph,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

const API_VERSION: &str = "2022-10-01";

/// Resource Graph connector configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceGraphConfig {
    /// Base connector configuration.
    #[serde(flatten)]
    pub connector: crate::traits::ConnectorConfig,
    /// Page size requested when the caller does not set one (max 1000).
    #[serde(default = "default_page_size")]
    pub page_size: u32,
}

fn default_page_size() -> u32 {
    1000
}

/// Azure Resource Graph connector.
pub struct ResourceGraphConnector {
    config: ResourceGraphConfig,
    client: HttpClient,
}

impl ResourceGraphConnector {
    /// Creates a new Resource Graph connector with the default throttling quota.
    pub fn new(config: ResourceGraphConfig) -> ConnectorResult<Self> {
        let client =
            HttpClient::with_rate_limit(config.connector.clone(), Some(RateLimitConfig::default()))?;
        info!(
            connector = %config.connector.name,
            page_size = config.page_size,
            "Resource Graph connector initialized"
        );
        Ok(Self { config, client })
    }

    fn path() -> String {
        format!(
            "/providers/Microsoft.ResourceGraph/resources?api-version={}",
            API_VERSION
        )
    }

    /// Builds the request body for one page.
    fn build_body(&self, request: &GraphQueryRequest) -> ConnectorResult<GraphRequestBody> {
        let top = request
            .top
            .unwrap_or(self.config.page_size)
            .clamp(1, 1000);
        Ok(GraphRequestBody {
            subscriptions: request.subscriptions.clone(),
            query: request.render()?,
            options: GraphRequestOptions {
                top,
                skip_token: request.skip_token.clone(),
                result_format: "objectArray".to_string(),
            },
        })
    }

    fn into_page(response: GraphResponse) -> GraphQueryPage {
        GraphQueryPage {
            rows: response.data,
            skip_token: response.skip_token.filter(|t| !t.is_empty()),
            total_records: response.total_records,
        }
    }
}

#[async_trait]
impl Connector for ResourceGraphConnector {
    fn name(&self) -> &str {
        &self.config.connector.name
    }

    fn connector_type(&self) -> &str {
        "resource_graph"
    }

    fn capabilities(&self) -> Vec<String> {
        vec![
            "health_check".to_string(),
            "test_connection".to_string(),
            "query".to_string(),
        ]
    }

    async fn health_check(&self) -> ConnectorResult<ConnectorHealth> {
        let probe = GraphQueryRequest::new(Vec::new(), "resources | take 1").with_top(1);
        match self.query(&probe).await {
            Ok(_) => Ok(ConnectorHealth::Healthy),
            Err(ConnectorError::AuthenticationFailed(e)) => Ok(ConnectorHealth::Unhealthy(
                format!("Authentication failed: {}", e),
            )),
            Err(ConnectorError::RateLimited(secs)) => Ok(ConnectorHealth::Degraded(format!(
                "Throttled for {} seconds",
                secs
            ))),
            Err(e) => Ok(ConnectorHealth::Unhealthy(e.to_string())),
        }
    }

    async fn test_connection(&self) -> ConnectorResult<bool> {
        let probe = GraphQueryRequest::new(Vec::new(), "resources | take 1").with_top(1);
        Ok(self.query(&probe).await.is_ok())
    }
}

#[async_trait]
impl ResourceGraph for ResourceGraphConnector {
    #[instrument(skip(self, request), fields(subscriptions = request.subscriptions.len()))]
    async fn query(&self, request: &GraphQueryRequest) -> ConnectorResult<GraphQueryPage> {
        let body = self.build_body(request)?;
        let response: GraphResponse = self.client.post_json(&Self::path(), &body).await?;
        debug!(
            rows = response.data.len(),
            has_more = response.skip_token.is_some(),
            "Resource Graph page received"
        );
        Ok(Self::into_page(response))
    }
}

// Resource Graph wire types

#[derive(Debug, Serialize)]
struct GraphRequestBody {
    subscriptions: Vec<String>,
    query: String,
    options: GraphRequestOptions,
}

#[derive(Debug, Serialize)]
struct GraphRequestOptions {
    #[serde(rename = "$top")]
    top: u32,
    #[serde(rename = "$skipToken", skip_serializing_if = "Option::is_none")]
    skip_token: Option<String>,
    #[serde(rename = "resultFormat")]
    result_format: String,
}

#[derive(Debug, Deserialize)]
struct GraphResponse {
    #[serde(rename = "totalRecords")]
    total_records: Option<u64>,
    #[serde(default)]
    data: Vec<serde_json::Value>,
    #[serde(rename = "$skipToken")]
    skip_token: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::azure::ARM_ENDPOINT;
    use crate::testing::test_connector_config;

    fn create_connector() -> ResourceGraphConnector {
        ResourceGraphConnector::new(ResourceGraphConfig {
            connector: test_connector_config("graph-test", ARM_ENDPOINT),
            page_size: 500,
        })
        .unwrap()
    }

    #[test]
    fn test_connector_name_and_type() {
        let connector = create_connector();
        assert_eq!(connector.name(), "graph-test");
        assert_eq!(connector.connector_type(), "resource_graph");
        assert!(connector.capabilities().contains(&"query".to_string()));
    }

    #[test]
    fn test_build_body_renders_query_and_paging() {
        let connector = create_connector();
        let request = GraphQueryRequest::new(
            vec!["sub-1".to_string()],
            "resources | where type =~ {resource_type}",
        )
        .with_parameter("resource_type", "microsoft.web/sites")
        .next_page("page-2".to_string());

        let body = connector.build_body(&request).unwrap();
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["subscriptions"][0], "sub-1");
        assert_eq!(
            json["query"],
            "resources | where type =~ 'microsoft.web/sites'"
        );
        assert_eq!(json["options"]["$top"], 500);
        assert_eq!(json["options"]["$skipToken"], "page-2");
    }

    #[test]
    fn test_build_body_clamps_page_size() {
        let connector = create_connector();
        let request = GraphQueryRequest::new(vec![], "resources").with_top(5000);
        let body = connector.build_body(&request).unwrap();
        assert_eq!(body.options.top, 1000);
    }

    #[test]
    fn test_into_page_treats_empty_token_as_exhausted() {
        let response: GraphResponse = serde_json::from_value(serde_json::json!({
            "totalRecords": 2,
            "count": 2,
            "data": [{"id": "a"}, {"id": "b"}],
            "$skipToken": ""
        }))
        .unwrap();
        let page = ResourceGraphConnector::into_page(response);
        assert_eq!(page.rows.len(), 2);
        assert!(page.skip_token.is_none());
        assert_eq!(page.total_records, Some(2));
    }
}
