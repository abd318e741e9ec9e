//! Azure subscription listing connector.

use crate::http::HttpClient;
use crate::traits::{
    Connector, ConnectorError, ConnectorHealth, ConnectorResult, RawSubscription,
    SubscriptionSource,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

const API_VERSION: &str = "2022-12-01";

/// Upper bound on `nextLink` hops, so a looping link cannot stall a scan.
const MAX_LIST_PAGES: usize = 200;

/// Subscription listing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionListConfig {
    /// Base connector configuration.
    #[serde(flatten)]
    pub connector: crate::traits::ConnectorConfig,
}

/// Lists subscriptions through Azure Resource Manager.
pub struct ArmSubscriptionConnector {
    config: SubscriptionListConfig,
    client: HttpClient,
}

impl ArmSubscriptionConnector {
    /// Creates a new subscription connector.
    pub fn new(config: SubscriptionListConfig) -> ConnectorResult<Self> {
        let client = HttpClient::new(config.connector.clone())?;
        Ok(Self { config, client })
    }

    fn first_page_path() -> String {
        format!("/subscriptions?api-version={}", API_VERSION)
    }
}

#[async_trait]
impl Connector for ArmSubscriptionConnector {
    fn name(&self) -> &str {
        &self.config.connector.name
    }

    fn connector_type(&self) -> &str {
        "subscriptions"
    }

    async fn health_check(&self) -> ConnectorResult<ConnectorHealth> {
        match self.client.get(&Self::first_page_path()).await {
            Ok(response) if response.status().is_success() => Ok(ConnectorHealth::Healthy),
            Ok(response) => Ok(ConnectorHealth::Degraded(format!(
                "Unexpected status {}",
                response.status()
            ))),
            Err(ConnectorError::AuthenticationFailed(e)) => Ok(ConnectorHealth::Unhealthy(
                format!("Authentication failed: {}", e),
            )),
            Err(e) => Ok(ConnectorHealth::Unhealthy(e.to_string())),
        }
    }

    async fn test_connection(&self) -> ConnectorResult<bool> {
        let response = self.client.get(&Self::first_page_path()).await?;
        Ok(response.status().is_success())
    }
}

#[async_trait]
impl SubscriptionSource for ArmSubscriptionConnector {
    #[instrument(skip(self))]
    async fn list_subscriptions(&self) -> ConnectorResult<Vec<RawSubscription>> {
        let mut subscriptions = Vec::new();
        let mut next = Some(Self::first_page_path());
        let mut pages = 0;

        while let Some(path) = next.take() {
            pages += 1;
            if pages > MAX_LIST_PAGES {
                warn!(pages, "Subscription listing exceeded page limit, stopping");
                break;
            }
            let page: SubscriptionListResponse = self.client.get_json(&path).await?;
            subscriptions.extend(page.value);
            next = page.next_link.filter(|link| !link.is_empty());
        }

        info!(count = subscriptions.len(), "Listed subscriptions");
        Ok(subscriptions)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubscriptionListResponse {
    #[serde(default)]
    value: Vec<RawSubscription>,
    next_link: Option<String>,
}
