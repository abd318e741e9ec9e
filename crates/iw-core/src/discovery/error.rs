//! Discovery error types.

use iw_connectors::ConnectorError;
use thiserror::Error;

/// Errors that end a discovery call. Per-row normalisation problems are
/// logged and skipped rather than raised.
#[derive(Error, Debug, Clone)]
pub enum DiscoveryError {
    #[error("Subscription listing failed: {0}")]
    Subscriptions(#[source] ConnectorError),

    #[error("Resource query failed for subscription {subscription_id}: {source}")]
    Query {
        subscription_id: String,
        #[source]
        source: ConnectorError,
    },

    /// The page cap was reached with more pages outstanding.
    #[error("Listing for subscription {subscription_id} truncated after {pages} pages")]
    Truncated { subscription_id: String, pages: usize },

    #[error("Invalid discovery input: {0}")]
    InvalidInput(String),
}

impl DiscoveryError {
    pub(crate) fn query(subscription_id: &str, source: ConnectorError) -> Self {
        DiscoveryError::Query {
            subscription_id: subscription_id.to_string(),
            source,
        }
    }
}

/// Result type for discovery operations.
pub type DiscoveryResult<T> = Result<T, DiscoveryError>;
