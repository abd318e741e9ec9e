//! Cache error types.

use iw_connectors::StoreError;
use thiserror::Error;

/// Errors raised inside the cache. They never reach callers of
/// `TwoTierCache`: L2 failures degrade to misses or logged write failures.
#[derive(Error, Debug, Clone)]
pub enum CacheError {
    /// The L2 document store failed.
    #[error("L2 store error: {0}")]
    Store(#[from] StoreError),

    /// Failed to serialize or deserialize cache data.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Result type for cache operations.
pub type CacheResult<T> = Result<T, CacheError>;

impl From<serde_json::Error> for CacheError {
    fn from(e: serde_json::Error) -> Self {
        CacheError::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_error_display() {
        let err = CacheError::Store(StoreError::Unavailable("cosmos down".to_string()));
        assert!(err.to_string().contains("cosmos down"));

        let err = CacheError::Serialization("invalid JSON".to_string());
        assert!(err.to_string().contains("invalid JSON"));
    }
}
