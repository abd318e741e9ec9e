//! HTTP utilities for connectors.
//!
//! This module provides an HTTP client with retry logic, rate limiting and
//! authentication, shared by the ARM, Resource Graph and document-store
//! connectors.

use crate::secure_string::SecureString;
use crate::traits::{AuthConfig, ConnectorConfig, ConnectorError, ConnectorResult};
use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter as GovernorRateLimiter,
};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Response, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::sleep;
use tracing::{info, warn};

/// Type alias for the rate limiter.
type RateLimiterType = GovernorRateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// HTTP client with retry, rate limiting, and authentication support.
pub struct HttpClient {
    client: Client,
    config: ConnectorConfig,
    /// Current OAuth2 token (if using OAuth2 auth).
    oauth_token: Arc<RwLock<Option<OAuthToken>>>,
    /// Rate limiter for this client.
    rate_limiter: Option<Arc<RateLimiterType>>,
}

/// OAuth2 token with expiration.
#[derive(Clone)]
struct OAuthToken {
    access_token: SecureString,
    expires_at: std::time::Instant,
}

impl std::fmt::Debug for OAuthToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthToken")
            .field("access_token", &self.access_token)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Rate limiter configuration.
///
/// Resource Graph throttles per tenant (15 requests per 5 seconds by
/// default), so connectors that fan out across subscriptions share one
/// client and one limiter.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Maximum requests per period.
    pub max_requests: u32,
    /// Period duration.
    pub period: Duration,
    /// Maximum burst size.
    pub burst_size: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 15,
            period: Duration::from_secs(5),
            burst_size: 5,
        }
    }
}

impl HttpClient {
    /// Creates a new HTTP client from connector configuration.
    pub fn new(config: ConnectorConfig) -> ConnectorResult<Self> {
        Self::with_rate_limit(config, None)
    }

    /// Creates a new HTTP client with rate limiting.
    pub fn with_rate_limit(
        config: ConnectorConfig,
        rate_limit: Option<RateLimitConfig>,
    ) -> ConnectorResult<Self> {
        // TLS verification can only be turned off in debug builds.
        let verify_tls = if !config.verify_tls {
            #[cfg(debug_assertions)]
            {
                warn!(
                    base_url = %config.base_url,
                    connector_name = %config.name,
                    "TLS certificate verification DISABLED in development mode"
                );
                false
            }
            #[cfg(not(debug_assertions))]
            {
                warn!(
                    base_url = %config.base_url,
                    connector_name = %config.name,
                    "Attempted to disable TLS verification in release build - request ignored"
                );
                true
            }
        } else {
            true
        };

        let mut headers = HeaderMap::new();
        for (key, value) in &config.headers {
            if let (Ok(name), Ok(val)) = (
                HeaderName::try_from(key.as_str()),
                HeaderValue::try_from(value.as_str()),
            ) {
                headers.insert(name, val);
            }
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .danger_accept_invalid_certs(!verify_tls)
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .default_headers(headers)
            .build()
            .map_err(|e| ConnectorError::ConfigError(e.to_string()))?;

        let rate_limiter = match rate_limit {
            Some(rl) => Some(Arc::new(Self::build_rate_limiter(&rl)?)),
            None => None,
        };

        Ok(Self {
            client,
            config,
            oauth_token: Arc::new(RwLock::new(None)),
            rate_limiter,
        })
    }

    fn build_rate_limiter(rl: &RateLimitConfig) -> ConnectorResult<RateLimiterType> {
        let per_request = rl
            .period
            .checked_div(rl.max_requests.max(1))
            .unwrap_or(rl.period);
        let quota = Quota::with_period(per_request)
            .ok_or_else(|| ConnectorError::ConfigError("Invalid rate limit period".to_string()))?
            .allow_burst(NonZeroU32::new(rl.burst_size).unwrap_or(NonZeroU32::MIN));
        Ok(GovernorRateLimiter::direct(quota))
    }

    /// Builds a URL from a path. Absolute URLs (e.g. `nextLink`) pass through.
    pub fn build_url(&self, path: &str) -> String {
        if path.starts_with("https://") || path.starts_with("http://") {
            return path.to_string();
        }
        let base = self.config.base_url.trim_end_matches('/');
        let path = path.trim_start_matches('/');
        format!("{}/{}", base, path)
    }

    /// Executes a GET request with retry logic.
    pub async fn get(&self, path: &str) -> ConnectorResult<Response> {
        let url = self.build_url(path);
        let request = self.client.get(&url);
        self.execute_with_retry(request).await
    }

    /// Executes a GET request and deserializes the JSON response.
    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> ConnectorResult<T> {
        let response = self.get(path).await?;
        self.parse_json_response(response).await
    }

    /// Executes a POST request with per-request headers.
    pub async fn post_with_headers<T: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &T,
        headers: HeaderMap,
    ) -> ConnectorResult<Response> {
        let url = self.build_url(path);
        let request = self.client.post(&url).headers(headers).json(body);
        self.execute_with_retry(request).await
    }

    /// Executes a GET request with per-request headers.
    pub async fn get_with_headers(
        &self,
        path: &str,
        headers: HeaderMap,
    ) -> ConnectorResult<Response> {
        let url = self.build_url(path);
        let request = self.client.get(&url).headers(headers);
        self.execute_with_retry(request).await
    }

    /// Executes a DELETE request with per-request headers.
    pub async fn delete_with_headers(
        &self,
        path: &str,
        headers: HeaderMap,
    ) -> ConnectorResult<Response> {
        let url = self.build_url(path);
        let request = self.client.delete(&url).headers(headers);
        self.execute_with_retry(request).await
    }

    /// Executes a POST request and deserializes the JSON response.
    pub async fn post_json<T: Serialize + ?Sized, R: DeserializeOwned>(
        &self,
        path: &str,
        body: &T,
    ) -> ConnectorResult<R> {
        let response = self.post_with_headers(path, body, HeaderMap::new()).await?;
        self.parse_json_response(response).await
    }

    /// Parses a JSON response.
    pub async fn parse_json_response<T: DeserializeOwned>(
        &self,
        response: Response,
    ) -> ConnectorResult<T> {
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| ConnectorError::InvalidResponse(e.to_string()))?;

        serde_json::from_str(&text).map_err(|e| {
            ConnectorError::InvalidResponse(format!(
                "Failed to parse response (status {}): {} - Body: {}",
                status,
                e,
                text.chars().take(500).collect::<String>()
            ))
        })
    }

    /// Sends a request with authentication, rate limiting and retries.
    ///
    /// Throttled responses wait for the server's hint before the next
    /// attempt; 5xx and transport failures back off exponentially. 4xx
    /// responses other than 429 are returned immediately.
    async fn execute_with_retry(
        &self,
        request: reqwest::RequestBuilder,
    ) -> ConnectorResult<Response> {
        if let Some(limiter) = &self.rate_limiter {
            limiter.until_ready().await;
        }
        let request = self.add_auth(request).await?;
        let max_retries = self.config.max_retries;
        let mut backoff = Duration::from_millis(100);
        let mut attempt = 0;

        loop {
            let outcome = request
                .try_clone()
                .ok_or_else(|| ConnectorError::Internal("Request body is not cloneable".into()))?
                .send()
                .await;

            let (error, wait) = match outcome {
                Ok(response) if response.status() == StatusCode::TOO_MANY_REQUESTS => {
                    let wait = throttle_delay(response.headers());
                    (ConnectorError::RateLimited(wait.as_secs().max(1)), wait)
                }
                Ok(response) if response.status().is_client_error() => {
                    return Err(Self::client_error(response.status(), response).await);
                }
                Ok(response) if response.status().is_server_error() => (
                    ConnectorError::RequestFailed(format!("Server error: {}", response.status())),
                    backoff,
                ),
                Ok(response) => return Ok(response),
                Err(e) if e.is_timeout() => (ConnectorError::Timeout(e.to_string()), backoff),
                Err(e) if e.is_connect() => {
                    (ConnectorError::ConnectionFailed(e.to_string()), backoff)
                }
                Err(e) => (ConnectorError::RequestFailed(e.to_string()), backoff),
            };

            if attempt >= max_retries {
                return Err(error);
            }
            attempt += 1;
            warn!(
                connector = %self.config.name,
                attempt,
                wait_ms = wait.as_millis() as u64,
                error = %error,
                "Request failed, retrying"
            );
            sleep(wait).await;
            backoff = std::cmp::min(backoff * 2 + rand_jitter(), MAX_BACKOFF);
        }
    }

    /// Maps a 4xx response to a connector error. Client errors are never retried.
    async fn client_error(status: StatusCode, response: Response) -> ConnectorError {
        match status {
            StatusCode::UNAUTHORIZED => ConnectorError::AuthenticationFailed("Unauthorized".into()),
            StatusCode::FORBIDDEN => ConnectorError::AuthorizationDenied("Forbidden".into()),
            StatusCode::NOT_FOUND => ConnectorError::NotFound("Resource not found".into()),
            StatusCode::BAD_REQUEST => {
                let body = response.text().await.unwrap_or_default();
                ConnectorError::RequestFailed(format!("Bad request: {}", body))
            }
            _ => ConnectorError::RequestFailed(format!("Client error: {}", status)),
        }
    }

    /// Adds authentication to a request.
    async fn add_auth(
        &self,
        request: reqwest::RequestBuilder,
    ) -> ConnectorResult<reqwest::RequestBuilder> {
        match &self.config.auth {
            AuthConfig::None => Ok(request),

            AuthConfig::BearerToken { token } => {
                Ok(request.header("Authorization", format!("Bearer {}", token.expose_secret())))
            }

            AuthConfig::AadToken { token } => Ok(request.header(
                "Authorization",
                aad_authorization_header(token.expose_secret()),
            )),

            AuthConfig::OAuth2 {
                client_id,
                client_secret,
                token_url,
                scopes,
            } => {
                let token = self
                    .get_oauth_token(client_id, client_secret, token_url, scopes)
                    .await?;
                Ok(request.header("Authorization", format!("Bearer {}", token.expose_secret())))
            }
        }
    }

    /// Gets or refreshes an OAuth2 client-credentials token.
    async fn get_oauth_token(
        &self,
        client_id: &str,
        client_secret: &SecureString,
        token_url: &str,
        scopes: &[String],
    ) -> ConnectorResult<SecureString> {
        {
            let token = self.oauth_token.read().await;
            if let Some(t) = &*token {
                if t.expires_at > std::time::Instant::now() + Duration::from_secs(60) {
                    return Ok(t.access_token.clone());
                }
            }
        }

        info!(connector = %self.config.name, "Fetching new OAuth2 token");

        let scope = scopes.join(" ");
        let params = [
            ("grant_type", "client_credentials"),
            ("client_id", client_id),
            ("client_secret", client_secret.expose_secret()),
            ("scope", scope.as_str()),
        ];

        let response = self
            .client
            .post(token_url)
            .form(&params)
            .send()
            .await
            .map_err(|e| ConnectorError::AuthenticationFailed(e.to_string()))?;

        if !response.status().is_success() {
            return Err(ConnectorError::AuthenticationFailed(format!(
                "OAuth2 token request failed: {}",
                response.status()
            )));
        }

        #[derive(serde::Deserialize)]
        struct TokenResponse {
            access_token: String,
            expires_in: u64,
        }

        let token_response: TokenResponse = response
            .json()
            .await
            .map_err(|e| ConnectorError::InvalidResponse(e.to_string()))?;

        let access_token = SecureString::new(token_response.access_token);
        let oauth_token = OAuthToken {
            access_token: access_token.clone(),
            expires_at: std::time::Instant::now() + Duration::from_secs(token_response.expires_in),
        };

        *self.oauth_token.write().await = Some(oauth_token);

        Ok(access_token)
    }
}

/// Formats an Entra ID token for the document store's `Authorization` header.
pub fn aad_authorization_header(token: &str) -> String {
    urlencoding::encode(&format!("type=aad&ver=1.0&sig={}", token)).into_owned()
}

/// Longest wait between two attempts.
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// How long a throttled caller should wait.
///
/// The document store answers 429 with `x-ms-retry-after-ms`; ARM and
/// Resource Graph use `retry-after` in seconds.
fn throttle_delay(headers: &HeaderMap) -> Duration {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
    };
    header("x-ms-retry-after-ms")
        .map(Duration::from_millis)
        .or_else(|| header("retry-after").map(Duration::from_secs))
        .unwrap_or(Duration::from_secs(5))
        .min(MAX_BACKOFF)
}

/// Up to 100ms of jitter for exponential backoff.
fn rand_jitter() -> Duration {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    std::time::Instant::now().hash(&mut hasher);
    Duration::from_millis(hasher.finish() % 100)
}
