//! Mock cloud connectors for testing.
//!
//! `MockResourceGraph` answers graph queries from seeded rows. It does not
//! parse KQL; each request is classified by the parameters it binds and the
//! shape of its projection:
//!
//! | request                                   | answered with                      |
//! |-------------------------------------------|------------------------------------|
//! | binds `since`                             | rows whose `changeTime` is later   |
//! | binds `resource_id`, text has `contains`  | rows whose properties mention it   |
//! | binds `resource_id`                       | the row with that id               |
//! | text ends with `\| project id`            | `{ "id": .. }` for every row       |
//! | anything else                             | rows, filtered by `resource_type`  |

use crate::traits::{
    Connector, ConnectorError, ConnectorHealth, ConnectorResult, GraphQueryPage,
    GraphQueryRequest, RawSubscription, ResourceGraph, ResourceInspector, SubscriptionSource,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

const DEFAULT_MOCK_PAGE_SIZE: usize = 1000;

/// Mock Resource Graph connector.
pub struct MockResourceGraph {
    name: String,
    rows: Arc<RwLock<Vec<Value>>>,
    requests: Arc<RwLock<Vec<GraphQueryRequest>>>,
    failure: Arc<RwLock<Option<ConnectorError>>>,
    healthy: Arc<RwLock<bool>>,
    page_size: Arc<RwLock<usize>>,
    latency: Arc<RwLock<Option<Duration>>>,
    query_count: AtomicU64,
}

impl MockResourceGraph {
    /// Creates an empty mock.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            rows: Arc::new(RwLock::new(Vec::new())),
            requests: Arc::new(RwLock::new(Vec::new())),
            failure: Arc::new(RwLock::new(None)),
            healthy: Arc::new(RwLock::new(true)),
            page_size: Arc::new(RwLock::new(DEFAULT_MOCK_PAGE_SIZE)),
            latency: Arc::new(RwLock::new(None)),
            query_count: AtomicU64::new(0),
        }
    }

    /// Creates a mock seeded with rows.
    pub fn with_rows(name: &str, rows: Vec<Value>) -> Self {
        let mut mock = Self::new(name);
        mock.rows = Arc::new(RwLock::new(rows));
        mock
    }

    /// Adds a row, replacing any existing row with the same id.
    pub async fn upsert_row(&self, row: Value) {
        let mut rows = self.rows.write().await;
        let id = row_id(&row).to_lowercase();
        match rows.iter_mut().find(|r| row_id(r).to_lowercase() == id) {
            Some(existing) => *existing = row,
            None => rows.push(row),
        }
    }

    /// Removes a row by id. Returns whether a row was removed.
    pub async fn remove_row(&self, id: &str) -> bool {
        let mut rows = self.rows.write().await;
        let before = rows.len();
        rows.retain(|r| !row_id(r).eq_ignore_ascii_case(id));
        rows.len() != before
    }

    /// Sets the maximum rows returned per page.
    pub async fn set_page_size(&self, page_size: usize) {
        *self.page_size.write().await = page_size.max(1);
    }

    /// Delays every query by `latency`.
    pub async fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.write().await = latency;
    }

    /// Makes every subsequent query fail with `error` until cleared with `None`.
    pub async fn set_failure(&self, error: Option<ConnectorError>) {
        *self.failure.write().await = error;
    }

    /// Sets the health status of the mock.
    pub async fn set_healthy(&self, healthy: bool) {
        *self.healthy.write().await = healthy;
    }

    /// Number of `query` calls received, including failed ones.
    pub fn query_count(&self) -> u64 {
        self.query_count.load(Ordering::SeqCst)
    }

    /// Requests received, in order.
    pub async fn requests(&self) -> Vec<GraphQueryRequest> {
        self.requests.read().await.clone()
    }

    fn in_scope(row: &Value, subscriptions: &[String]) -> bool {
        if subscriptions.is_empty() {
            return true;
        }
        let sub = row.get("subscriptionId").and_then(Value::as_str).unwrap_or("");
        subscriptions.iter().any(|s| s.eq_ignore_ascii_case(sub))
    }

    fn select(rows: &[Value], request: &GraphQueryRequest) -> ConnectorResult<Vec<Value>> {
        let scoped = rows
            .iter()
            .filter(|row| Self::in_scope(row, &request.subscriptions));

        if let Some(since) = request.parameter("since") {
            let since = parse_time(since).ok_or_else(|| {
                ConnectorError::InvalidRequest(format!("Invalid since timestamp: {}", since))
            })?;
            return Ok(scoped
                .filter(|row| {
                    row.get("changeTime")
                        .and_then(Value::as_str)
                        .and_then(parse_time)
                        .is_some_and(|changed| changed > since)
                })
                .cloned()
                .collect());
        }

        if let Some(resource_id) = request.parameter("resource_id") {
            if request.query.contains("contains") {
                let needle = resource_id.to_lowercase();
                return Ok(scoped
                    .filter(|row| !row_id(row).eq_ignore_ascii_case(resource_id))
                    .filter(|row| {
                        row.get("properties")
                            .map(|p| p.to_string().to_lowercase().contains(&needle))
                            .unwrap_or(false)
                    })
                    .cloned()
                    .collect());
            }
            return Ok(scoped
                .filter(|row| row_id(row).eq_ignore_ascii_case(resource_id))
                .cloned()
                .collect());
        }

        if request.query.trim_end().ends_with("| project id") {
            return Ok(scoped.map(|row| json!({ "id": row_id(row) })).collect());
        }

        let resource_type = request.parameter("resource_type");
        Ok(scoped
            .filter(|row| match resource_type {
                Some(t) => row
                    .get("type")
                    .and_then(Value::as_str)
                    .is_some_and(|rt| rt.eq_ignore_ascii_case(t)),
                None => true,
            })
            .cloned()
            .collect())
    }
}

fn row_id(row: &Value) -> &str {
    row.get("id").and_then(Value::as_str).unwrap_or("")
}

fn parse_time(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

#[async_trait]
impl Connector for MockResourceGraph {
    fn name(&self) -> &str {
        &self.name
    }

    fn connector_type(&self) -> &str {
        "resource_graph"
    }

    async fn health_check(&self) -> ConnectorResult<ConnectorHealth> {
        if *self.healthy.read().await {
            Ok(ConnectorHealth::Healthy)
        } else {
            Ok(ConnectorHealth::Unhealthy("Mock is unhealthy".to_string()))
        }
    }

    async fn test_connection(&self) -> ConnectorResult<bool> {
        Ok(*self.healthy.read().await)
    }
}

#[async_trait]
impl ResourceGraph for MockResourceGraph {
    async fn query(&self, request: &GraphQueryRequest) -> ConnectorResult<GraphQueryPage> {
        self.query_count.fetch_add(1, Ordering::SeqCst);
        self.requests.write().await.push(request.clone());

        let latency = *self.latency.read().await;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        if let Some(error) = self.failure.read().await.clone() {
            return Err(error);
        }

        // Unbound placeholders fail here exactly as they would against the API.
        request.render()?;

        let matched = {
            let rows = self.rows.read().await;
            Self::select(&rows, request)?
        };

        let page_size = {
            let configured = *self.page_size.read().await;
            request
                .top
                .map(|t| (t as usize).min(configured))
                .unwrap_or(configured)
                .max(1)
        };
        let offset = match request.skip_token.as_deref() {
            Some(token) => token.parse::<usize>().map_err(|_| {
                ConnectorError::InvalidRequest(format!("Invalid skip token: {}", token))
            })?,
            None => 0,
        };

        let total = matched.len();
        let rows: Vec<Value> = matched.into_iter().skip(offset).take(page_size).collect();
        let next = offset + rows.len();
        let skip_token = (next < total).then(|| next.to_string());

        Ok(GraphQueryPage {
            rows,
            skip_token,
            total_records: Some(total as u64),
        })
    }
}

/// Mock subscription listing.
pub struct MockSubscriptionSource {
    name: String,
    subscriptions: Arc<RwLock<Vec<RawSubscription>>>,
    failure: Arc<RwLock<Option<ConnectorError>>>,
}

impl MockSubscriptionSource {
    /// Creates a mock listing the given subscriptions.
    pub fn new(name: &str, subscriptions: Vec<RawSubscription>) -> Self {
        Self {
            name: name.to_string(),
            subscriptions: Arc::new(RwLock::new(subscriptions)),
            failure: Arc::new(RwLock::new(None)),
        }
    }

    /// Creates a mock listing enabled subscriptions with the given ids.
    pub fn with_ids(name: &str, ids: &[&str]) -> Self {
        let subscriptions = ids
            .iter()
            .map(|id| RawSubscription {
                subscription_id: id.to_string(),
                display_name: format!("Subscription {}", id),
                state: "Enabled".to_string(),
                tenant_id: "tenant-mock".to_string(),
            })
            .collect();
        Self::new(name, subscriptions)
    }

    /// Replaces the listed subscriptions.
    pub async fn set_subscriptions(&self, subscriptions: Vec<RawSubscription>) {
        *self.subscriptions.write().await = subscriptions;
    }

    /// Makes listing fail with `error` until cleared with `None`.
    pub async fn set_failure(&self, error: Option<ConnectorError>) {
        *self.failure.write().await = error;
    }
}

#[async_trait]
impl Connector for MockSubscriptionSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn connector_type(&self) -> &str {
        "subscriptions"
    }

    async fn health_check(&self) -> ConnectorResult<ConnectorHealth> {
        Ok(ConnectorHealth::Healthy)
    }

    async fn test_connection(&self) -> ConnectorResult<bool> {
        Ok(true)
    }
}

#[async_trait]
impl SubscriptionSource for MockSubscriptionSource {
    async fn list_subscriptions(&self) -> ConnectorResult<Vec<RawSubscription>> {
        if let Some(error) = self.failure.read().await.clone() {
            return Err(error);
        }
        Ok(self.subscriptions.read().await.clone())
    }
}

/// Mock live-inspection connector.
pub struct MockResourceInspector {
    name: String,
    instance_views: Arc<RwLock<HashMap<String, Value>>>,
    resources: Arc<RwLock<HashMap<String, Value>>>,
    failure: Arc<RwLock<Option<ConnectorError>>>,
}

impl MockResourceInspector {
    /// Creates an empty mock.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            instance_views: Arc::new(RwLock::new(HashMap::new())),
            resources: Arc::new(RwLock::new(HashMap::new())),
            failure: Arc::new(RwLock::new(None)),
        }
    }

    /// Registers the instance view returned for a resource id.
    pub async fn set_instance_view(&self, resource_id: &str, view: Value) {
        self.instance_views
            .write()
            .await
            .insert(resource_id.to_lowercase(), view);
    }

    /// Registers the body returned by `get_resource` for a path.
    pub async fn set_resource(&self, path: &str, body: Value) {
        self.resources.write().await.insert(path.to_lowercase(), body);
    }

    /// Makes every call fail with `error` until cleared with `None`.
    pub async fn set_failure(&self, error: Option<ConnectorError>) {
        *self.failure.write().await = error;
    }

    async fn check_failure(&self) -> ConnectorResult<()> {
        match self.failure.read().await.clone() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Connector for MockResourceInspector {
    fn name(&self) -> &str {
        &self.name
    }

    fn connector_type(&self) -> &str {
        "resource_inspector"
    }

    async fn health_check(&self) -> ConnectorResult<ConnectorHealth> {
        Ok(ConnectorHealth::Healthy)
    }

    async fn test_connection(&self) -> ConnectorResult<bool> {
        Ok(true)
    }
}

#[async_trait]
impl ResourceInspector for MockResourceInspector {
    async fn instance_view(&self, resource_id: &str) -> ConnectorResult<Value> {
        self.check_failure().await?;
        self.instance_views
            .read()
            .await
            .get(&resource_id.to_lowercase())
            .cloned()
            .ok_or_else(|| ConnectorError::NotFound(format!("No instance view for {}", resource_id)))
    }

    async fn get_resource(&self, resource_id: &str, _api_version: &str) -> ConnectorResult<Value> {
        self.check_failure().await?;
        self.resources
            .read()
            .await
            .get(&resource_id.to_lowercase())
            .cloned()
            .ok_or_else(|| ConnectorError::NotFound(format!("Resource {} not found", resource_id)))
    }
}
