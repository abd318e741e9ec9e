//! Document store backed by the Azure Cosmos DB (SQL API) REST interface.

use super::{
    document_keys, DocumentQuery, DocumentStore, QueryResponse, StoreError, StoreResult,
    StoredDocument,
};
use crate::http::HttpClient;
use crate::traits::{ConnectorConfig, ConnectorError};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Response;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, instrument};

const API_VERSION: &str = "2018-12-31";

/// Cosmos DB store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CosmosConfig {
    /// Base connector configuration; `base_url` is the account endpoint and
    /// `auth` is normally `AuthConfig::AadToken`.
    #[serde(flatten)]
    pub connector: ConnectorConfig,
    /// Database name.
    pub database: String,
}

/// Cosmos DB REST store.
pub struct CosmosDocumentStore {
    config: CosmosConfig,
    client: HttpClient,
}

#[derive(Debug, Deserialize)]
struct CosmosQueryBody {
    #[serde(rename = "Documents", default)]
    documents: Vec<Value>,
}

impl CosmosDocumentStore {
    /// Creates a new store client.
    pub fn new(config: CosmosConfig) -> Result<Self, ConnectorError> {
        let client = HttpClient::new(config.connector.clone())?;
        Ok(Self { config, client })
    }

    fn docs_path(&self, container: &str) -> String {
        format!("/dbs/{}/colls/{}/docs", self.config.database, container)
    }

    fn doc_path(&self, container: &str, id: &str) -> String {
        format!(
            "{}/{}",
            self.docs_path(container),
            urlencoding::encode(&to_store_id(id))
        )
    }

    fn base_headers(partition_key: Option<&str>) -> StoreResult<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert("x-ms-version", HeaderValue::from_static(API_VERSION));
        let date = Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string();
        insert(&mut headers, "x-ms-date", &date)?;
        if let Some(pk) = partition_key {
            insert(
                &mut headers,
                "x-ms-documentdb-partitionkey",
                &json!([pk]).to_string(),
            )?;
        }
        Ok(headers)
    }

    fn query_headers(query: &DocumentQuery) -> StoreResult<HeaderMap> {
        let mut headers = Self::base_headers(query.partition_key.as_deref())?;
        headers.insert(
            reqwest::header::CONTENT_TYPE,
            HeaderValue::from_static("application/query+json"),
        );
        headers.insert("x-ms-documentdb-isquery", HeaderValue::from_static("True"));
        if query.is_cross_partition() {
            headers.insert(
                "x-ms-documentdb-query-enablecrosspartition",
                HeaderValue::from_static("True"),
            );
            headers.insert(
                "x-ms-documentdb-query-parallelizecrosspartitionquery",
                HeaderValue::from_static("True"),
            );
        }
        if let Some(max) = query.max_item_count {
            insert(&mut headers, "x-ms-max-item-count", &max.to_string())?;
        }
        if let Some(token) = &query.continuation {
            insert(&mut headers, "x-ms-continuation", token)?;
        }
        Ok(headers)
    }

    /// Renders the query as SQL with OFFSET/LIMIT and ORDER BY applied.
    fn query_body(query: &DocumentQuery) -> Value {
        let mut sql = query.sql.clone();
        if let Some((field, order)) = &query.order_by {
            if !sql.to_uppercase().contains("ORDER BY") {
                sql.push_str(&format!(" ORDER BY c.{} {}", field, order.as_str()));
            }
        }
        if query.offset.is_some() || query.limit.is_some() {
            sql.push_str(&format!(
                " OFFSET {} LIMIT {}",
                query.offset.unwrap_or(0),
                query.limit.unwrap_or(i32::MAX as usize)
            ));
        }
        let parameters: Vec<Value> = query
            .parameters
            .iter()
            .map(|p| json!({ "name": p.name, "value": p.value }))
            .collect();
        json!({ "query": sql, "parameters": parameters })
    }
}

fn insert(headers: &mut HeaderMap, name: &'static str, value: &str) -> StoreResult<()> {
    let value = HeaderValue::from_str(value)
        .map_err(|e| StoreError::InvalidQuery(format!("Invalid {} header: {}", name, e)))?;
    headers.insert(HeaderName::from_static(name), value);
    Ok(())
}

fn request_charge(response: &Response) -> f64 {
    response
        .headers()
        .get("x-ms-request-charge")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<f64>().ok())
        .unwrap_or(0.0)
}

fn continuation(response: &Response) -> Option<String> {
    response
        .headers()
        .get("x-ms-continuation")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Cosmos ids may not contain `/`, `\`, `?` or `#`; resource ids do.
fn to_store_id(id: &str) -> String {
    urlencoding::encode(id).into_owned()
}

fn from_store_id(id: &str) -> String {
    urlencoding::decode(id)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| id.to_string())
}

fn restore_id(mut document: Value) -> Value {
    if let Some(id) = document.get("id").and_then(Value::as_str).map(from_store_id) {
        document["id"] = Value::String(id);
    }
    document
}

#[async_trait]
impl DocumentStore for CosmosDocumentStore {
    fn name(&self) -> &str {
        &self.config.connector.name
    }

    #[instrument(skip(self, document), fields(store = %self.config.connector.name))]
    async fn upsert(&self, container: &str, mut document: Value) -> StoreResult<f64> {
        let (id, partition_key) = document_keys(&document)?;
        document["id"] = Value::String(to_store_id(&id));

        let mut headers = Self::base_headers(Some(&partition_key))?;
        headers.insert("x-ms-documentdb-is-upsert", HeaderValue::from_static("True"));

        let response = self
            .client
            .post_with_headers(&self.docs_path(container), &document, headers)
            .await?;
        Ok(request_charge(&response))
    }

    #[instrument(skip(self, query), fields(store = %self.config.connector.name))]
    async fn query(&self, container: &str, query: &DocumentQuery) -> StoreResult<QueryResponse> {
        let headers = Self::query_headers(query)?;
        let body = Self::query_body(query);
        let response = self
            .client
            .post_with_headers(&self.docs_path(container), &body, headers)
            .await?;

        let request_charge = request_charge(&response);
        let continuation = continuation(&response);
        let parsed: CosmosQueryBody = self.client.parse_json_response(response).await?;
        debug!(
            returned = parsed.documents.len(),
            request_charge, "Cosmos query executed"
        );

        Ok(QueryResponse {
            documents: parsed.documents.into_iter().map(restore_id).collect(),
            request_charge,
            continuation,
        })
    }

    async fn read(
        &self,
        container: &str,
        partition_key: &str,
        id: &str,
    ) -> StoreResult<Option<StoredDocument>> {
        let headers = Self::base_headers(Some(partition_key))?;
        match self
            .client
            .get_with_headers(&self.doc_path(container, id), headers)
            .await
        {
            Ok(response) => {
                let request_charge = request_charge(&response);
                let body: Value = self.client.parse_json_response(response).await?;
                Ok(Some(StoredDocument {
                    body: restore_id(body),
                    request_charge,
                }))
            }
            Err(ConnectorError::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, container: &str, partition_key: &str, id: &str) -> StoreResult<bool> {
        let headers = Self::base_headers(Some(partition_key))?;
        match self
            .client
            .delete_with_headers(&self.doc_path(container, id), headers)
            .await
        {
            Ok(_) => Ok(true),
            Err(ConnectorError::NotFound(_)) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}
