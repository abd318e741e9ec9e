//! Request-charge benchmark for the inventory query shapes.

use super::builder::{point_read_target, InventoryQueries, QueryShape};
use chrono::{Duration as ChronoDuration, Utc};
use iw_connectors::{DocumentQuery, DocumentStore, FieldFilter, StoreResult};
use iw_observability::metrics::record_query_charge;
use serde::Serialize;
use std::fmt::Write as _;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Default per-query budget in request units.
pub const DEFAULT_TARGET_RU: f64 = 5.0;

/// Parameter values the benchmark queries with.
#[derive(Debug, Clone)]
pub struct BenchmarkSample {
    pub resource_type: String,
    pub location: String,
    pub name_fragment: String,
    pub tag: (String, String),
    /// Id for the point read; a synthetic id is used when unset.
    pub resource_id: Option<String>,
    /// Window for the changed-since query.
    pub changed_within: Duration,
}

impl Default for BenchmarkSample {
    fn default() -> Self {
        Self {
            resource_type: "microsoft.compute/virtualmachines".to_string(),
            location: "eastus".to_string(),
            name_fragment: "web".to_string(),
            tag: ("environment".to_string(), "production".to_string()),
            resource_id: None,
            changed_within: Duration::from_secs(3600),
        }
    }
}

/// One executed query.
#[derive(Debug, Clone, Serialize)]
pub struct QueryMeasurement {
    pub shape: &'static str,
    pub request_charge: f64,
    pub latency_ms: f64,
    pub documents: usize,
    pub within_target: bool,
    pub suggestions: Vec<String>,
}

/// Results of a benchmark run.
#[derive(Debug, Clone, Serialize)]
pub struct BenchmarkReport {
    pub subscription_id: String,
    pub target_ru: f64,
    pub measurements: Vec<QueryMeasurement>,
    pub average_ru: f64,
    pub max_ru: f64,
    pub passed: usize,
}

impl BenchmarkReport {
    pub fn total(&self) -> usize {
        self.measurements.len()
    }

    pub fn all_within_target(&self) -> bool {
        self.passed == self.total()
    }

    pub fn measurement(&self, shape: QueryShape) -> Option<&QueryMeasurement> {
        self.measurements.iter().find(|m| m.shape == shape.as_str())
    }

    /// Human-readable summary.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "Query benchmark for {} (target {:.1} RU)",
            self.subscription_id, self.target_ru
        );
        let _ = writeln!(
            out,
            "{:<28} {:>8} {:>10} {:>6}  status",
            "shape", "RU", "latency", "docs"
        );
        for m in &self.measurements {
            let _ = writeln!(
                out,
                "{:<28} {:>8.2} {:>8.2}ms {:>6}  {}",
                m.shape,
                m.request_charge,
                m.latency_ms,
                m.documents,
                if m.within_target { "ok" } else { "OVER" }
            );
            for suggestion in &m.suggestions {
                let _ = writeln!(out, "    - {}", suggestion);
            }
        }
        let _ = writeln!(
            out,
            "{}/{} within target, average {:.2} RU, max {:.2} RU",
            self.passed,
            self.total(),
            self.average_ru,
            self.max_ru
        );
        out
    }
}

/// Runs every query shape against a store and grades the request charges.
#[derive(Debug, Clone)]
pub struct QueryBenchmark {
    queries: InventoryQueries,
    target_ru: f64,
    sample: BenchmarkSample,
}

impl Default for QueryBenchmark {
    fn default() -> Self {
        Self::new(InventoryQueries::default())
    }
}

impl QueryBenchmark {
    pub fn new(queries: InventoryQueries) -> Self {
        Self {
            queries,
            target_ru: DEFAULT_TARGET_RU,
            sample: BenchmarkSample::default(),
        }
    }

    pub fn with_target(mut self, target_ru: f64) -> Self {
        self.target_ru = target_ru;
        self
    }

    pub fn with_sample(mut self, sample: BenchmarkSample) -> Self {
        self.sample = sample;
        self
    }

    fn cases(&self, subscription_id: &str) -> Vec<(QueryShape, DocumentQuery)> {
        let s = &self.sample;
        let q = &self.queries;
        let resource_id = s.resource_id.clone().unwrap_or_else(|| {
            format!(
                "/subscriptions/{}/resourceGroups/benchmark/providers/{}/probe",
                subscription_id, s.resource_type
            )
        });
        let since = Utc::now()
            - ChronoDuration::from_std(s.changed_within).unwrap_or_else(|_| ChronoDuration::hours(1));

        vec![
            (
                QueryShape::ResourcesByType,
                q.resources_by_type(subscription_id, &s.resource_type, None),
            ),
            (
                QueryShape::SearchByName,
                q.search_by_name(subscription_id, &s.name_fragment),
            ),
            (QueryShape::ByTag, q.by_tag(subscription_id, &s.tag.0, &s.tag.1)),
            (
                QueryShape::RelationshipLookup,
                q.relationship_lookup(subscription_id, &resource_id),
            ),
            (
                QueryShape::ByTypeAndLocation,
                q.by_type_and_location(subscription_id, &s.resource_type, &s.location),
            ),
            (QueryShape::CountByType, q.count_by_type(subscription_id)),
            (QueryShape::ChangedSince, q.changed_since(subscription_id, since)),
            (
                QueryShape::AllSubscriptionsByType,
                q.all_subscriptions_by_type(&s.resource_type),
            ),
        ]
    }

    /// Executes every shape once.
    pub async fn run(
        &self,
        store: &dyn DocumentStore,
        subscription_id: &str,
    ) -> StoreResult<BenchmarkReport> {
        let mut measurements = Vec::new();

        for (shape, query) in self.cases(subscription_id) {
            let started = Instant::now();
            let response = self.queries.execute(store, &query).await?;
            let latency_ms = started.elapsed().as_secs_f64() * 1000.0;

            record_query_charge(shape.as_str(), response.request_charge);
            let within_target = response.request_charge <= self.target_ru;
            let suggestions = if within_target {
                Vec::new()
            } else {
                self.suggest(&query)
            };
            if !within_target {
                warn!(
                    shape = %shape,
                    request_charge = response.request_charge,
                    target = self.target_ru,
                    "Query over request-charge target"
                );
            }

            measurements.push(QueryMeasurement {
                shape: shape.as_str(),
                request_charge: response.request_charge,
                latency_ms,
                documents: response.documents.len(),
                within_target,
                suggestions,
            });
        }

        let charges: Vec<f64> = measurements.iter().map(|m| m.request_charge).collect();
        let average_ru = if charges.is_empty() {
            0.0
        } else {
            charges.iter().sum::<f64>() / charges.len() as f64
        };
        let max_ru = charges.iter().cloned().fold(0.0, f64::max);
        let passed = measurements.iter().filter(|m| m.within_target).count();

        info!(
            subscription_id,
            passed,
            total = measurements.len(),
            average_ru,
            max_ru,
            "Query benchmark complete"
        );

        Ok(BenchmarkReport {
            subscription_id: subscription_id.to_string(),
            target_ru: self.target_ru,
            measurements,
            average_ru,
            max_ru,
            passed,
        })
    }

    /// Remedies for a query over target.
    fn suggest(&self, query: &DocumentQuery) -> Vec<String> {
        let mut suggestions = Vec::new();

        for filter in &query.filters {
            if let FieldFilter::ContainsIgnoreCase { field, .. } = filter {
                suggestions.push(format!(
                    "avoid substring scan on {}; add an equality field (exact or normalised name) and filter on it",
                    field
                ));
            }
        }

        if query.is_cross_partition() {
            suggestions
                .push("add partition key (subscription_id) to avoid cross-partition fan-out".to_string());
        }

        let filters_id = query
            .filters
            .iter()
            .any(|f| matches!(f, FieldFilter::Equals { field, .. } if field == "id"));
        if filters_id && point_read_target(query).is_none() {
            suggestions.push("use a point read (id + partition key) instead of a query".to_string());
        }

        let mut equality_paths: Vec<String> = Vec::new();
        if query.partition_key.is_some() {
            equality_paths.push("/subscription_id".to_string());
        }
        for filter in &query.filters {
            if let FieldFilter::Equals { field, .. } = filter {
                let path = format!("/{}", field);
                if field != "id" && !equality_paths.contains(&path) {
                    equality_paths.push(path);
                }
            }
        }
        if equality_paths.len() > 1 {
            let paths: Vec<&str> = equality_paths.iter().map(String::as_str).collect();
            if !self.queries.indexing_policy().covers(&paths) {
                suggestions.push(format!("add composite index ({})", paths.join(", ")));
            }
        }

        if query.group_count.is_some() {
            suggestions.push(
                "aggregate reads every document in the partition; maintain per-type counts at write time"
                    .to_string(),
            );
        }

        suggestions
    }
}
