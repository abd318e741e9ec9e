//! Metrics for the inventory pipeline.
//!
//! Uses the `metrics` facade; without an installed recorder every call is a
//! no-op, so library code records unconditionally.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use std::sync::Once;
use std::time::Duration;

/// Cache tier that served (or failed to serve) a lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheTier {
    /// In-process memory tier.
    L1,
    /// Persistent document-store tier.
    L2,
    /// Neither tier had the entry.
    Miss,
}

impl CacheTier {
    /// Label value used on cache metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheTier::L1 => "l1",
            CacheTier::L2 => "l2",
            CacheTier::Miss => "miss",
        }
    }
}

static DESCRIBE: Once = Once::new();

/// Registers metric descriptions. Safe to call more than once.
pub fn describe_metrics() {
    DESCRIBE.call_once(|| {
        describe_counter!(
            "iw_cache_lookups_total",
            "Cache lookups by serving tier (l1, l2, miss)"
        );
        describe_counter!("iw_cache_writes_total", "Cache write-through operations");
        describe_histogram!("iw_cache_write_items", "Documents per cache write");
        describe_counter!(
            "iw_cache_l2_errors_total",
            "Document-store errors converted into cache misses"
        );
        describe_gauge!("iw_cache_l1_entries", "Entries currently held in L1");

        describe_counter!(
            "iw_discovery_resources_total",
            "Resources returned by discovery queries"
        );
        describe_counter!(
            "iw_discovery_pages_total",
            "Resource graph pages fetched"
        );
        describe_histogram!("iw_scan_duration_seconds", "Duration of scheduler scan jobs");
        describe_counter!("iw_scans_total", "Scheduler scan jobs by outcome");

        describe_histogram!(
            "iw_query_request_charge",
            "Request units reported by the document store per query shape"
        );
        describe_counter!(
            "iw_circuit_open_total",
            "Times a feature circuit was forced open"
        );
    });
}

/// Records which tier served a cache lookup.
pub fn record_cache_lookup(tier: CacheTier) {
    counter!("iw_cache_lookups_total", "tier" => tier.as_str()).increment(1);
}

/// Records a cache write.
pub fn record_cache_write(resource_type: &str, items: usize) {
    counter!("iw_cache_writes_total", "resource_type" => resource_type.to_string()).increment(1);
    histogram!("iw_cache_write_items").record(items as f64);
}

/// Records an L2 failure that was degraded to a miss.
pub fn record_cache_l2_error(operation: &'static str) {
    counter!("iw_cache_l2_errors_total", "operation" => operation).increment(1);
}

/// Records the current L1 size.
pub fn record_l1_entries(entries: usize) {
    gauge!("iw_cache_l1_entries").set(entries as f64);
}

/// Records resources returned for a subscription.
pub fn record_discovery_resources(subscription_id: &str, count: usize) {
    counter!("iw_discovery_resources_total", "subscription_id" => subscription_id.to_string())
        .increment(count as u64);
}

/// Records one resource graph page.
pub fn record_discovery_page() {
    counter!("iw_discovery_pages_total").increment(1);
}

/// Records a finished scheduler job.
pub fn record_scan(job: &'static str, succeeded: bool, duration: Duration) {
    let outcome = if succeeded { "success" } else { "failure" };
    counter!("iw_scans_total", "job" => job, "outcome" => outcome).increment(1);
    histogram!("iw_scan_duration_seconds", "job" => job).record(duration.as_secs_f64());
}

/// Records the request charge of a document-store query.
pub fn record_query_charge(shape: &str, request_charge: f64) {
    histogram!("iw_query_request_charge", "shape" => shape.to_string()).record(request_charge);
}

/// Records a forced circuit opening.
pub fn record_circuit_open(feature: &str) {
    counter!("iw_circuit_open_total", "feature" => feature.to_string()).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_tier_labels() {
        assert_eq!(CacheTier::L1.as_str(), "l1");
        assert_eq!(CacheTier::L2.as_str(), "l2");
        assert_eq!(CacheTier::Miss.as_str(), "miss");
    }

    #[test]
    fn test_recording_without_recorder_is_noop() {
        describe_metrics();
        describe_metrics();
        record_cache_lookup(CacheTier::L1);
        record_cache_write("microsoft.compute/virtualmachines", 2);
        record_scan("full_refresh", true, Duration::from_millis(15));
        record_query_charge("resources_by_type", 2.8);
        record_circuit_open("discovery");
    }
}
