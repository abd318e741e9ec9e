//! Scheduler delta-cycle tests: full refresh, then incremental refreshes
//! that add, modify and delete resources, checked against the cache and the
//! persisted resources container.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use iw_connectors::store::RESOURCES_CONTAINER;
use iw_connectors::testing::{resource_id, sample_site_row, sample_vm_row};
use iw_connectors::{DocumentStore, InMemoryDocumentStore, MockResourceGraph, MockSubscriptionSource};
use iw_core::{
    DiscoveryEngine, DiscoveryScheduler, InventoryConfig, InventoryContext, ScanJob, ScanOutcome,
    TwoTierCache,
};
use serde_json::{json, Value};

const VM: &str = "microsoft.compute/virtualmachines";
const SITE: &str = "microsoft.web/sites";

fn changed(mut row: Value) -> Value {
    row["changeTime"] = json!((Utc::now() + chrono::Duration::minutes(1)).to_rfc3339());
    row
}

struct Harness {
    graph: Arc<MockResourceGraph>,
    store: Arc<InMemoryDocumentStore>,
    cache: Arc<TwoTierCache>,
    scheduler: Arc<DiscoveryScheduler>,
}

fn harness(rows: Vec<Value>) -> Harness {
    let graph = Arc::new(MockResourceGraph::with_rows("graph", rows));
    let subs = Arc::new(MockSubscriptionSource::with_ids("subs", &["sub-a", "sub-b"]));
    let store = Arc::new(InMemoryDocumentStore::new("store"));
    let mut config = InventoryConfig::default();
    config.scheduler.max_concurrent_scans = 1;

    let context = InventoryContext::new(config)
        .with_store(store.clone())
        .with_discovery(DiscoveryEngine::new(graph.clone(), subs));
    let cache = context.cache().clone();
    let scheduler = Arc::new(context.scheduler().unwrap());

    Harness {
        graph,
        store,
        cache,
        scheduler,
    }
}

async fn names(cache: &TwoTierCache, sub: &str, resource_type: &str) -> Vec<String> {
    let mut names: Vec<String> = cache
        .get(sub, resource_type, None)
        .await
        .unwrap_or_default()
        .into_iter()
        .map(|d| d.resource_name)
        .collect();
    names.sort();
    names
}

#[tokio::test]
async fn test_delta_cycle() {
    let h = harness(vec![
        sample_vm_row("sub-a", "rg-1", "vm-1"),
        sample_vm_row("sub-a", "rg-1", "vm-2"),
        sample_site_row("sub-a", "rg-1", "web-1"),
        sample_vm_row("sub-b", "rg-2", "vm-9"),
    ]);

    // Cold start: incremental falls back to a full refresh.
    let outcome = h.scheduler.incremental_refresh().await.unwrap();
    assert_eq!(outcome.result().unwrap().job, ScanJob::FullRefresh);
    assert_eq!(names(&h.cache, "sub-a", VM).await, vec!["vm-1", "vm-2"]);
    assert_eq!(h.store.document_count(RESOURCES_CONTAINER).await, 4);

    // vm-3 appears, vm-2 is resized, web-1 is deleted.
    h.graph.upsert_row(changed(sample_vm_row("sub-a", "rg-1", "vm-3"))).await;
    let mut resized = sample_vm_row("sub-a", "rg-1", "vm-2");
    resized["properties"]["hardwareProfile"]["vmSize"] = json!("Standard_D8s_v5");
    h.graph.upsert_row(changed(resized)).await;
    let web_id = resource_id("sub-a", "rg-1", "Microsoft.Web/sites", "web-1");
    assert!(h.graph.remove_row(&web_id).await);

    let outcome = h.scheduler.incremental_refresh().await.unwrap();
    let result = outcome.result().unwrap();
    assert_eq!(result.job, ScanJob::IncrementalRefresh);
    assert!(result.succeeded());
    assert_eq!(result.resource_count, 3);

    assert_eq!(names(&h.cache, "sub-a", VM).await, vec!["vm-1", "vm-2", "vm-3"]);
    assert!(names(&h.cache, "sub-a", SITE).await.is_empty());
    let vm2 = h
        .cache
        .get("sub-a", VM, None)
        .await
        .unwrap()
        .into_iter()
        .find(|d| d.resource_name == "vm-2")
        .unwrap();
    assert_eq!(vm2.selected_properties["vm_size"], "Standard_D8s_v5");

    // Other subscription untouched.
    assert_eq!(names(&h.cache, "sub-b", VM).await, vec!["vm-9"]);

    // web-1 removed from the store, vm-3 added.
    assert_eq!(h.store.document_count(RESOURCES_CONTAINER).await, 4);
    assert!(h
        .store
        .read(RESOURCES_CONTAINER, "sub-a", &web_id)
        .await
        .unwrap()
        .is_none());

    let known = h.scheduler.known_ids("sub-a").await;
    assert_eq!(known.len(), 3);
    assert!(!known.iter().any(|id| id.eq_ignore_ascii_case(&web_id)));

    let stats = h.scheduler.stats(ScanJob::IncrementalRefresh);
    assert_eq!(stats.runs, 1);
    assert_eq!(stats.last_resource_count, 3);
    assert_eq!(stats.failures, 0);
}

#[tokio::test]
async fn test_quiet_incremental_changes_nothing() {
    let h = harness(vec![sample_vm_row("sub-a", "rg-1", "vm-1")]);
    h.scheduler.full_refresh().await.unwrap();
    let first_scan = h.scheduler.last_scan_time("sub-a").await.unwrap();

    tokio::time::sleep(Duration::from_millis(5)).await;
    let outcome = h.scheduler.incremental_refresh().await.unwrap();
    assert_eq!(outcome.result().unwrap().resource_count, 0);
    assert_eq!(names(&h.cache, "sub-a", VM).await, vec!["vm-1"]);
    assert!(h.scheduler.last_scan_time("sub-a").await.unwrap() > first_scan);
}

#[tokio::test]
async fn test_concurrent_full_refresh_is_skipped() {
    let h = harness(vec![sample_vm_row("sub-a", "rg-1", "vm-1")]);
    h.graph.set_latency(Some(Duration::from_millis(20))).await;

    let (a, b) = tokio::join!(h.scheduler.full_refresh(), h.scheduler.full_refresh());
    let outcomes = [a.unwrap(), b.unwrap()];
    let skipped = outcomes.iter().filter(|o| matches!(o, ScanOutcome::Skipped)).count();
    assert_eq!(skipped, 1);
    assert_eq!(h.scheduler.stats(ScanJob::FullRefresh).runs, 1);
}
