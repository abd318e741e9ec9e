//! Shared components built once per process.

use crate::cache::TwoTierCache;
use crate::config::InventoryConfig;
use crate::discovery::DiscoveryEngine;
use crate::scheduler::DiscoveryScheduler;
use iw_connectors::DocumentStore;
use iw_policy::RolloutController;
use std::sync::Arc;
use tracing::info;

/// The cache, rollout controller, discovery engine and store shared by the
/// scheduler and the client. Build it once and pass it around in an `Arc`.
pub struct InventoryContext {
    config: InventoryConfig,
    cache: Arc<TwoTierCache>,
    rollout: Arc<RolloutController>,
    engine: Option<Arc<DiscoveryEngine>>,
    store: Option<Arc<dyn DocumentStore>>,
}

impl InventoryContext {
    /// Creates a context with an L1-only cache and no discovery engine.
    pub fn new(config: InventoryConfig) -> Self {
        let cache = Arc::new(build_cache(&config, None));
        let rollout = Arc::new(RolloutController::new(config.rollout.clone()));
        Self {
            config,
            cache,
            rollout,
            engine: None,
            store: None,
        }
    }

    /// Adds a document store, used as the cache's L2 tier and for persisted
    /// resources.
    pub fn with_store(mut self, store: Arc<dyn DocumentStore>) -> Self {
        self.cache = Arc::new(build_cache(&self.config, Some(Arc::clone(&store))));
        self.store = Some(store);
        self
    }

    /// Adds the discovery engine with this context's paging limits applied.
    /// Without one, reads are served from the cache only.
    pub fn with_discovery(mut self, engine: DiscoveryEngine) -> Self {
        let engine = engine.with_config(self.config.discovery.clone());
        info!(
            page_size = engine.config().page_size,
            max_pages = engine.config().max_pages,
            "Discovery engine configured"
        );
        self.engine = Some(Arc::new(engine));
        self
    }

    pub fn config(&self) -> &InventoryConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<TwoTierCache> {
        &self.cache
    }

    pub fn rollout(&self) -> &Arc<RolloutController> {
        &self.rollout
    }

    pub fn engine(&self) -> Option<&Arc<DiscoveryEngine>> {
        self.engine.as_ref()
    }

    pub fn store(&self) -> Option<&Arc<dyn DocumentStore>> {
        self.store.as_ref()
    }

    /// A scheduler over this context's components, if discovery is configured.
    pub fn scheduler(&self) -> Option<DiscoveryScheduler> {
        let engine = self.engine.as_ref()?;
        let mut scheduler = DiscoveryScheduler::new(
            Arc::clone(engine),
            Arc::clone(&self.cache),
            Arc::clone(&self.rollout),
        )
        .with_config(self.config.scheduler.clone());
        if let Some(store) = &self.store {
            scheduler = scheduler.with_store(Arc::clone(store));
        }
        Some(scheduler)
    }
}

fn build_cache(config: &InventoryConfig, store: Option<Arc<dyn DocumentStore>>) -> TwoTierCache {
    let cache = TwoTierCache::new(config.cache.ttl_policy(), config.cache.l1_capacity)
        .with_container(config.cache.container.clone());
    match store {
        Some(store) => {
            info!(store = %store.name(), container = %config.cache.container, "L2 cache enabled");
            cache.with_store(store)
        }
        None => cache,
    }
}
