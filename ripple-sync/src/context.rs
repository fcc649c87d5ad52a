//! Synchronization context.
//!
//! One context owns one store, its query registry and its mutation
//! pipeline. Contexts are independent: tests build one each, and nothing
//! is process-global.

use ripple_core::{SyncConfig, SyncResult};
use ripple_storage::{EntityStore, QueryRegistry};
use tracing::info;

use crate::mutation::MutationPipeline;

/// Handle passed to every workflow entry point.
///
/// Cloning is cheap; clones share the same cache.
#[derive(Debug, Clone)]
pub struct SyncContext {
    config: SyncConfig,
    registry: QueryRegistry,
    mutations: MutationPipeline,
}

impl SyncContext {
    /// Validate `config` and build an empty cache.
    pub fn init(config: SyncConfig) -> SyncResult<Self> {
        config.validate()?;
        let store = EntityStore::new(config.query);
        let registry = QueryRegistry::new(store);
        let mutations = MutationPipeline::new(registry.clone(), config.mutation);
        info!(
            stale_after_ms = config.query.stale_after.as_millis() as u64,
            gc_after_ms = config.query.gc_after.as_millis() as u64,
            cleanup_orphaned_assets = config.saga.cleanup_orphaned_assets,
            "Sync context initialized"
        );
        Ok(Self {
            config,
            registry,
            mutations,
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> &EntityStore {
        self.registry.store()
    }

    pub fn queries(&self) -> &QueryRegistry {
        &self.registry
    }

    pub fn mutations(&self) -> &MutationPipeline {
        &self.mutations
    }

    /// Cancel every fetch and drop every record. Handles obtained from this
    /// context stop receiving updates.
    pub fn dispose(&self) {
        self.registry.dispose();
        info!("Sync context disposed");
    }

    pub fn is_disposed(&self) -> bool {
        self.store().is_disposed()
    }
}
