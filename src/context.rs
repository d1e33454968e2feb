// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Composition root.
//!
//! [`SyncContext`] builds the shared pieces once (change bus, transform
//! cache, offload engine, snapshot store) and hands them to every sync
//! engine it creates. Nothing in the crate is a global.

use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

use crate::bus::ChangeBus;
use crate::cache::KeyedCache;
use crate::config::{EngineConfig, SyncConfig};
use crate::offload::{ComputeOffloadEngine, OffloadResult};
use crate::sync::{
    HttpResourceApi, MemorySnapshotStore, ResourceApi, ResourceSyncEngine, SessionProvider,
    SnapshotStore, SyncError,
};
use crate::types::ScopeId;

pub struct SyncContext {
    config: EngineConfig,
    bus: Arc<ChangeBus>,
    cache: Arc<KeyedCache<OffloadResult>>,
    offload: Arc<ComputeOffloadEngine>,
    snapshots: Arc<dyn SnapshotStore>,
    sync_config: watch::Sender<SyncConfig>,
}

impl SyncContext {
    /// Context with an in-memory snapshot store.
    pub fn new(config: EngineConfig) -> Self {
        Self::with_snapshots(config, Arc::new(MemorySnapshotStore::new()))
    }

    pub fn with_snapshots(config: EngineConfig, snapshots: Arc<dyn SnapshotStore>) -> Self {
        let bus = Arc::new(ChangeBus::new());
        let cache = Arc::new(KeyedCache::from_config("transform", &config.cache));
        let offload = Arc::new(ComputeOffloadEngine::new(config.offload.clone(), cache.clone()));
        let (sync_config, _) = watch::channel(config.sync.clone());

        info!(
            cache_max = config.cache.max_size,
            offload_enabled = config.offload.enabled,
            "Sync context created"
        );

        Self {
            config,
            bus,
            cache,
            offload,
            snapshots,
            sync_config,
        }
    }

    /// Configuration the context was built with. Live sync settings are
    /// in [`sync_config`](Self::sync_config).
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[must_use]
    pub fn bus(&self) -> &Arc<ChangeBus> {
        &self.bus
    }

    #[must_use]
    pub fn cache(&self) -> &Arc<KeyedCache<OffloadResult>> {
        &self.cache
    }

    #[must_use]
    pub fn offload(&self) -> &Arc<ComputeOffloadEngine> {
        &self.offload
    }

    #[must_use]
    pub fn snapshots(&self) -> &Arc<dyn SnapshotStore> {
        &self.snapshots
    }

    /// Sync engine for `scope` wired to the shared bus, snapshots and live config.
    pub fn sync_engine<A: ResourceApi>(&self, api: A, scope: ScopeId) -> ResourceSyncEngine<A> {
        ResourceSyncEngine::new(
            api,
            scope,
            self.bus.clone(),
            self.snapshots.clone(),
            self.sync_config.subscribe(),
        )
    }

    /// HTTP remote built from the `remote` section of the config.
    pub fn http_api(&self, session: Arc<dyn SessionProvider>) -> Result<HttpResourceApi, SyncError> {
        HttpResourceApi::new(&self.config.remote, session)
    }

    /// Push new sync settings to every engine created by this context.
    pub fn update_sync_config(&self, config: SyncConfig) {
        self.sync_config.send_replace(config);
    }

    /// Current sync settings.
    #[must_use]
    pub fn sync_config(&self) -> SyncConfig {
        self.sync_config.borrow().clone()
    }

    /// Stop the offload worker.
    pub fn shutdown(&self) {
        self.offload.shutdown();
        info!("Sync context shut down");
    }
}

impl Default for SyncContext {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}
