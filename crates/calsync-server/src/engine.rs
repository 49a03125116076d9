//! Wiring of store, adapters and services from a [`SyncConfig`].

use std::sync::Arc;

use tracing::info;

use calsync_providers::{Adapters, QuotaManager, RetryExecutor};

use crate::admin::AdminService;
use crate::config::SyncConfig;
use crate::error::ServerResult;
use crate::merger::EventMerger;
use crate::scheduler::SyncScheduler;
use crate::store::Store;
use crate::sync::SyncService;
use crate::todo::TodoService;

/// Every service of a running instance, sharing one store.
#[derive(Debug)]
pub struct Engine {
    pub store: Arc<Store>,
    pub sync: SyncService,
    pub scheduler: SyncScheduler,
    pub merger: Arc<EventMerger>,
    pub admin: AdminService,
    pub todos: TodoService,
    pub quota: Arc<QuotaManager>,
}

impl Engine {
    /// Opens the configured database and the HTTP adapters.
    pub fn open(config: &SyncConfig) -> ServerResult<Self> {
        let path = config.database_path();
        info!(database = %path.display(), "opening store");
        let store = Arc::new(Store::open(&path)?);
        Ok(Self::with_parts(config, store, Adapters::http()?))
    }

    /// Builds the services on top of an existing store and adapter set.
    pub fn with_parts(config: &SyncConfig, store: Arc<Store>, adapters: Adapters) -> Self {
        let quota = Arc::new(QuotaManager::with_clock(config.quota, store.clock().clone()));
        let merger = Arc::new(EventMerger::new(store.clone(), config.merge_cache_ttl()));
        let sync = SyncService::new(store.clone(), adapters.clone(), config.sync.window_extension_days);
        let scheduler = SyncScheduler::new(
            sync.clone(),
            quota.clone(),
            config.sources(),
            config.features.sync_enabled,
            config.features.sync_interval(),
        );
        let admin = AdminService::new(
            store.clone(),
            adapters,
            quota.clone(),
            RetryExecutor::default(),
            config.features.write_flags(),
            merger.clone(),
        );
        Self {
            todos: TodoService::new(store.clone()),
            store,
            sync,
            scheduler,
            merger,
            admin,
            quota,
        }
    }

    /// Bootstraps sources and runs one cycle in the foreground.
    pub async fn sync_once(&self, configured: &SyncConfig) -> ServerResult<Vec<crate::sync::SyncReport>> {
        self.sync.sources().bootstrap(&configured.sources())?;
        let reports = self.sync.sync_all().await?;
        self.merger.invalidate();
        Ok(reports)
    }
}
