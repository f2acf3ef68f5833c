//! Application state management

use std::sync::Arc;

use tracing::{info, warn};

use crate::app::options::AppOptions;
use crate::backup::BackupEngine;
use crate::deploy::DeployEngine;
use crate::errors::EngineError;
use crate::health::HealthMonitor;
use crate::proxy::{CaddyProxy, DisabledProxy, ProxyAdapter};
use crate::routes::RouteSyncer;
use crate::runtime::docker::CliRuntime;
use crate::runtime::ContainerRuntime;
use crate::storage::store::{SqliteStore, StateStore};

/// Main application state
pub struct AppState {
    /// Deploy engine; owns app mutations
    pub engine: Arc<DeployEngine>,

    pub backups: Arc<BackupEngine>,

    pub monitor: Arc<HealthMonitor>,
}

impl AppState {
    /// Build the engine over its real adapters
    pub async fn init(options: &AppOptions) -> Result<Self, EngineError> {
        info!("Initializing application state...");

        options.layout.setup().await?;

        let db_path = options.layout.db_path();
        let store = tokio::task::spawn_blocking(move || SqliteStore::open(&db_path)).await??;
        let store: Arc<dyn StateStore> = Arc::new(store);

        let runtime: Arc<dyn ContainerRuntime> = Arc::new(CliRuntime::new(
            &options.runtime.binary,
            &options.runtime.helper_image,
        ));

        let proxy: Arc<dyn ProxyAdapter> = if options.proxy.enabled {
            Arc::new(CaddyProxy::new(
                &options.proxy.admin_url,
                &options.proxy.http_server,
                &options.proxy.https_server,
            )?)
        } else {
            info!("Proxy disabled; routes will not be pushed");
            Arc::new(DisabledProxy)
        };

        Self::with_adapters(options, store, runtime, proxy)
    }

    /// Build the engine over the given adapters
    pub fn with_adapters(
        options: &AppOptions,
        store: Arc<dyn StateStore>,
        runtime: Arc<dyn ContainerRuntime>,
        proxy: Arc<dyn ProxyAdapter>,
    ) -> Result<Self, EngineError> {
        let routes = Arc::new(RouteSyncer::new(proxy, options.proxy.base_domain.clone()));
        let engine = Arc::new(DeployEngine::new(
            store.clone(),
            runtime.clone(),
            routes,
            options.layout.clone(),
            options.engine.clone(),
        )?);
        let backups = Arc::new(BackupEngine::new(
            store,
            runtime,
            engine.locks().clone(),
            options.layout.clone(),
        ));
        let monitor = Arc::new(HealthMonitor::new(engine.clone(), options.monitor.clone()));

        Ok(Self {
            engine,
            backups,
            monitor,
        })
    }

    /// Settle whatever a previous run left half done
    pub async fn recover(&self) -> Result<(), EngineError> {
        if let Err(e) = self.engine.runtime().list_containers().await {
            warn!("Container runtime is not reachable: {}", e);
        }
        self.backups.sweep_stale().await?;
        self.engine.recover().await
    }

    /// Shutdown application state
    pub async fn shutdown(&self) -> Result<(), EngineError> {
        info!("Shutting down application state...");
        self.monitor.wait_for_rollbacks().await;
        Ok(())
    }
}
