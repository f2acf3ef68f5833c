//! Route synchronization

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use crate::deploy::fsm::AppStatus;
use crate::errors::EngineError;
use crate::models::app::App;
use crate::proxy::ProxyAdapter;
use crate::routes::{desired_route, route_id};
use crate::storage::store::StateStore;

/// Pushes desired routes to the proxy. Failures are logged and remembered so
/// the next health sweep can retry; they never fail the calling operation.
pub struct RouteSyncer {
    proxy: Arc<dyn ProxyAdapter>,
    base_domain: Option<String>,
    pending: Mutex<BTreeSet<String>>,
}

impl RouteSyncer {
    pub fn new(proxy: Arc<dyn ProxyAdapter>, base_domain: Option<String>) -> Self {
        Self {
            proxy,
            base_domain,
            pending: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn base_domain(&self) -> Option<&str> {
        self.base_domain.as_deref()
    }

    /// Upsert the app's route, or remove it if the app should have none.
    /// Returns whether the proxy accepted the change.
    pub async fn sync(&self, app: &App) -> bool {
        let result = match desired_route(app, self.base_domain.as_deref()) {
            Some(route) => {
                debug!("Syncing route {} -> {}", route.id, route.upstream);
                self.proxy.upsert_route(&route).await
            }
            None => self.proxy.remove_route(&route_id(&app.name)).await,
        };

        match result {
            Ok(()) => {
                self.clear_pending(&app.name);
                true
            }
            Err(e) => {
                warn!("Route sync for {} failed, will retry: {}", app.name, e);
                self.mark_pending(&app.name);
                false
            }
        }
    }

    /// Remove the app's route
    pub async fn remove(&self, app_name: &str) -> bool {
        match self.proxy.remove_route(&route_id(app_name)).await {
            Ok(()) => {
                self.clear_pending(app_name);
                true
            }
            Err(e) => {
                warn!("Route removal for {} failed, will retry: {}", app_name, e);
                self.mark_pending(app_name);
                false
            }
        }
    }

    /// Apps whose last push failed
    pub fn pending(&self) -> Vec<String> {
        let pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        pending.iter().cloned().collect()
    }

    /// Retry failed pushes against the current app records
    pub async fn retry_pending(&self, store: &dyn StateStore) -> Result<(), EngineError> {
        for name in self.pending() {
            match store.get_app(&name)? {
                Some(app) if app.status == AppStatus::Running => {
                    self.sync(&app).await;
                }
                _ => {
                    self.remove(&name).await;
                }
            }
        }
        Ok(())
    }

    /// Re-push routes of all running apps and remove the rest
    pub async fn resync_all(&self, store: &dyn StateStore) -> Result<(), EngineError> {
        let apps = store.list_apps()?;
        info!("Resyncing routes for {} apps", apps.len());
        for app in apps {
            if app.status == AppStatus::Running {
                self.sync(&app).await;
            } else {
                self.remove(&app.name).await;
            }
        }
        Ok(())
    }

    fn mark_pending(&self, app_name: &str) {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        pending.insert(app_name.to_string());
    }

    fn clear_pending(&self, app_name: &str) {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        pending.remove(app_name);
    }
}
