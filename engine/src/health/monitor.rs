//! Health monitor
//!
//! Each sweep checks running apps (and failed apps that still have an active
//! deployment) by container state plus the app's probe. A streak of failures
//! at the threshold fails the app and hands it to a rollback task that keeps
//! the app's lock.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::deploy::fsm::{AppEvent, AppStatus};
use crate::deploy::locks::AppGuard;
use crate::deploy::DeployEngine;
use crate::errors::EngineError;
use crate::health::registry::{CheckStatus, HealthRecord};
use crate::models::app::App;

#[derive(Debug, Clone)]
pub struct MonitorOptions {
    /// Consecutive failures that fail a running app
    pub failure_threshold: u32,
}

impl Default for MonitorOptions {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
        }
    }
}

/// Health state of one app as reported to callers
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub app: String,
    pub status: AppStatus,
    pub check: CheckStatus,
    pub consecutive_failures: u32,
    pub last_checked: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl HealthReport {
    fn new(app: &App, record: HealthRecord) -> Self {
        Self {
            app: app.name.clone(),
            status: app.status,
            check: record.last_status,
            consecutive_failures: record.consecutive_failures,
            last_checked: record.last_checked,
            last_error: record.last_error,
        }
    }
}

pub struct HealthMonitor {
    engine: Arc<DeployEngine>,
    options: MonitorOptions,
    rollbacks: Mutex<Vec<JoinHandle<()>>>,
}

impl HealthMonitor {
    pub fn new(engine: Arc<DeployEngine>, options: MonitorOptions) -> Self {
        Self {
            engine,
            options,
            rollbacks: Mutex::new(Vec::new()),
        }
    }

    /// Check every eligible app once and retry pending route pushes.
    /// Returns the number of apps checked.
    pub async fn sweep(&self) -> Result<usize, EngineError> {
        let store = self.engine.store().clone();
        let mut checked = 0;

        for app in store.list_apps()? {
            if !self.is_eligible(&app)? {
                continue;
            }
            let guard = match self.engine.locks().try_lock_app(&app.name) {
                Ok(guard) => guard,
                Err(_) => {
                    debug!("Skipping health check of {}: operation in progress", app.name);
                    continue;
                }
            };

            let _accepting = self.engine.locks().accept().await;
            // Status may have moved while the lock was free
            let Some(app) = store.get_app_by_id(&app.id)? else {
                continue;
            };
            if !self.is_eligible(&app)? {
                continue;
            }

            if let Err(e) = self.check_locked(app, guard).await {
                error!("Health check failed to complete: {}", e);
            }
            checked += 1;
        }

        self.engine.routes().retry_pending(store.as_ref()).await?;
        Ok(checked)
    }

    /// Run one check right away; it counts toward the same failure streak
    pub async fn check_now(&self, name: &str) -> Result<HealthReport, EngineError> {
        let guard = self.engine.locks().try_lock_app(name)?;
        let _accepting = self.engine.locks().accept().await;
        let app = self.engine.get_app(name)?;
        if !matches!(app.status, AppStatus::Running | AppStatus::Failed) {
            return Err(EngineError::Conflict(format!(
                "App '{}' is {}; only running or failed apps are checked",
                app.name, app.status
            )));
        }

        let record = self.check_locked(app, guard).await?;
        let app = self.engine.get_app(name)?;
        Ok(HealthReport::new(&app, record))
    }

    pub fn report(&self, name: &str) -> Result<HealthReport, EngineError> {
        let app = self.engine.get_app(name)?;
        let record = self.engine.health().get(&app.name);
        Ok(HealthReport::new(&app, record))
    }

    /// Wait for rollbacks started by earlier sweeps
    pub async fn wait_for_rollbacks(&self) {
        let handles = {
            let mut rollbacks = self.rollbacks.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *rollbacks)
        };
        for handle in handles {
            if let Err(e) = handle.await {
                error!("Rollback task panicked: {}", e);
            }
        }
    }

    fn is_eligible(&self, app: &App) -> Result<bool, EngineError> {
        Ok(match app.status {
            AppStatus::Running => true,
            AppStatus::Failed => self.engine.store().active_deployment(&app.id)?.is_some(),
            _ => false,
        })
    }

    async fn check_locked(&self, app: App, guard: AppGuard) -> Result<HealthRecord, EngineError> {
        let result = match self.engine.containers().all_running(&app).await {
            Ok(()) => self.engine.prober().probe(&app).await,
            Err(reason) => Err(reason),
        };
        let registry = self.engine.health();

        match result {
            Ok(()) => {
                let record = registry.record_success(&app.name);
                if app.status == AppStatus::Failed {
                    self.engine
                        .lifecycle()
                        .apply(&app, AppEvent::Recovered)
                        .await?;
                    info!("{} passes health checks again", app.name);
                }
                Ok(record)
            }
            Err(reason) => {
                let record = registry.record_failure(&app.name, &reason);
                warn!(
                    "Health check of {} failed ({}/{}): {}",
                    app.name, record.consecutive_failures, self.options.failure_threshold, reason
                );

                if app.status == AppStatus::Running
                    && record.consecutive_failures >= self.options.failure_threshold
                {
                    let failed = self
                        .engine
                        .lifecycle()
                        .apply(&app, AppEvent::HealthFailed(reason))
                        .await?;
                    self.spawn_rollback(failed, guard);
                }
                Ok(record)
            }
        }
    }

    fn spawn_rollback(&self, app: App, guard: AppGuard) {
        let engine = self.engine.clone();
        let handle = tokio::spawn(async move {
            match engine.rollback_after_failure(guard, &app.id).await {
                Ok(Some(restored)) => info!("{} rolled back and {}", restored.name, restored.status),
                Ok(None) => {}
                Err(e) => error!("Rollback of {} failed: {}", app.name, e),
            }
        });

        let mut rollbacks = self.rollbacks.lock().unwrap_or_else(|e| e.into_inner());
        rollbacks.retain(|h| !h.is_finished());
        rollbacks.push(handle);
    }
}
