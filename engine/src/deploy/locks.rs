//! Operation locks
//!
//! Per-app try-locks reject a second mutation of the same app instead of
//! queueing it. Cross-app operations (backup, restore, prune) share one coarser
//! lock. The acceptance barrier lets a backup snapshot briefly hold off new
//! deployments without blocking anything already running.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tokio::sync::{MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;

use crate::errors::EngineError;

#[derive(Default)]
struct AppLockSet {
    held: Mutex<HashSet<String>>,
}

/// Held while an operation owns an app; released on drop
pub struct AppGuard {
    set: Arc<AppLockSet>,
    app: String,
}

impl AppGuard {
    pub fn app(&self) -> &str {
        &self.app
    }
}

impl Drop for AppGuard {
    fn drop(&mut self) {
        let mut held = self.set.held.lock().unwrap_or_else(|e| e.into_inner());
        held.remove(&self.app);
        debug!("Released lock on {}", self.app);
    }
}

impl std::fmt::Debug for AppGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppGuard").field("app", &self.app).finish()
    }
}

#[derive(Default)]
pub struct Locks {
    apps: Arc<AppLockSet>,
    acceptance: RwLock<()>,
    cross_app: tokio::sync::Mutex<()>,
}

impl Locks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the app's lock or fail with a conflict
    pub fn try_lock_app(&self, app: &str) -> Result<AppGuard, EngineError> {
        let mut held = self.apps.held.lock().unwrap_or_else(|e| e.into_inner());
        if !held.insert(app.to_string()) {
            return Err(EngineError::Conflict(format!(
                "App '{}' has an operation in progress",
                app
            )));
        }
        debug!("Acquired lock on {}", app);
        Ok(AppGuard {
            set: self.apps.clone(),
            app: app.to_string(),
        })
    }

    pub fn is_app_locked(&self, app: &str) -> bool {
        let held = self.apps.held.lock().unwrap_or_else(|e| e.into_inner());
        held.contains(app)
    }

    /// Shared side of the barrier, held while a deployment is accepted
    pub async fn accept(&self) -> RwLockReadGuard<'_, ()> {
        self.acceptance.read().await
    }

    /// Exclusive side of the barrier, held while the database is snapshotted or replaced
    pub async fn quiesce(&self) -> RwLockWriteGuard<'_, ()> {
        self.acceptance.write().await
    }

    /// Take the cross-app lock or fail with a conflict
    pub fn try_lock_cross_app(&self, operation: &str) -> Result<MutexGuard<'_, ()>, EngineError> {
        self.cross_app.try_lock().map_err(|_| {
            EngineError::Conflict(format!(
                "Cannot {}: another backup, restore, or prune is running",
                operation
            ))
        })
    }
}
