//! Server state

use std::sync::Arc;

use crate::backup::BackupEngine;
use crate::deploy::DeployEngine;
use crate::health::HealthMonitor;

const DEFAULT_MAX_UPLOAD_BYTES: usize = 512 * 1024 * 1024;

/// Server state shared across handlers
pub struct ServerState {
    pub engine: Arc<DeployEngine>,
    pub backups: Arc<BackupEngine>,
    pub monitor: Arc<HealthMonitor>,

    /// Body limit of the deploy route
    pub max_upload_bytes: usize,
}

impl ServerState {
    pub fn new(
        engine: Arc<DeployEngine>,
        backups: Arc<BackupEngine>,
        monitor: Arc<HealthMonitor>,
    ) -> Self {
        Self {
            engine,
            backups,
            monitor,
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
        }
    }

    pub fn with_max_upload_bytes(mut self, bytes: usize) -> Self {
        self.max_upload_bytes = bytes;
        self
    }
}
