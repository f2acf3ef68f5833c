//! Per-app health records

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    #[default]
    Unknown,
    Healthy,
    Unhealthy,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthRecord {
    pub consecutive_failures: u32,
    pub last_checked: Option<DateTime<Utc>>,
    pub last_status: CheckStatus,
    pub last_error: Option<String>,
}

/// In-memory health state, keyed by app name
#[derive(Default)]
pub struct HealthRegistry {
    records: RwLock<HashMap<String, HealthRecord>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current record, or an unknown one if the app was never checked
    pub fn get(&self, app: &str) -> HealthRecord {
        let records = self.records.read().unwrap_or_else(|e| e.into_inner());
        records.get(app).cloned().unwrap_or_default()
    }

    /// Record a passing check; clears the failure streak
    pub fn record_success(&self, app: &str) -> HealthRecord {
        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
        let record = records.entry(app.to_string()).or_default();
        record.consecutive_failures = 0;
        record.last_checked = Some(Utc::now());
        record.last_status = CheckStatus::Healthy;
        record.last_error = None;
        record.clone()
    }

    /// Record a failing check and return the updated record
    pub fn record_failure(&self, app: &str, error: &str) -> HealthRecord {
        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
        let record = records.entry(app.to_string()).or_default();
        record.consecutive_failures = record.consecutive_failures.saturating_add(1);
        record.last_checked = Some(Utc::now());
        record.last_status = CheckStatus::Unhealthy;
        record.last_error = Some(error.to_string());
        record.clone()
    }

    /// Start the app over with a clean streak, e.g. after a release
    pub fn reset(&self, app: &str) {
        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
        records.remove(app);
    }

    pub fn forget(&self, app: &str) {
        self.reset(app);
    }

    pub fn len(&self) -> usize {
        let records = self.records.read().unwrap_or_else(|e| e.into_inner());
        records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
