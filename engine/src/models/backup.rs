//! Backup models

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What a backup archive contains
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupContents {
    pub database: bool,
    pub config: bool,

    /// Static-site apps whose published directory is included
    #[serde(default)]
    pub sites: Vec<String>,

    /// Named volumes exported into the archive
    #[serde(default)]
    pub volumes: Vec<String>,

    /// Whether per-app build contexts are included
    #[serde(default)]
    pub builds: bool,
}

/// A completed, registered backup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backup {
    /// Timestamp-derived, sortable id
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub size_bytes: u64,
    pub contents: BackupContents,
    pub path: PathBuf,
}

/// Backup creation options
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupOptions {
    #[serde(default)]
    pub include_volumes: bool,

    #[serde(default)]
    pub include_builds: bool,
}

/// Independent restore flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreOptions {
    #[serde(default)]
    pub restore_database: bool,

    #[serde(default)]
    pub restore_config: bool,

    #[serde(default)]
    pub restore_apps: bool,

    #[serde(default)]
    pub restore_volumes: bool,
}

impl RestoreOptions {
    /// Restore everything the backup holds
    pub fn all() -> Self {
        Self {
            restore_database: true,
            restore_config: true,
            restore_apps: true,
            restore_volumes: true,
        }
    }
}

/// Outcome of a restore
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreSummary {
    pub backup_id: String,
    pub database_restored: bool,
    pub config_restored: Vec<String>,
    pub apps_restored: Vec<String>,
    pub volumes_restored: Vec<String>,

    /// Exports of the volumes a restore replaced
    pub volumes_set_aside: Vec<PathBuf>,
    pub warnings: Vec<String>,

    /// Apps whose containers may disagree with the restored records
    pub restart_recommended: Vec<String>,
}
