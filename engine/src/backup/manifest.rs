//! Backup archive manifest and ids

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::models::backup::BackupContents;

pub const MANIFEST_FILE: &str = "manifest.json";
pub const DATABASE_FILE: &str = "database.sqlite";
pub const SETTINGS_FILE: &str = "settings.json";
pub const CONFIG_DIR: &str = "config";
pub const SITES_DIR: &str = "sites";
pub const VOLUMES_DIR: &str = "volumes";
pub const BUILDS_DIR: &str = "builds";

/// Bumped when the archive layout changes incompatibly
pub const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub format: u32,
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub engine_version: String,
    pub contents: BackupContents,

    /// Hex sha256 of `database.sqlite`
    pub database_sha256: Option<String>,
}

impl Manifest {
    pub fn new(id: &str, created_at: DateTime<Utc>, contents: BackupContents) -> Self {
        Self {
            format: FORMAT_VERSION,
            id: id.to_string(),
            created_at,
            engine_version: env!("CARGO_PKG_VERSION").to_string(),
            contents,
            database_sha256: None,
        }
    }

    /// Check the manifest belongs to `id` and the database digest matches
    pub fn verify(&self, id: &str, database_sha256: Option<&str>) -> Result<(), String> {
        if self.format > FORMAT_VERSION {
            return Err(format!(
                "archive format {} is newer than supported {}",
                self.format, FORMAT_VERSION
            ));
        }
        if self.id != id {
            return Err(format!("manifest is for backup {}, expected {}", self.id, id));
        }
        if self.contents.database {
            match (self.database_sha256.as_deref(), database_sha256) {
                (Some(expected), Some(actual)) if expected == actual => {}
                (Some(_), Some(_)) => return Err("database checksum mismatch".to_string()),
                (_, None) => return Err("database snapshot missing from archive".to_string()),
                (None, Some(_)) => return Err("manifest has no database checksum".to_string()),
            }
        }
        Ok(())
    }
}

/// Sortable id with millisecond precision: `YYYYMMDD-HHMMSS-mmm` (UTC)
pub fn backup_id(at: DateTime<Utc>) -> String {
    at.format("%Y%m%d-%H%M%S-%3f").to_string()
}

/// First id at or after `at` that `taken` does not report as used
pub fn next_backup_id(at: DateTime<Utc>, taken: impl Fn(&str) -> bool) -> String {
    let mut at = at;
    loop {
        let id = backup_id(at);
        if !taken(&id) {
            return id;
        }
        at += Duration::milliseconds(1);
    }
}
