//! Storage layout configuration

use std::path::{Path, PathBuf};

use crate::errors::EngineError;
use crate::filesys::dir::Dir;
use crate::filesys::file::File;

pub const DEFAULT_BASE_DIR: &str = "/var/lib/deckhand";

/// On-disk layout of an installation
#[derive(Debug, Clone)]
pub struct StorageLayout {
    /// Base directory for all storage
    pub base_dir: PathBuf,
}

impl StorageLayout {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn settings_file(&self) -> File {
        File::new(self.base_dir.join("settings.json"))
    }

    /// Operator-managed configuration files, included in backups
    pub fn config_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("config"))
    }

    pub fn db_path(&self) -> PathBuf {
        self.base_dir.join("deckhand.db")
    }

    /// Per-app build contexts
    pub fn builds_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("builds"))
    }

    pub fn build_dir(&self, app: &str) -> Dir {
        self.builds_dir().subdir(app)
    }

    /// Published static-site directories
    pub fn sites_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("sites"))
    }

    pub fn site_dir(&self, app: &str) -> Dir {
        self.sites_dir().subdir(app)
    }

    /// Site staged by a build in progress. App names never contain a dot.
    pub fn site_stage_dir(&self, app: &str) -> Dir {
        self.sites_dir().subdir(&format!("{}.next", app))
    }

    pub fn backups_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("backups"))
    }

    pub fn backup_archive(&self, id: &str) -> PathBuf {
        self.backups_dir().path().join(format!("{}.tar.gz", id))
    }

    /// Live volumes exported before a restore overwrote them
    pub fn volume_asides_dir(&self) -> Dir {
        self.backups_dir().subdir("volumes")
    }

    /// Scratch space for backup and restore staging
    pub fn staging_dir(&self) -> Dir {
        self.backups_dir().subdir(".staging")
    }

    pub fn logs_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("logs"))
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Create all directories
    pub async fn setup(&self) -> Result<(), EngineError> {
        Dir::new(&self.base_dir).create().await?;
        self.config_dir().create().await?;
        self.builds_dir().create().await?;
        self.sites_dir().create().await?;
        self.backups_dir().create().await?;
        self.logs_dir().create().await?;
        Ok(())
    }
}

impl Default for StorageLayout {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_DIR)
    }
}
