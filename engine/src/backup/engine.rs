//! Backup creation and restore
//!
//! Every backup is assembled in a staging directory, packed to
//! `<id>.tar.gz.partial`, renamed into place, and only then registered.
//! Any failure removes the staging directory and the partial archive and
//! reports the stage it failed at.

use std::collections::{BTreeSet, HashSet};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::archive::{self, IgnoreList};
use crate::backup::manifest::{
    next_backup_id, Manifest, BUILDS_DIR, CONFIG_DIR, DATABASE_FILE, MANIFEST_FILE,
    SETTINGS_FILE, SITES_DIR, VOLUMES_DIR,
};
use crate::deploy::fsm::AppStatus;
use crate::deploy::locks::Locks;
use crate::errors::{BackupStage, EngineError};
use crate::filesys::dir::{copy_dir_all, rename_aside, Dir};
use crate::filesys::file::File;
use crate::models::app::AppKind;
use crate::models::backup::{Backup, BackupContents, BackupOptions, RestoreOptions, RestoreSummary};
use crate::runtime::ContainerRuntime;
use crate::storage::layout::StorageLayout;
use crate::storage::store::{snapshot_app_statuses, suffix_timestamp, StateStore};
use crate::utils::sha256_file;

async fn run_blocking<T, F>(f: F) -> Result<T, EngineError>
where
    F: FnOnce() -> Result<T, EngineError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await?
}

fn partial_path(archive: &Path) -> PathBuf {
    let mut name = OsString::from(archive.as_os_str());
    name.push(".partial");
    PathBuf::from(name)
}

async fn copy_tree(src: PathBuf, dest: PathBuf) -> Result<u64, EngineError> {
    run_blocking(move || Ok(copy_dir_all(&src, &dest)?)).await
}

/// Move `dest` aside with `suffix`, then copy `src` into its place
async fn replace_tree(src: PathBuf, dest: PathBuf, suffix: String) -> Result<(), EngineError> {
    run_blocking(move || {
        if let Some(aside) = rename_aside(&dest, &suffix)? {
            debug!("Moved {} aside to {}", dest.display(), aside.display());
        }
        copy_dir_all(&src, &dest)?;
        Ok(())
    })
    .await
}

pub struct BackupEngine {
    store: Arc<dyn StateStore>,
    runtime: Arc<dyn ContainerRuntime>,
    locks: Arc<Locks>,
    layout: StorageLayout,
}

impl BackupEngine {
    pub fn new(
        store: Arc<dyn StateStore>,
        runtime: Arc<dyn ContainerRuntime>,
        locks: Arc<Locks>,
        layout: StorageLayout,
    ) -> Self {
        Self {
            store,
            runtime,
            locks,
            layout,
        }
    }

    // -------------------------------------------------------------- create

    pub async fn create(&self, options: BackupOptions) -> Result<Backup, EngineError> {
        let _ops = self.locks.try_lock_cross_app("create a backup")?;

        let created_at = Utc::now();
        let id = self.allocate_id(created_at)?;
        info!(
            "Creating backup {} (volumes: {}, builds: {})",
            id, options.include_volumes, options.include_builds
        );

        let staging = self.layout.staging_dir().subdir(&id);
        let result = self.create_staged(&id, created_at, options, &staging).await;

        if let Err(e) = staging.delete().await {
            warn!("Failed to remove backup staging {}: {}", staging.path().display(), e);
        }
        match &result {
            Ok(backup) => info!("Backup {} created ({} bytes)", backup.id, backup.size_bytes),
            Err(e) => {
                error!("Backup {} failed: {}", id, e);
                let partial = File::new(partial_path(&self.layout.backup_archive(&id)));
                if let Err(e) = partial.delete().await {
                    warn!("Failed to remove partial archive: {}", e);
                }
            }
        }
        result
    }

    fn allocate_id(&self, at: DateTime<Utc>) -> Result<String, EngineError> {
        let existing: HashSet<String> = self
            .store
            .list_backups()?
            .into_iter()
            .map(|b| b.id)
            .collect();
        Ok(next_backup_id(at, |id| {
            existing.contains(id) || self.layout.backup_archive(id).exists()
        }))
    }

    async fn create_staged(
        &self,
        id: &str,
        created_at: DateTime<Utc>,
        options: BackupOptions,
        staging: &Dir,
    ) -> Result<Backup, EngineError> {
        use BackupStage::*;

        staging
            .recreate()
            .await
            .map_err(|e| EngineError::backup(SnapshotDatabase, e))?;
        let root = staging.path().to_path_buf();
        let mut contents = BackupContents::default();

        let snapshot = root.join(DATABASE_FILE);
        {
            // New deployments wait while the snapshot is taken
            let _quiet = self.locks.quiesce().await;
            let store = self.store.clone();
            let dest = snapshot.clone();
            run_blocking(move || store.snapshot_to(&dest))
                .await
                .map_err(|e| EngineError::backup(SnapshotDatabase, e))?;
        }
        let database_sha256 = run_blocking(move || Ok(sha256_file(&snapshot)?))
            .await
            .map_err(|e| EngineError::backup(SnapshotDatabase, e))?;
        contents.database = true;

        contents.config = self
            .stage_config(&root)
            .await
            .map_err(|e| EngineError::backup(CopyConfig, e))?;

        contents.sites = self
            .stage_sites(&root)
            .await
            .map_err(|e| EngineError::backup(CopySites, e))?;

        if options.include_volumes {
            contents.volumes = self
                .stage_volumes(&root)
                .await
                .map_err(|e| EngineError::backup(ExportVolumes, e))?;
        }

        if options.include_builds {
            contents.builds = self
                .stage_builds(&root)
                .await
                .map_err(|e| EngineError::backup(CopyBuilds, e))?;
        }

        let mut manifest = Manifest::new(id, created_at, contents.clone());
        manifest.database_sha256 = Some(database_sha256);
        File::new(root.join(MANIFEST_FILE))
            .write_json(&manifest)
            .await
            .map_err(|e| EngineError::backup(Archive, e))?;

        let archive_path = self.layout.backup_archive(id);
        let partial = partial_path(&archive_path);
        {
            let (src, dest) = (root.clone(), partial.clone());
            run_blocking(move || {
                archive::pack_to_file(&src, &dest, &IgnoreList::none())?;
                Ok(())
            })
            .await
            .map_err(|e| EngineError::backup(Archive, e))?;
        }
        tokio::fs::rename(&partial, &archive_path)
            .await
            .map_err(|e| EngineError::backup(Archive, e))?;
        let size_bytes = tokio::fs::metadata(&archive_path)
            .await
            .map_err(|e| EngineError::backup(Archive, e))?
            .len();

        let backup = Backup {
            id: id.to_string(),
            created_at,
            size_bytes,
            contents,
            path: archive_path.clone(),
        };
        if let Err(e) = self.store.insert_backup(&backup) {
            if let Err(e) = File::new(&archive_path).delete().await {
                warn!("Failed to remove unregistered archive: {}", e);
            }
            return Err(EngineError::backup(Register, e));
        }
        Ok(backup)
    }

    async fn stage_config(&self, root: &Path) -> Result<bool, EngineError> {
        let mut staged = false;

        let settings = self.layout.settings_file();
        if settings.exists().await {
            tokio::fs::copy(settings.path(), root.join(SETTINGS_FILE)).await?;
            staged = true;
        }

        let config = self.layout.config_dir();
        if config.exists().await {
            copy_tree(config.path().to_path_buf(), root.join(CONFIG_DIR)).await?;
            staged = true;
        }
        Ok(staged)
    }

    async fn stage_sites(&self, root: &Path) -> Result<Vec<String>, EngineError> {
        let mut sites = Vec::new();
        for app in self.store.list_apps()? {
            if app.kind != AppKind::StaticSite {
                continue;
            }
            let site = self.layout.site_dir(&app.name);
            if !site.exists().await {
                debug!("{} has no published site yet", app.name);
                continue;
            }
            copy_tree(site.path().to_path_buf(), root.join(SITES_DIR).join(&app.name)).await?;
            sites.push(app.name);
        }
        Ok(sites)
    }

    /// Export named volumes declared by any app
    async fn stage_volumes(&self, root: &Path) -> Result<Vec<String>, EngineError> {
        let mut declared = BTreeSet::new();
        for app in self.store.list_apps()? {
            declared.extend(app.volumes.keys().cloned());
            for service in &app.services {
                declared.extend(service.volumes.keys().cloned());
            }
        }
        if declared.is_empty() {
            return Ok(Vec::new());
        }

        let available: HashSet<String> = self.runtime.list_volumes().await?.into_iter().collect();
        let dir = Dir::new(root.join(VOLUMES_DIR));
        dir.create().await?;

        let mut exported = Vec::new();
        for name in declared {
            if !available.contains(&name) {
                warn!("Volume {} does not exist yet, skipping", name);
                continue;
            }
            let dest = dir.path().join(format!("{}.tar", name));
            self.runtime.export_volume(&name, &dest).await?;
            debug!("Exported volume {}", name);
            exported.push(name);
        }
        Ok(exported)
    }

    async fn stage_builds(&self, root: &Path) -> Result<bool, EngineError> {
        let builds = self.layout.builds_dir();
        if !builds.exists().await {
            return Ok(false);
        }
        copy_tree(builds.path().to_path_buf(), root.join(BUILDS_DIR)).await?;
        Ok(true)
    }

    // ------------------------------------------------------------- restore

    pub async fn restore(
        &self,
        id: &str,
        options: RestoreOptions,
    ) -> Result<RestoreSummary, EngineError> {
        let _ops = self.locks.try_lock_cross_app("restore a backup")?;
        let backup = self
            .store
            .get_backup(id)?
            .ok_or_else(|| EngineError::NotFound(format!("Backup {}", id)))?;
        info!("Restoring backup {} ({:?})", backup.id, options);

        let staging = self.layout.staging_dir().subdir(&format!("restore-{}", backup.id));
        let result = self.restore_staged(&backup, options, &staging).await;

        if let Err(e) = staging.delete().await {
            warn!("Failed to remove restore staging {}: {}", staging.path().display(), e);
        }
        match &result {
            Ok(summary) => info!(
                "Restored backup {} (database: {}, config: {}, apps: {}, volumes: {})",
                summary.backup_id,
                summary.database_restored,
                summary.config_restored.len(),
                summary.apps_restored.len(),
                summary.volumes_restored.len()
            ),
            Err(e) => error!("Restore of {} failed: {}", backup.id, e),
        }
        result
    }

    async fn restore_staged(
        &self,
        backup: &Backup,
        options: RestoreOptions,
        staging: &Dir,
    ) -> Result<RestoreSummary, EngineError> {
        use BackupStage::*;

        if !backup.path.is_file() {
            return Err(EngineError::restore(
                Extract,
                format!("archive {} is missing", backup.path.display()),
            ));
        }
        staging
            .recreate()
            .await
            .map_err(|e| EngineError::restore(Extract, e))?;
        let root = staging.path().to_path_buf();
        {
            let (src, dest) = (backup.path.clone(), root.clone());
            run_blocking(move || {
                archive::unpack_file(&src, &dest, &IgnoreList::none())?;
                Ok(())
            })
            .await
            .map_err(|e| EngineError::restore(Extract, e))?;
        }

        let manifest: Manifest = File::new(root.join(MANIFEST_FILE))
            .read_json()
            .await
            .map_err(|e| EngineError::restore(Verify, e))?;
        let snapshot = root.join(DATABASE_FILE);
        let digest = if snapshot.is_file() {
            let path = snapshot.clone();
            Some(
                run_blocking(move || Ok(sha256_file(&path)?))
                    .await
                    .map_err(|e| EngineError::restore(Verify, e))?,
            )
        } else {
            None
        };
        manifest
            .verify(&backup.id, digest.as_deref())
            .map_err(|e| EngineError::restore(Verify, e))?;

        let suffix = format!("bak-{}", suffix_timestamp(Utc::now()));
        let contents = &manifest.contents;
        let mut summary = RestoreSummary {
            backup_id: backup.id.clone(),
            ..Default::default()
        };

        if options.restore_database {
            if contents.database {
                let _quiet = self.locks.quiesce().await;
                self.ensure_idle()?;
                self.restore_database(&snapshot, &mut summary)
                    .await
                    .map_err(|e| EngineError::restore(RestoreDatabase, e))?;
            } else {
                summary
                    .warnings
                    .push("Backup has no database snapshot".to_string());
            }
        }

        if options.restore_config {
            if contents.config {
                self.restore_config(&root, &suffix, &mut summary)
                    .await
                    .map_err(|e| EngineError::restore(RestoreConfig, e))?;
            } else {
                summary
                    .warnings
                    .push("Backup has no configuration files".to_string());
            }
        }

        if options.restore_apps {
            self.restore_apps(&root, contents, &suffix, &mut summary)
                .await
                .map_err(|e| EngineError::restore(RestoreApps, e))?;
        }

        if options.restore_volumes {
            self.restore_volumes(&root, contents, &suffix, &mut summary)
                .await
                .map_err(|e| EngineError::restore(RestoreVolumes, e))?;
        }

        Ok(summary)
    }

    /// Database restore must not race an in-flight app operation
    fn ensure_idle(&self) -> Result<(), EngineError> {
        for app in self.store.list_apps()? {
            if self.locks.is_app_locked(&app.name) {
                return Err(EngineError::Conflict(format!(
                    "Cannot restore the database: app '{}' has an operation in progress",
                    app.name
                )));
            }
        }
        Ok(())
    }

    async fn restore_database(
        &self,
        snapshot: &Path,
        summary: &mut RestoreSummary,
    ) -> Result<(), EngineError> {
        let src = snapshot.to_path_buf();
        let statuses = run_blocking(move || snapshot_app_statuses(&src)).await?;

        let db_path = self.layout.db_path();
        let mut pre_restore = OsString::from(db_path.as_os_str());
        pre_restore.push(format!(".pre-restore-{}", suffix_timestamp(Utc::now())));
        let pre_restore = PathBuf::from(pre_restore);

        let store = self.store.clone();
        let src = snapshot.to_path_buf();
        let saved = pre_restore.clone();
        run_blocking(move || {
            store.snapshot_to(&saved)?;
            store.restore_from(&src)
        })
        .await?;
        info!("Database restored; previous copy at {}", pre_restore.display());

        summary.database_restored = true;
        summary.restart_recommended = statuses
            .into_iter()
            .filter(|(_, status)| *status == AppStatus::Running)
            .map(|(name, _)| name)
            .collect();
        Ok(())
    }

    async fn restore_config(
        &self,
        root: &Path,
        suffix: &str,
        summary: &mut RestoreSummary,
    ) -> Result<(), EngineError> {
        let settings_src = root.join(SETTINGS_FILE);
        if settings_src.is_file() {
            let dest = self.layout.settings_file().path().to_path_buf();
            rename_aside(&dest, suffix)?;
            tokio::fs::copy(&settings_src, &dest).await?;
            summary.config_restored.push(SETTINGS_FILE.to_string());
            summary
                .warnings
                .push("Restored settings apply on the next engine start".to_string());
        }

        let config_src = root.join(CONFIG_DIR);
        if config_src.is_dir() {
            let dest = self.layout.config_dir().path().to_path_buf();
            replace_tree(config_src, dest, suffix.to_string()).await?;
            summary.config_restored.push(CONFIG_DIR.to_string());
        }
        Ok(())
    }

    /// Published sites, plus build contexts when the backup has them
    async fn restore_apps(
        &self,
        root: &Path,
        contents: &BackupContents,
        suffix: &str,
        summary: &mut RestoreSummary,
    ) -> Result<(), EngineError> {
        for name in &contents.sites {
            let src = root.join(SITES_DIR).join(name);
            if !src.is_dir() {
                summary
                    .warnings
                    .push(format!("Site of '{}' is listed but missing from the archive", name));
                continue;
            }
            let dest = self.layout.site_dir(name).path().to_path_buf();
            replace_tree(src, dest, suffix.to_string()).await?;
            summary.apps_restored.push(name.clone());
        }

        if contents.builds {
            let builds = Dir::new(root.join(BUILDS_DIR));
            for src in builds.list_dirs().await? {
                let Some(name) = src.file_name().map(|n| n.to_string_lossy().into_owned()) else {
                    continue;
                };
                let dest = self.layout.build_dir(&name).path().to_path_buf();
                replace_tree(src, dest, suffix.to_string()).await?;
                if !summary.apps_restored.contains(&name) {
                    summary.apps_restored.push(name);
                }
            }
        }
        Ok(())
    }

    async fn restore_volumes(
        &self,
        root: &Path,
        contents: &BackupContents,
        suffix: &str,
        summary: &mut RestoreSummary,
    ) -> Result<(), EngineError> {
        if contents.volumes.is_empty() {
            debug!("Backup {} has no volumes", summary.backup_id);
            return Ok(());
        }

        let live: HashSet<String> = self.runtime.list_volumes().await?.into_iter().collect();
        let asides = self.layout.volume_asides_dir();
        asides.create().await?;

        for name in &contents.volumes {
            let src = root.join(VOLUMES_DIR).join(format!("{}.tar", name));
            if !src.is_file() {
                summary
                    .warnings
                    .push(format!("Volume '{}' is listed but missing from the archive", name));
                continue;
            }
            if live.contains(name) {
                let aside = asides.path().join(format!("{}.tar.{}", name, suffix));
                self.runtime.export_volume(name, &aside).await?;
                debug!("Exported volume {} aside to {}", name, aside.display());
                summary.volumes_set_aside.push(aside);
            }
            self.runtime.import_volume(name, &src).await?;
            summary.volumes_restored.push(name.clone());
        }
        Ok(())
    }

    // ---------------------------------------------------------- management

    pub fn list(&self) -> Result<Vec<Backup>, EngineError> {
        self.store.list_backups()
    }

    /// Remove a backup's row and archive. Returns warnings, e.g. for an
    /// archive that was already gone.
    pub async fn delete(&self, id: &str) -> Result<Vec<String>, EngineError> {
        let backup = self
            .store
            .get_backup(id)?
            .ok_or_else(|| EngineError::NotFound(format!("Backup {}", id)))?;

        let mut warnings = Vec::new();
        let archive = File::new(&backup.path);
        if archive.exists().await {
            archive.delete().await?;
        } else {
            warn!("Archive of backup {} was already missing", id);
            warnings.push(format!("Archive {} was already missing", backup.path.display()));
        }

        self.store.delete_backup(id)?;
        info!("Deleted backup {}", id);
        Ok(warnings)
    }

    /// Remove staging directories and partial archives left by an engine
    /// that stopped mid-backup. Returns the number of entries removed.
    pub async fn sweep_stale(&self) -> Result<usize, EngineError> {
        let mut removed = 0;

        let staging = self.layout.staging_dir();
        if staging.exists().await {
            removed += staging.list_names().await?.len();
            staging.delete().await?;
        }

        let backups = self.layout.backups_dir();
        for name in backups.list_names().await? {
            if name.ends_with(".partial") {
                backups.file(&name).delete().await?;
                removed += 1;
            }
        }

        if removed > 0 {
            info!("Removed {} stale backup leftovers", removed);
        }
        Ok(removed)
    }
}
