//! State store for apps, deployments, and backups
//!
//! SQLite-backed. All status writes go through [`StateStore::apply_transition`],
//! which takes a [`Transition`] produced by the app state machine and applies it
//! as a compare-and-set on the previous status.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::deploy::fsm::{AppStatus, Transition};
use crate::errors::EngineError;
use crate::models::app::App;
use crate::models::backup::{Backup, BackupContents};
use crate::models::deployment::{Deployment, DeploymentStatus, GitMeta};

/// Persistence contract the engine depends on
pub trait StateStore: Send + Sync {
    // Apps
    fn insert_app(&self, app: &App) -> Result<(), EngineError>;
    fn get_app(&self, name: &str) -> Result<Option<App>, EngineError>;
    fn get_app_by_id(&self, id: &str) -> Result<Option<App>, EngineError>;
    fn list_apps(&self) -> Result<Vec<App>, EngineError>;
    /// Update mutable fields; never touches name or status
    fn update_app(&self, app: &App) -> Result<(), EngineError>;
    fn apply_transition(&self, app_id: &str, transition: &Transition) -> Result<(), EngineError>;
    /// Remove the app and cascade to its deployments; false if absent
    fn delete_app(&self, app_id: &str) -> Result<bool, EngineError>;
    /// Whether a hostname is used as domain or alias by another app
    fn hostname_in_use(&self, host: &str, except_app_id: Option<&str>) -> Result<bool, EngineError>;
    fn next_host_port(&self, base: u16) -> Result<u16, EngineError>;

    // Deployments
    fn insert_deployment(&self, deployment: &Deployment) -> Result<(), EngineError>;
    fn get_deployment(&self, id: &str) -> Result<Option<Deployment>, EngineError>;
    /// Deployments of an app, oldest first
    fn list_deployments(&self, app_id: &str) -> Result<Vec<Deployment>, EngineError>;
    fn active_deployment(&self, app_id: &str) -> Result<Option<Deployment>, EngineError>;
    /// Move a building deployment to a terminal status
    fn finish_deployment(&self, deployment: &Deployment) -> Result<(), EngineError>;
    /// Make a deployment the active one and point the app's image at it.
    /// With `demote_previous`, the previously active deployed one becomes rolled-back.
    fn activate_deployment(
        &self,
        app_id: &str,
        deployment_id: &str,
        demote_previous: bool,
    ) -> Result<(), EngineError>;
    fn append_log(&self, deployment_id: &str, chunk: &[u8]) -> Result<(), EngineError>;
    fn read_log(&self, deployment_id: &str) -> Result<Vec<u8>, EngineError>;

    // Backups
    fn insert_backup(&self, backup: &Backup) -> Result<(), EngineError>;
    fn get_backup(&self, id: &str) -> Result<Option<Backup>, EngineError>;
    /// Backups sorted by id
    fn list_backups(&self) -> Result<Vec<Backup>, EngineError>;
    fn delete_backup(&self, id: &str) -> Result<bool, EngineError>;

    // Snapshots
    /// Write a consistent copy of the database to `dest` in one read transaction
    fn snapshot_to(&self, dest: &Path) -> Result<(), EngineError>;
    /// Replace app and deployment tables from a snapshot file in one transaction
    fn restore_from(&self, src: &Path) -> Result<(), EngineError>;
}

const APP_COLUMNS: &str = "id, name, kind, status, domain, aliases, image, env, port, host_port, \
     memory_mb, cpus, volumes, services, health_check, ssl, expose, created_at, updated_at";

const DEPLOYMENT_COLUMNS: &str = "id, app_id, source_kind, source_ref, git_commit, git_branch, \
     git_message, image, service_images, status, active, error, created_at, finished_at";

/// SQLite implementation of the state store
pub struct SqliteStore {
    conn: Mutex<Connection>,
    db_path: Option<PathBuf>,
}

impl SqliteStore {
    /// Open or create the store at a path
    pub fn open(path: &Path) -> Result<Self, EngineError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;

        let store = Self {
            conn: Mutex::new(conn),
            db_path: Some(path.to_path_buf()),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Open a private in-memory store
    pub fn open_in_memory() -> Result<Self, EngineError> {
        let store = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
            db_path: None,
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Path of the database file, if file-backed
    pub fn db_path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn init_schema(&self) -> Result<(), EngineError> {
        let conn = self.conn();
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS apps (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                kind TEXT NOT NULL,
                status TEXT NOT NULL,
                domain TEXT UNIQUE,
                aliases TEXT NOT NULL DEFAULT '[]',
                image TEXT,
                env TEXT NOT NULL DEFAULT '{}',
                port INTEGER,
                host_port INTEGER UNIQUE,
                memory_mb INTEGER,
                cpus REAL,
                volumes TEXT NOT NULL DEFAULT '{}',
                services TEXT NOT NULL DEFAULT '[]',
                health_check TEXT,
                ssl INTEGER NOT NULL DEFAULT 0,
                expose INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS deployments (
                id TEXT PRIMARY KEY,
                app_id TEXT NOT NULL REFERENCES apps(id) ON DELETE CASCADE,
                source_kind TEXT NOT NULL,
                source_ref TEXT,
                git_commit TEXT,
                git_branch TEXT,
                git_message TEXT,
                image TEXT,
                service_images TEXT NOT NULL DEFAULT '{}',
                status TEXT NOT NULL,
                active INTEGER NOT NULL DEFAULT 0,
                error TEXT,
                created_at TEXT NOT NULL,
                finished_at TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_deployments_app
                ON deployments(app_id, created_at);

            CREATE TABLE IF NOT EXISTS deployment_logs (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                deployment_id TEXT NOT NULL REFERENCES deployments(id) ON DELETE CASCADE,
                chunk BLOB NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_deployment_logs_deployment
                ON deployment_logs(deployment_id, seq);

            CREATE TABLE IF NOT EXISTS backups (
                id TEXT PRIMARY KEY,
                created_at TEXT NOT NULL,
                size_bytes INTEGER NOT NULL,
                contents TEXT NOT NULL,
                path TEXT NOT NULL
            );
            "#,
        )?;
        Ok(())
    }
}

fn json_column<T: serde::de::DeserializeOwned>(
    row: &Row<'_>,
    idx: usize,
) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn parsed_column<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: std::str::FromStr<Err = EngineError>,
{
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e: EngineError| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn app_from_row(row: &Row<'_>) -> rusqlite::Result<App> {
    let health_check: Option<String> = row.get(14)?;
    let health_check = match health_check {
        Some(raw) => Some(serde_json::from_str(&raw).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(14, rusqlite::types::Type::Text, Box::new(e))
        })?),
        None => None,
    };

    Ok(App {
        id: row.get(0)?,
        name: row.get(1)?,
        kind: parsed_column(row, 2)?,
        status: parsed_column(row, 3)?,
        domain: row.get(4)?,
        aliases: json_column(row, 5)?,
        image: row.get(6)?,
        env: json_column(row, 7)?,
        port: row.get(8)?,
        host_port: row.get(9)?,
        resources: crate::models::app::ResourceLimits {
            memory_mb: row.get(10)?,
            cpus: row.get(11)?,
        },
        volumes: json_column(row, 12)?,
        services: json_column(row, 13)?,
        health_check,
        ssl: row.get(15)?,
        expose: row.get(16)?,
        created_at: row.get(17)?,
        updated_at: row.get(18)?,
    })
}

fn deployment_from_row(row: &Row<'_>) -> rusqlite::Result<Deployment> {
    let commit: Option<String> = row.get(4)?;
    let branch: Option<String> = row.get(5)?;
    let message: Option<String> = row.get(6)?;
    let git = if commit.is_some() || branch.is_some() || message.is_some() {
        Some(GitMeta {
            commit,
            branch,
            message,
        })
    } else {
        None
    };
    let service_images: BTreeMap<String, String> = json_column(row, 8)?;

    Ok(Deployment {
        id: row.get(0)?,
        app_id: row.get(1)?,
        source: parsed_column(row, 2)?,
        source_ref: row.get(3)?,
        git,
        image: row.get(7)?,
        service_images,
        status: parsed_column(row, 9)?,
        active: row.get(10)?,
        error: row.get(11)?,
        created_at: row.get(12)?,
        finished_at: row.get(13)?,
    })
}

fn backup_from_row(row: &Row<'_>) -> rusqlite::Result<Backup> {
    let contents: BackupContents = json_column(row, 3)?;
    let path: String = row.get(4)?;
    let size: i64 = row.get(2)?;
    Ok(Backup {
        id: row.get(0)?,
        created_at: row.get(1)?,
        size_bytes: size.max(0) as u64,
        contents,
        path: PathBuf::from(path),
    })
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

impl StateStore for SqliteStore {
    fn insert_app(&self, app: &App) -> Result<(), EngineError> {
        let conn = self.conn();
        let result = conn.execute(
            &format!(
                "INSERT INTO apps ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)",
                APP_COLUMNS
            ),
            params![
                app.id,
                app.name,
                app.kind.as_str(),
                app.status.as_str(),
                app.domain,
                serde_json::to_string(&app.aliases)?,
                app.image,
                serde_json::to_string(&app.env)?,
                app.port,
                app.host_port,
                app.resources.memory_mb,
                app.resources.cpus,
                serde_json::to_string(&app.volumes)?,
                serde_json::to_string(&app.services)?,
                app.health_check
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                app.ssl,
                app.expose,
                app.created_at,
                app.updated_at,
            ],
        );

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_constraint_violation(&e) => Err(EngineError::ValidationError(format!(
                "App '{}' conflicts with an existing app (name, domain, or port in use)",
                app.name
            ))),
            Err(e) => Err(e.into()),
        }
    }

    fn get_app(&self, name: &str) -> Result<Option<App>, EngineError> {
        let conn = self.conn();
        let app = conn
            .query_row(
                &format!("SELECT {} FROM apps WHERE name = ?1", APP_COLUMNS),
                params![name],
                app_from_row,
            )
            .optional()?;
        Ok(app)
    }

    fn get_app_by_id(&self, id: &str) -> Result<Option<App>, EngineError> {
        let conn = self.conn();
        let app = conn
            .query_row(
                &format!("SELECT {} FROM apps WHERE id = ?1", APP_COLUMNS),
                params![id],
                app_from_row,
            )
            .optional()?;
        Ok(app)
    }

    fn list_apps(&self) -> Result<Vec<App>, EngineError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!("SELECT {} FROM apps ORDER BY name", APP_COLUMNS))?;
        let apps = stmt
            .query_map([], app_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(apps)
    }

    fn update_app(&self, app: &App) -> Result<(), EngineError> {
        let conn = self.conn();
        let result = conn.execute(
            r#"
            UPDATE apps SET
                domain = ?2, aliases = ?3, env = ?4, port = ?5, host_port = ?6,
                memory_mb = ?7, cpus = ?8, volumes = ?9, services = ?10,
                health_check = ?11, ssl = ?12, expose = ?13, updated_at = ?14
            WHERE id = ?1
            "#,
            params![
                app.id,
                app.domain,
                serde_json::to_string(&app.aliases)?,
                serde_json::to_string(&app.env)?,
                app.port,
                app.host_port,
                app.resources.memory_mb,
                app.resources.cpus,
                serde_json::to_string(&app.volumes)?,
                serde_json::to_string(&app.services)?,
                app.health_check
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                app.ssl,
                app.expose,
                app.updated_at,
            ],
        );

        match result {
            Ok(0) => Err(EngineError::NotFound(format!("App '{}'", app.name))),
            Ok(_) => Ok(()),
            Err(e) if is_constraint_violation(&e) => Err(EngineError::ValidationError(format!(
                "Update of '{}' conflicts with another app (domain or port in use)",
                app.name
            ))),
            Err(e) => Err(e.into()),
        }
    }

    fn apply_transition(&self, app_id: &str, transition: &Transition) -> Result<(), EngineError> {
        let conn = self.conn();
        let updated = conn.execute(
            "UPDATE apps SET status = ?1, updated_at = ?2 WHERE id = ?3 AND status = ?4",
            params![
                transition.to().as_str(),
                Utc::now(),
                app_id,
                transition.from().as_str()
            ],
        )?;

        if updated == 0 {
            let current: Option<String> = conn
                .query_row(
                    "SELECT status FROM apps WHERE id = ?1",
                    params![app_id],
                    |row| row.get(0),
                )
                .optional()?;
            return match current {
                None => Err(EngineError::NotFound(format!("App {}", app_id))),
                Some(status) => Err(EngineError::Conflict(format!(
                    "App {} is {}, expected {} for {}",
                    app_id,
                    status,
                    transition.from(),
                    transition.event()
                ))),
            };
        }
        Ok(())
    }

    fn delete_app(&self, app_id: &str) -> Result<bool, EngineError> {
        let conn = self.conn();
        let deleted = conn.execute("DELETE FROM apps WHERE id = ?1", params![app_id])?;
        Ok(deleted > 0)
    }

    fn hostname_in_use(&self, host: &str, except_app_id: Option<&str>) -> Result<bool, EngineError> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT id, domain, aliases FROM apps")?;
        let rows = stmt.query_map([], |row| {
            let id: String = row.get(0)?;
            let domain: Option<String> = row.get(1)?;
            let aliases: Vec<String> = json_column(row, 2)?;
            Ok((id, domain, aliases))
        })?;

        for row in rows {
            let (id, domain, aliases) = row?;
            if Some(id.as_str()) == except_app_id {
                continue;
            }
            let host_lower = host.to_ascii_lowercase();
            if domain
                .iter()
                .chain(aliases.iter())
                .any(|h| h.to_ascii_lowercase() == host_lower)
            {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn next_host_port(&self, base: u16) -> Result<u16, EngineError> {
        let conn = self.conn();
        let max: Option<u16> =
            conn.query_row("SELECT MAX(host_port) FROM apps", [], |row| row.get(0))?;
        match max {
            Some(port) if port >= base => port.checked_add(1).ok_or_else(|| {
                EngineError::Internal("Host port range exhausted".to_string())
            }),
            _ => Ok(base),
        }
    }

    fn insert_deployment(&self, deployment: &Deployment) -> Result<(), EngineError> {
        let conn = self.conn();
        let git = deployment.git.clone().unwrap_or_default();
        conn.execute(
            &format!(
                "INSERT INTO deployments ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                DEPLOYMENT_COLUMNS
            ),
            params![
                deployment.id,
                deployment.app_id,
                deployment.source.as_str(),
                deployment.source_ref,
                git.commit,
                git.branch,
                git.message,
                deployment.image,
                serde_json::to_string(&deployment.service_images)?,
                deployment.status.as_str(),
                deployment.active,
                deployment.error,
                deployment.created_at,
                deployment.finished_at,
            ],
        )?;
        Ok(())
    }

    fn get_deployment(&self, id: &str) -> Result<Option<Deployment>, EngineError> {
        let conn = self.conn();
        let deployment = conn
            .query_row(
                &format!("SELECT {} FROM deployments WHERE id = ?1", DEPLOYMENT_COLUMNS),
                params![id],
                deployment_from_row,
            )
            .optional()?;
        Ok(deployment)
    }

    fn list_deployments(&self, app_id: &str) -> Result<Vec<Deployment>, EngineError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM deployments WHERE app_id = ?1 ORDER BY created_at, rowid",
            DEPLOYMENT_COLUMNS
        ))?;
        let deployments = stmt
            .query_map(params![app_id], deployment_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(deployments)
    }

    fn active_deployment(&self, app_id: &str) -> Result<Option<Deployment>, EngineError> {
        let conn = self.conn();
        let deployment = conn
            .query_row(
                &format!(
                    "SELECT {} FROM deployments WHERE app_id = ?1 AND active = 1",
                    DEPLOYMENT_COLUMNS
                ),
                params![app_id],
                deployment_from_row,
            )
            .optional()?;
        Ok(deployment)
    }

    fn finish_deployment(&self, deployment: &Deployment) -> Result<(), EngineError> {
        if !deployment.status.is_terminal() {
            return Err(EngineError::Internal(format!(
                "Deployment {} cannot finish as {}",
                deployment.id,
                deployment.status.as_str()
            )));
        }

        let conn = self.conn();
        let git = deployment.git.clone().unwrap_or_default();
        let updated = conn.execute(
            r#"
            UPDATE deployments SET
                status = ?2, image = ?3, service_images = ?4, error = ?5,
                git_commit = ?6, git_branch = ?7, git_message = ?8, finished_at = ?9
            WHERE id = ?1 AND status = 'building'
            "#,
            params![
                deployment.id,
                deployment.status.as_str(),
                deployment.image,
                serde_json::to_string(&deployment.service_images)?,
                deployment.error,
                git.commit,
                git.branch,
                git.message,
                deployment.finished_at.unwrap_or_else(Utc::now),
            ],
        )?;

        if updated == 0 {
            return Err(EngineError::Conflict(format!(
                "Deployment {} is not building",
                deployment.id
            )));
        }
        Ok(())
    }

    fn activate_deployment(
        &self,
        app_id: &str,
        deployment_id: &str,
        demote_previous: bool,
    ) -> Result<(), EngineError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let image: Option<String> = tx
            .query_row(
                "SELECT image FROM deployments WHERE id = ?1 AND app_id = ?2",
                params![deployment_id, app_id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| EngineError::NotFound(format!("Deployment {}", deployment_id)))?;

        if demote_previous {
            tx.execute(
                "UPDATE deployments SET status = ?1 \
                 WHERE app_id = ?2 AND active = 1 AND id != ?3 AND status = ?4",
                params![
                    DeploymentStatus::RolledBack.as_str(),
                    app_id,
                    deployment_id,
                    DeploymentStatus::Deployed.as_str()
                ],
            )?;
        }
        tx.execute(
            "UPDATE deployments SET active = 0 WHERE app_id = ?1",
            params![app_id],
        )?;
        tx.execute(
            "UPDATE deployments SET active = 1 WHERE id = ?1",
            params![deployment_id],
        )?;
        tx.execute(
            "UPDATE apps SET image = ?1, updated_at = ?2 WHERE id = ?3",
            params![image, Utc::now(), app_id],
        )?;

        tx.commit()?;
        Ok(())
    }

    fn append_log(&self, deployment_id: &str, chunk: &[u8]) -> Result<(), EngineError> {
        if chunk.is_empty() {
            return Ok(());
        }
        let conn = self.conn();
        conn.execute(
            "INSERT INTO deployment_logs (deployment_id, chunk) VALUES (?1, ?2)",
            params![deployment_id, chunk],
        )?;
        Ok(())
    }

    fn read_log(&self, deployment_id: &str) -> Result<Vec<u8>, EngineError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT chunk FROM deployment_logs WHERE deployment_id = ?1 ORDER BY seq",
        )?;
        let mut log = Vec::new();
        let chunks = stmt.query_map(params![deployment_id], |row| row.get::<_, Vec<u8>>(0))?;
        for chunk in chunks {
            log.extend_from_slice(&chunk?);
        }
        Ok(log)
    }

    fn insert_backup(&self, backup: &Backup) -> Result<(), EngineError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO backups (id, created_at, size_bytes, contents, path) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                backup.id,
                backup.created_at,
                backup.size_bytes as i64,
                serde_json::to_string(&backup.contents)?,
                backup.path.to_string_lossy(),
            ],
        )?;
        Ok(())
    }

    fn get_backup(&self, id: &str) -> Result<Option<Backup>, EngineError> {
        let conn = self.conn();
        let backup = conn
            .query_row(
                "SELECT id, created_at, size_bytes, contents, path FROM backups WHERE id = ?1",
                params![id],
                backup_from_row,
            )
            .optional()?;
        Ok(backup)
    }

    fn list_backups(&self) -> Result<Vec<Backup>, EngineError> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare("SELECT id, created_at, size_bytes, contents, path FROM backups ORDER BY id")?;
        let backups = stmt
            .query_map([], backup_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(backups)
    }

    fn delete_backup(&self, id: &str) -> Result<bool, EngineError> {
        let conn = self.conn();
        let deleted = conn.execute("DELETE FROM backups WHERE id = ?1", params![id])?;
        Ok(deleted > 0)
    }

    fn snapshot_to(&self, dest: &Path) -> Result<(), EngineError> {
        if dest.exists() {
            std::fs::remove_file(dest)?;
        }
        let conn = self.conn();
        conn.execute("VACUUM INTO ?1", params![dest.to_string_lossy()])?;
        Ok(())
    }

    fn restore_from(&self, src: &Path) -> Result<(), EngineError> {
        let mut conn = self.conn();
        conn.execute(
            "ATTACH DATABASE ?1 AS snapshot",
            params![src.to_string_lossy()],
        )?;

        let result = (|| -> Result<(), EngineError> {
            let tx = conn.transaction()?;
            tx.execute_batch(
                r#"
                DELETE FROM deployment_logs;
                DELETE FROM deployments;
                DELETE FROM apps;
                INSERT INTO apps SELECT * FROM snapshot.apps;
                INSERT INTO deployments SELECT * FROM snapshot.deployments;
                INSERT INTO deployment_logs SELECT * FROM snapshot.deployment_logs;
                "#,
            )?;
            tx.commit()?;
            Ok(())
        })();

        conn.execute("DETACH DATABASE snapshot", [])?;
        result
    }
}

/// Rows of the app table in a snapshot file, for inspection without restoring
pub fn snapshot_app_statuses(src: &Path) -> Result<Vec<(String, AppStatus)>, EngineError> {
    let conn = Connection::open_with_flags(src, rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY)?;
    let mut stmt = conn.prepare("SELECT name, status FROM apps ORDER BY name")?;
    let rows = stmt
        .query_map([], |row| {
            let name: String = row.get(0)?;
            let status: AppStatus = parsed_column(row, 1)?;
            Ok((name, status))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Timestamp helper for rename-aside suffixes
pub fn suffix_timestamp(now: DateTime<Utc>) -> String {
    now.format("%Y%m%d%H%M%S").to_string()
}
