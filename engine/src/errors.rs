//! Error types for the deckhand engine

use thiserror::Error;

use crate::proxy::ProxyError;
use crate::runtime::RuntimeError;

/// Coarse classification callers use to decide whether to retry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Conflict,
    NotFound,
    Validation,
    BuildFailed,
    ArtifactUnavailable,
    Cancelled,
    Infrastructure,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Conflict => "conflict",
            ErrorKind::NotFound => "not-found",
            ErrorKind::Validation => "validation",
            ErrorKind::BuildFailed => "build-failed",
            ErrorKind::ArtifactUnavailable => "artifact-unavailable",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Infrastructure => "infrastructure",
        }
    }
}

/// Stage of a backup or restore at which it failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupStage {
    SnapshotDatabase,
    CopyConfig,
    CopySites,
    ExportVolumes,
    CopyBuilds,
    Archive,
    Register,
    Extract,
    Verify,
    RestoreDatabase,
    RestoreConfig,
    RestoreApps,
    RestoreVolumes,
}

impl BackupStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupStage::SnapshotDatabase => "snapshot-database",
            BackupStage::CopyConfig => "copy-config",
            BackupStage::CopySites => "copy-sites",
            BackupStage::ExportVolumes => "export-volumes",
            BackupStage::CopyBuilds => "copy-builds",
            BackupStage::Archive => "archive",
            BackupStage::Register => "register",
            BackupStage::Extract => "extract",
            BackupStage::Verify => "verify",
            BackupStage::RestoreDatabase => "restore-database",
            BackupStage::RestoreConfig => "restore-config",
            BackupStage::RestoreApps => "restore-apps",
            BackupStage::RestoreVolumes => "restore-volumes",
        }
    }
}

impl std::fmt::Display for BackupStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Main error type for the engine
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Database error: {0}")]
    DatabaseError(#[from] rusqlite::Error),

    #[error("Runtime error: {0}")]
    RuntimeError(#[from] RuntimeError),

    #[error("Proxy error: {0}")]
    ProxyError(#[from] ProxyError),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Invalid transition: {from} -> {event}")]
    InvalidTransition { from: String, event: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Build failed: {0}")]
    BuildFailed(String),

    #[error("Artifact unavailable: {0}")]
    ArtifactUnavailable(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Deployment error: {0}")]
    DeployError(String),

    #[error("Backup failed at {stage}: {message}")]
    BackupFailed { stage: BackupStage, message: String },

    #[error("Restore failed at {stage}: {message}")]
    RestoreFailed { stage: BackupStage, message: String },

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Shutdown error: {0}")]
    ShutdownError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Classify the error for callers
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Conflict(_) | EngineError::InvalidTransition { .. } => {
                ErrorKind::Conflict
            }
            EngineError::NotFound(_) => ErrorKind::NotFound,
            EngineError::ValidationError(_) | EngineError::JsonError(_) => ErrorKind::Validation,
            EngineError::BuildFailed(_) => ErrorKind::BuildFailed,
            EngineError::ArtifactUnavailable(_) => ErrorKind::ArtifactUnavailable,
            EngineError::Cancelled(_) => ErrorKind::Cancelled,
            _ => ErrorKind::Infrastructure,
        }
    }

    /// Wrap an error as a backup failure at the given stage
    pub fn backup(stage: BackupStage, err: impl std::fmt::Display) -> Self {
        EngineError::BackupFailed {
            stage,
            message: err.to_string(),
        }
    }

    /// Wrap an error as a restore failure at the given stage
    pub fn restore(stage: BackupStage, err: impl std::fmt::Display) -> Self {
        EngineError::RestoreFailed {
            stage,
            message: err.to_string(),
        }
    }
}

impl From<anyhow::Error> for EngineError {
    fn from(err: anyhow::Error) -> Self {
        EngineError::Internal(err.to_string())
    }
}

impl From<tokio::task::JoinError> for EngineError {
    fn from(err: tokio::task::JoinError) -> Self {
        EngineError::Internal(format!("task failed: {}", err))
    }
}
