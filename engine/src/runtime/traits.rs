//! Container runtime adapter contract

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::deploy::log::BuildLog;

#[derive(Error, Debug)]
pub enum RuntimeError {
    /// The runtime binary or daemon cannot be reached
    #[error("runtime unavailable: {0}")]
    Unavailable(String),

    #[error("`{command}` failed: {stderr}")]
    CommandFailed { command: String, stderr: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("cancelled")]
    Cancelled,

    #[error("unexpected runtime output: {0}")]
    Parse(String),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Everything needed to create one container
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub env: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,

    /// Loopback port to publish `container_port` on
    pub host_port: Option<u16>,
    pub container_port: Option<u16>,

    /// Volume name -> container path
    pub volumes: BTreeMap<String, String>,
    pub memory_mb: Option<u64>,
    pub cpus: Option<f64>,

    /// Group network and the alias this container answers to on it
    pub network: Option<String>,
    pub network_alias: Option<String>,
}

/// Observed container state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerState {
    pub name: String,

    /// Value of the app label, if set
    pub app: Option<String>,
    pub image: String,
    pub status: String,
    pub running: bool,
    pub exit_code: Option<i32>,
}

/// Image build request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildSpec {
    pub context: PathBuf,
    pub dockerfile: PathBuf,
    pub tag: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Operations the engine needs from a container engine
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn create_container(&self, spec: &ContainerSpec) -> Result<(), RuntimeError>;

    async fn start_container(&self, name: &str) -> Result<(), RuntimeError>;

    async fn stop_container(&self, name: &str) -> Result<(), RuntimeError>;

    /// Force-remove a container; a missing container is not an error
    async fn remove_container(&self, name: &str) -> Result<(), RuntimeError>;

    async fn inspect_container(&self, name: &str) -> Result<Option<ContainerState>, RuntimeError>;

    /// Containers carrying the app label
    async fn list_containers(&self) -> Result<Vec<ContainerState>, RuntimeError>;

    /// Build an image, streaming output to the log
    async fn build_image(
        &self,
        spec: &BuildSpec,
        log: &BuildLog,
        cancel: &CancellationToken,
    ) -> Result<(), RuntimeError>;

    async fn pull_image(
        &self,
        image: &str,
        log: &BuildLog,
        cancel: &CancellationToken,
    ) -> Result<(), RuntimeError>;

    async fn image_exists(&self, image: &str) -> Result<bool, RuntimeError>;

    /// Remove an image; a missing image is not an error
    async fn remove_image(&self, image: &str) -> Result<(), RuntimeError>;

    async fn container_logs(&self, name: &str, tail: usize) -> Result<String, RuntimeError>;

    async fn exec(&self, name: &str, command: &[String]) -> Result<ExecOutput, RuntimeError>;

    /// Create the shared network of a service group; idempotent
    async fn create_group(&self, name: &str, app: &str) -> Result<(), RuntimeError>;

    /// Remove a service group network; a missing group is not an error
    async fn remove_group(&self, name: &str) -> Result<(), RuntimeError>;

    async fn list_volumes(&self) -> Result<Vec<String>, RuntimeError>;

    /// Write the volume's contents as a tar file at `dest`
    async fn export_volume(&self, name: &str, dest: &Path) -> Result<(), RuntimeError>;

    /// Create the volume if needed and unpack the tar file at `src` into it
    async fn import_volume(&self, name: &str, src: &Path) -> Result<(), RuntimeError>;
}
