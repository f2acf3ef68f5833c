//! Deploy sources and git checkout

use std::ffi::OsString;
use std::path::{Component, Path};

use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::deploy::log::BuildLog;
use crate::errors::EngineError;
use crate::models::deployment::{GitMeta, SourceKind};
use crate::process::{self, ProcessOutcome};
use crate::utils::sha256_hash;

/// Where a deployment's code or image comes from
#[derive(Debug, Clone)]
pub enum DeploySource {
    /// gzipped tar of a project root
    Upload { archive: Vec<u8> },

    /// Prebuilt image reference
    Image { reference: String },

    /// Repository to clone, optionally at a branch
    Git { url: String, branch: Option<String> },
}

impl DeploySource {
    pub fn kind(&self) -> SourceKind {
        match self {
            DeploySource::Upload { .. } => SourceKind::Upload,
            DeploySource::Image { .. } => SourceKind::Image,
            DeploySource::Git { .. } => SourceKind::Git,
        }
    }

    /// Short reference recorded on the deployment
    pub fn source_ref(&self) -> Option<String> {
        match self {
            DeploySource::Upload { archive } => {
                let digest = sha256_hash(archive);
                Some(format!("sha256:{}", &digest[..12]))
            }
            DeploySource::Image { reference } => Some(reference.clone()),
            DeploySource::Git { url, branch } => Some(match branch {
                Some(branch) => format!("{}#{}", url, branch),
                None => url.clone(),
            }),
        }
    }
}

/// Build settings carried by a deploy request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildOptions {
    /// Shell command run in the project root before packaging
    #[serde(default)]
    pub build_command: Option<String>,

    /// Dockerfile path relative to the project root
    #[serde(default)]
    pub dockerfile: Option<String>,

    /// Static-site directory to publish, relative to the project root
    #[serde(default)]
    pub publish_dir: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DeployRequest {
    pub source: DeploySource,
    pub options: BuildOptions,
}

impl DeployRequest {
    pub fn new(source: DeploySource) -> Self {
        Self {
            source,
            options: BuildOptions::default(),
        }
    }

    pub fn with_options(mut self, options: BuildOptions) -> Self {
        self.options = options;
        self
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        match &self.source {
            DeploySource::Upload { archive } if archive.is_empty() => {
                return Err(EngineError::ValidationError("Upload is empty".to_string()));
            }
            DeploySource::Image { reference } if reference.trim().is_empty() => {
                return Err(EngineError::ValidationError(
                    "Image reference is required".to_string(),
                ));
            }
            DeploySource::Git { url, .. } if url.trim().is_empty() => {
                return Err(EngineError::ValidationError("Git URL is required".to_string()));
            }
            _ => {}
        }

        for (field, value) in [
            ("dockerfile", &self.options.dockerfile),
            ("publish_dir", &self.options.publish_dir),
        ] {
            if let Some(path) = value {
                if !is_relative_inside(Path::new(path)) {
                    return Err(EngineError::ValidationError(format!(
                        "{} must be a relative path inside the project: {}",
                        field, path
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Relative path that cannot escape its root
pub fn is_relative_inside(path: &Path) -> bool {
    !path.as_os_str().is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

/// Arguments for a shallow `git clone`. `--` keeps a URL like `-uX` from
/// being read as an option.
fn clone_args(url: &str, branch: Option<&str>, dest: &Path) -> Vec<OsString> {
    let mut out: Vec<OsString> = ["clone", "--depth", "1"].iter().map(OsString::from).collect();
    if let Some(branch) = branch {
        out.push("--branch".into());
        out.push(branch.into());
    }
    out.push("--".into());
    out.push(url.into());
    out.push(dest.as_os_str().to_os_string());
    out
}

/// Shallow-clone a repository into `dest` and read its head commit
pub async fn clone_repository(
    url: &str,
    branch: Option<&str>,
    dest: &Path,
    log: &BuildLog,
    cancel: &CancellationToken,
) -> Result<GitMeta, EngineError> {
    info!("Cloning {} (branch: {})", url, branch.unwrap_or("default"));

    let mut cmd = Command::new("git");
    cmd.args(clone_args(url, branch, dest));

    let outcome = process::run_streaming(cmd, log, cancel)
        .await
        .map_err(|e| EngineError::BuildFailed(format!("Failed to run git clone: {}", e)))?;
    match outcome {
        ProcessOutcome::Cancelled => {
            return Err(EngineError::Cancelled("git clone cancelled".to_string()));
        }
        ProcessOutcome::Exited(status) if !status.success() => {
            return Err(EngineError::BuildFailed(format!("git clone exited with {}", status)));
        }
        ProcessOutcome::Exited(_) => {}
    }

    let head = git_output(dest, &["log", "-1", "--format=%H%n%s"]).await?;
    let mut lines = head.lines();
    let commit = lines.next().map(str::to_string);
    let message = lines.next().map(str::to_string);

    let branch = match branch {
        Some(b) => Some(b.to_string()),
        None => git_output(dest, &["rev-parse", "--abbrev-ref", "HEAD"])
            .await
            .ok()
            .map(|b| b.trim().to_string()),
    };

    debug!("Checked out {:?} on {:?}", commit, branch);
    Ok(GitMeta {
        commit,
        branch,
        message,
    })
}

async fn git_output(dir: &Path, args: &[&str]) -> Result<String, EngineError> {
    let mut cmd = Command::new("git");
    cmd.arg("-C").arg(dir).args(args);

    let output = process::run_captured(cmd)
        .await
        .map_err(|e| EngineError::BuildFailed(format!("Failed to run git: {}", e)))?;
    if !output.status.success() {
        return Err(EngineError::BuildFailed(format!(
            "git {} failed: {}",
            args.join(" "),
            process::last_line(&output.stderr)
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}
