//! Build pipeline
//!
//! Turns a deploy request into images recorded on the deployment, as a fixed
//! sequence of named steps with a cancellation check before each. The final
//! `release` step is driven by the engine because it moves app state.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::process::Command;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::archive::{self, IgnoreList};
use crate::deploy::log::BuildLog;
use crate::deploy::source::{self, DeployRequest, DeploySource};
use crate::errors::EngineError;
use crate::filesys::dir::{self, Dir};
use crate::models::app::{App, AppKind};
use crate::models::deployment::Deployment;
use crate::process::{self, ProcessOutcome};
use crate::runtime::{self, BuildSpec, ContainerRuntime, RuntimeError};
use crate::storage::layout::StorageLayout;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Prepare,
    BuildCommand,
    Package,
    Release,
}

impl Step {
    pub fn as_str(&self) -> &'static str {
        match self {
            Step::Prepare => "prepare",
            Step::BuildCommand => "build-command",
            Step::Package => "package",
            Step::Release => "release",
        }
    }
}

/// Fail with `Cancelled` if the build was cancelled before `next`
pub fn check_cancelled(cancel: &CancellationToken, next: Step) -> Result<(), EngineError> {
    if cancel.is_cancelled() {
        return Err(EngineError::Cancelled(format!(
            "cancelled before {}",
            next.as_str()
        )));
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub shell: String,
    pub static_image: String,
    pub static_root: String,
    pub ignore: IgnoreList,
    pub max_concurrent_builds: usize,
}

pub struct Pipeline {
    runtime: Arc<dyn ContainerRuntime>,
    layout: StorageLayout,
    options: PipelineOptions,
    builds: Semaphore,
}

fn runtime_build_error(err: RuntimeError) -> EngineError {
    match err {
        RuntimeError::Cancelled => EngineError::Cancelled("cancelled during package".to_string()),
        RuntimeError::CommandFailed { .. } => EngineError::BuildFailed(err.to_string()),
        other => EngineError::RuntimeError(other),
    }
}

impl Pipeline {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, layout: StorageLayout, options: PipelineOptions) -> Self {
        let permits = options.max_concurrent_builds.max(1);
        Self {
            runtime,
            layout,
            options,
            builds: Semaphore::new(permits),
        }
    }

    /// Run `prepare`, `build-command` and `package`, filling in the
    /// deployment's images and git metadata
    pub async fn build(
        &self,
        app: &App,
        deployment: &mut Deployment,
        request: &DeployRequest,
        log: &BuildLog,
    ) -> Result<(), EngineError> {
        let cancel = log.cancel_token().clone();
        let _permit = self
            .builds
            .acquire()
            .await
            .map_err(|e| EngineError::Internal(e.to_string()))?;

        check_cancelled(&cancel, Step::Prepare)?;
        log.line(format!("[{}] {}", Step::Prepare.as_str(), describe(&request.source)))
            .await;
        let workdir = self.prepare(app, deployment, request, log, &cancel).await?;

        check_cancelled(&cancel, Step::BuildCommand)?;
        if let (Some(command), Some(dir)) = (&request.options.build_command, &workdir) {
            log.line(format!("[{}] {}", Step::BuildCommand.as_str(), command))
                .await;
            self.run_build_command(app, dir, command, log, &cancel).await?;
        }

        check_cancelled(&cancel, Step::Package)?;
        log.line(format!("[{}] {}", Step::Package.as_str(), app.kind.as_str()))
            .await;
        self.package(app, deployment, request, workdir.as_deref(), log, &cancel)
            .await
    }

    async fn prepare(
        &self,
        app: &App,
        deployment: &mut Deployment,
        request: &DeployRequest,
        log: &BuildLog,
        cancel: &CancellationToken,
    ) -> Result<Option<PathBuf>, EngineError> {
        let workdir = self.layout.build_dir(&app.name);

        match &request.source {
            DeploySource::Image { .. } => Ok(None),
            DeploySource::Upload { archive } => {
                workdir.recreate().await?;
                let dest = workdir.path().to_path_buf();
                let ignore = self.options.ignore.clone();
                let bytes = archive.clone();

                let entries = tokio::task::spawn_blocking(move || {
                    archive::unpack(bytes.as_slice(), &dest, &ignore)
                })
                .await?
                .map_err(|e| EngineError::BuildFailed(format!("Invalid upload: {}", e)))?;

                log.line(format!("Extracted {} entries", entries)).await;
                Ok(Some(workdir.path().to_path_buf()))
            }
            DeploySource::Git { url, branch } => {
                workdir.delete().await?;
                if let Some(parent) = workdir.path().parent() {
                    Dir::new(parent).create().await?;
                }
                let meta =
                    source::clone_repository(url, branch.as_deref(), workdir.path(), log, cancel)
                        .await?;
                if let Some(commit) = &meta.commit {
                    log.line(format!("Checked out {}", commit)).await;
                }
                deployment.git = Some(meta);
                Ok(Some(workdir.path().to_path_buf()))
            }
        }
    }

    async fn run_build_command(
        &self,
        app: &App,
        workdir: &Path,
        command: &str,
        log: &BuildLog,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        let mut cmd = Command::new(&self.options.shell);
        cmd.arg("-c")
            .arg(command)
            .current_dir(workdir)
            .envs(&app.env);

        let outcome = process::run_streaming(cmd, log, cancel)
            .await
            .map_err(|e| EngineError::BuildFailed(format!("Could not run build command: {}", e)))?;

        match outcome {
            ProcessOutcome::Cancelled => Err(EngineError::Cancelled(
                "cancelled during build-command".to_string(),
            )),
            ProcessOutcome::Exited(status) if status.success() => Ok(()),
            ProcessOutcome::Exited(status) => Err(EngineError::BuildFailed(format!(
                "build command exited with {}",
                status
            ))),
        }
    }

    async fn package(
        &self,
        app: &App,
        deployment: &mut Deployment,
        request: &DeployRequest,
        workdir: Option<&Path>,
        log: &BuildLog,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        let primary_image = match (&request.source, workdir) {
            (DeploySource::Image { reference }, _) => {
                self.runtime
                    .pull_image(reference, log, cancel)
                    .await
                    .map_err(runtime_build_error)?;
                reference.clone()
            }
            (_, Some(dir)) => {
                let tag = runtime::image_tag(&app.name, deployment.short_id());
                match app.kind {
                    AppKind::StaticSite => {
                        self.package_static(app, dir, request, &tag, log, cancel)
                            .await?
                    }
                    _ => self.package_dockerfile(dir, request, &tag, log, cancel).await?,
                }
                tag
            }
            (_, None) => {
                return Err(EngineError::Internal(
                    "no project directory to package".to_string(),
                ));
            }
        };

        if app.kind == AppKind::MultiService {
            let primary = app
                .primary_service()
                .map(|s| s.name.clone())
                .ok_or_else(|| EngineError::ValidationError("App has no services".to_string()))?;

            for service in &app.services {
                let image = if service.name == primary {
                    primary_image.clone()
                } else {
                    let image = service.image.clone().ok_or_else(|| {
                        EngineError::ValidationError(format!(
                            "Service '{}' has no image",
                            service.name
                        ))
                    })?;
                    check_cancelled(cancel, Step::Package)?;
                    self.runtime
                        .pull_image(&image, log, cancel)
                        .await
                        .map_err(runtime_build_error)?;
                    image
                };
                deployment.service_images.insert(service.name.clone(), image);
            }
        }

        info!("Packaged {} as {}", app.name, primary_image);
        log.line(format!("Image {}", primary_image)).await;
        deployment.image = Some(primary_image);
        Ok(())
    }

    async fn package_dockerfile(
        &self,
        dir: &Path,
        request: &DeployRequest,
        tag: &str,
        log: &BuildLog,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        let dockerfile = match &request.options.dockerfile {
            Some(path) => {
                let path = dir.join(path);
                if !path.is_file() {
                    return Err(EngineError::BuildFailed(format!(
                        "Dockerfile not found: {}",
                        path.display()
                    )));
                }
                path
            }
            None => ["Dockerfile", "Containerfile"]
                .iter()
                .map(|name| dir.join(name))
                .find(|path| path.is_file())
                .ok_or_else(|| {
                    EngineError::BuildFailed(
                        "No Dockerfile or Containerfile in project root".to_string(),
                    )
                })?,
        };

        let spec = BuildSpec {
            context: dir.to_path_buf(),
            dockerfile,
            tag: tag.to_string(),
        };
        self.runtime
            .build_image(&spec, log, cancel)
            .await
            .map_err(runtime_build_error)
    }

    async fn package_static(
        &self,
        app: &App,
        dir: &Path,
        request: &DeployRequest,
        tag: &str,
        log: &BuildLog,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        let publish = match &request.options.publish_dir {
            Some(path) => dir.join(path),
            None if dir.join("dist").is_dir() => dir.join("dist"),
            None => dir.to_path_buf(),
        };
        if !publish.is_dir() {
            return Err(EngineError::BuildFailed(format!(
                "Publish directory not found: {}",
                publish.display()
            )));
        }

        // The live site is only replaced once the release succeeds
        let stage = self.layout.site_stage_dir(&app.name);
        stage.delete().await?;
        let stage_path = stage.path().to_path_buf();
        let bytes = tokio::task::spawn_blocking(move || dir::copy_dir_all(&publish, &stage_path))
            .await??;
        log.line(format!("Staged {} bytes in {}", bytes, stage.path().display()))
            .await;

        let dockerfile = self
            .layout
            .builds_dir()
            .file(&format!("{}.static.Dockerfile", app.name));
        let contents = format!(
            "FROM {}\nCOPY . {}\n",
            self.options.static_image, self.options.static_root
        );
        dockerfile.write_bytes(contents.as_bytes()).await?;

        let spec = BuildSpec {
            context: stage.path().to_path_buf(),
            dockerfile: dockerfile.path().to_path_buf(),
            tag: tag.to_string(),
        };
        self.runtime
            .build_image(&spec, log, cancel)
            .await
            .map_err(runtime_build_error)
    }

    /// Swap a staged static site into place. No-op when nothing is staged.
    pub async fn publish_site(&self, app: &App) -> Result<(), EngineError> {
        let stage = self.layout.site_stage_dir(&app.name);
        if !stage.exists().await {
            return Ok(());
        }

        let site = self.layout.site_dir(&app.name);
        let site_path = site.path().to_path_buf();
        let stage_path = stage.path().to_path_buf();
        let replaced = tokio::task::spawn_blocking(move || -> std::io::Result<Option<PathBuf>> {
            let old = dir::rename_aside(&site_path, "old")?;
            std::fs::rename(&stage_path, &site_path)?;
            Ok(old)
        })
        .await??;

        if let Some(old) = replaced {
            Dir::new(old).delete().await?;
        }
        info!("Published site of {}", app.name);
        Ok(())
    }

    /// Drop a staged site left by a failed build or release
    pub async fn discard_site(&self, app: &App) {
        if let Err(e) = self.layout.site_stage_dir(&app.name).delete().await {
            warn!("Failed to remove staged site of {}: {}", app.name, e);
        }
    }
}

fn describe(source: &DeploySource) -> String {
    match source {
        DeploySource::Upload { archive } => format!("upload ({} bytes)", archive.len()),
        DeploySource::Image { reference } => format!("image {}", reference),
        DeploySource::Git { url, branch } => match branch {
            Some(branch) => format!("git {} ({})", url, branch),
            None => format!("git {}", url),
        },
    }
}
