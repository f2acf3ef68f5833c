//! Docker/Podman CLI runtime

use std::path::Path;

use async_trait::async_trait;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::deploy::log::BuildLog;
use crate::process::{self, ProcessOutcome};
use crate::runtime::traits::{
    BuildSpec, ContainerRuntime, ContainerSpec, ContainerState, ExecOutput, RuntimeError,
};
use crate::runtime::APP_LABEL;

/// Runtime driven through the `docker` (or compatible) command line
pub struct CliRuntime {
    binary: String,
    helper_image: String,
}

impl CliRuntime {
    pub fn new(binary: &str, helper_image: &str) -> Self {
        Self {
            binary: binary.to_string(),
            helper_image: helper_image.to_string(),
        }
    }

    fn command(&self) -> Command {
        Command::new(&self.binary)
    }

    /// Run a command to completion, mapping failures to runtime errors
    async fn run(&self, args: &[String]) -> Result<String, RuntimeError> {
        let mut cmd = self.command();
        cmd.args(args);

        let output = process::run_captured(cmd)
            .await
            .map_err(|e| self.spawn_error(e))?;

        if !output.status.success() {
            return Err(RuntimeError::CommandFailed {
                command: self.describe(args),
                stderr: process::last_line(&output.stderr),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Like `run`, but treat a "no such ..." failure as success
    async fn run_ignoring_missing(&self, args: &[String]) -> Result<(), RuntimeError> {
        match self.run(args).await {
            Ok(_) => Ok(()),
            Err(RuntimeError::CommandFailed { stderr, .. }) if is_missing(&stderr) => {
                debug!("{} already absent", self.describe(args));
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn run_logged(
        &self,
        args: &[String],
        log: &BuildLog,
        cancel: &CancellationToken,
    ) -> Result<(), RuntimeError> {
        let mut cmd = self.command();
        cmd.args(args);

        match process::run_streaming(cmd, log, cancel)
            .await
            .map_err(|e| self.spawn_error(e))?
        {
            ProcessOutcome::Cancelled => Err(RuntimeError::Cancelled),
            ProcessOutcome::Exited(status) if status.success() => Ok(()),
            ProcessOutcome::Exited(status) => Err(RuntimeError::CommandFailed {
                command: self.describe(args),
                stderr: format!("exited with {}", status),
            }),
        }
    }

    fn spawn_error(&self, err: std::io::Error) -> RuntimeError {
        if err.kind() == std::io::ErrorKind::NotFound {
            RuntimeError::Unavailable(format!("'{}' not found in PATH", self.binary))
        } else {
            RuntimeError::Io(err)
        }
    }

    fn describe(&self, args: &[String]) -> String {
        let verb: Vec<&str> = args.iter().take(2).map(String::as_str).collect();
        format!("{} {}", self.binary, verb.join(" "))
    }
}

fn is_missing(stderr: &str) -> bool {
    let lower = stderr.to_ascii_lowercase();
    lower.contains("no such") || lower.contains("not found")
}

fn args<const N: usize>(items: [&str; N]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

/// Arguments for `create`, in order
pub fn create_args(spec: &ContainerSpec) -> Vec<String> {
    let mut out = args(["create", "--name", &spec.name, "--restart", "unless-stopped"]);

    for (key, value) in &spec.labels {
        out.push("--label".to_string());
        out.push(format!("{}={}", key, value));
    }
    for (key, value) in &spec.env {
        out.push("-e".to_string());
        out.push(format!("{}={}", key, value));
    }
    if let (Some(host), Some(container)) = (spec.host_port, spec.container_port) {
        out.push("-p".to_string());
        out.push(format!("127.0.0.1:{}:{}", host, container));
    }
    for (volume, path) in &spec.volumes {
        out.push("-v".to_string());
        out.push(format!("{}:{}", volume, path));
    }
    if let Some(mb) = spec.memory_mb {
        out.push("--memory".to_string());
        out.push(format!("{}m", mb));
    }
    if let Some(cpus) = spec.cpus {
        out.push("--cpus".to_string());
        out.push(cpus.to_string());
    }
    if let Some(network) = &spec.network {
        out.push("--network".to_string());
        out.push(network.clone());
        if let Some(alias) = &spec.network_alias {
            out.push("--network-alias".to_string());
            out.push(alias.clone());
        }
    }

    out.push(spec.image.clone());
    out
}

const INSPECT_FORMAT: &str = "{{.Name}}|{{.Config.Image}}|{{.State.Status}}|{{.State.Running}}|{{.State.ExitCode}}|{{index .Config.Labels \"deckhand.app\"}}";
const PS_FORMAT: &str = "{{.Names}}|{{.Image}}|{{.State}}|{{.Label \"deckhand.app\"}}";

fn parse_inspect(line: &str) -> Result<ContainerState, RuntimeError> {
    let parts: Vec<&str> = line.trim().split('|').collect();
    if parts.len() < 5 {
        return Err(RuntimeError::Parse(line.to_string()));
    }
    Ok(ContainerState {
        name: parts[0].trim_start_matches('/').to_string(),
        image: parts[1].to_string(),
        status: parts[2].to_string(),
        running: parts[3] == "true",
        exit_code: parts[4].parse().ok(),
        app: parts.get(5).filter(|s| !s.is_empty()).map(|s| s.to_string()),
    })
}

fn parse_ps(line: &str) -> Option<ContainerState> {
    let parts: Vec<&str> = line.trim().split('|').collect();
    if parts.len() < 3 {
        return None;
    }
    Some(ContainerState {
        name: parts[0].to_string(),
        image: parts[1].to_string(),
        status: parts[2].to_string(),
        running: parts[2] == "running",
        exit_code: None,
        app: parts.get(3).filter(|s| !s.is_empty()).map(|s| s.to_string()),
    })
}

fn split_file(path: &Path) -> Result<(String, String), RuntimeError> {
    let dir = path
        .parent()
        .ok_or_else(|| RuntimeError::Parse(format!("no parent: {}", path.display())))?;
    let file = path
        .file_name()
        .ok_or_else(|| RuntimeError::Parse(format!("no file name: {}", path.display())))?;
    Ok((
        dir.to_string_lossy().into_owned(),
        file.to_string_lossy().into_owned(),
    ))
}

#[async_trait]
impl ContainerRuntime for CliRuntime {
    async fn create_container(&self, spec: &ContainerSpec) -> Result<(), RuntimeError> {
        debug!("Creating container {} from {}", spec.name, spec.image);
        self.run(&create_args(spec)).await?;
        Ok(())
    }

    async fn start_container(&self, name: &str) -> Result<(), RuntimeError> {
        debug!("Starting container {}", name);
        self.run(&args(["start", name])).await?;
        Ok(())
    }

    async fn stop_container(&self, name: &str) -> Result<(), RuntimeError> {
        debug!("Stopping container {}", name);
        self.run(&args(["stop", name])).await?;
        Ok(())
    }

    async fn remove_container(&self, name: &str) -> Result<(), RuntimeError> {
        debug!("Removing container {}", name);
        self.run_ignoring_missing(&args(["rm", "-f", name])).await
    }

    async fn inspect_container(&self, name: &str) -> Result<Option<ContainerState>, RuntimeError> {
        match self
            .run(&args(["inspect", "--type", "container", "--format", INSPECT_FORMAT, name]))
            .await
        {
            Ok(out) => Ok(Some(parse_inspect(&out)?)),
            Err(RuntimeError::CommandFailed { stderr, .. }) if is_missing(&stderr) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn list_containers(&self) -> Result<Vec<ContainerState>, RuntimeError> {
        let filter = format!("label={}", APP_LABEL);
        let out = self
            .run(&args(["ps", "-a", "--filter", &filter, "--format", PS_FORMAT]))
            .await?;
        Ok(out.lines().filter_map(parse_ps).collect())
    }

    async fn build_image(
        &self,
        spec: &BuildSpec,
        log: &BuildLog,
        cancel: &CancellationToken,
    ) -> Result<(), RuntimeError> {
        info!("Building image {}", spec.tag);
        let dockerfile = spec.dockerfile.to_string_lossy();
        let context = spec.context.to_string_lossy();
        self.run_logged(
            &args(["build", "-t", &spec.tag, "-f", &dockerfile, &context]),
            log,
            cancel,
        )
        .await
    }

    async fn pull_image(
        &self,
        image: &str,
        log: &BuildLog,
        cancel: &CancellationToken,
    ) -> Result<(), RuntimeError> {
        info!("Pulling image {}", image);
        self.run_logged(&args(["pull", image]), log, cancel).await
    }

    async fn image_exists(&self, image: &str) -> Result<bool, RuntimeError> {
        match self.run(&args(["image", "inspect", image])).await {
            Ok(_) => Ok(true),
            Err(RuntimeError::CommandFailed { stderr, .. }) if is_missing(&stderr) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn remove_image(&self, image: &str) -> Result<(), RuntimeError> {
        debug!("Removing image {}", image);
        self.run_ignoring_missing(&args(["rmi", image])).await
    }

    async fn container_logs(&self, name: &str, tail: usize) -> Result<String, RuntimeError> {
        let tail = tail.to_string();
        let mut cmd = self.command();
        cmd.args(["logs", "--tail", tail.as_str(), name]);
        let output = process::run_captured(cmd)
            .await
            .map_err(|e| self.spawn_error(e))?;

        if !output.status.success() {
            let stderr = process::last_line(&output.stderr);
            return if is_missing(&stderr) {
                Err(RuntimeError::NotFound(name.to_string()))
            } else {
                Err(RuntimeError::CommandFailed {
                    command: format!("{} logs", self.binary),
                    stderr,
                })
            };
        }

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(text)
    }

    async fn exec(&self, name: &str, command: &[String]) -> Result<ExecOutput, RuntimeError> {
        let mut cmd = self.command();
        cmd.arg("exec").arg(name).args(command);
        let output = process::run_captured(cmd)
            .await
            .map_err(|e| self.spawn_error(e))?;

        Ok(ExecOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    async fn create_group(&self, name: &str, app: &str) -> Result<(), RuntimeError> {
        let label = format!("{}={}", APP_LABEL, app);
        match self
            .run(&args(["network", "create", "--label", &label, name]))
            .await
        {
            Ok(_) => Ok(()),
            Err(RuntimeError::CommandFailed { stderr, .. }) if stderr.contains("already exists") => {
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn remove_group(&self, name: &str) -> Result<(), RuntimeError> {
        self.run_ignoring_missing(&args(["network", "rm", name])).await
    }

    async fn list_volumes(&self) -> Result<Vec<String>, RuntimeError> {
        let out = self
            .run(&args(["volume", "ls", "--format", "{{.Name}}"]))
            .await?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect())
    }

    async fn export_volume(&self, name: &str, dest: &Path) -> Result<(), RuntimeError> {
        let (dir, file) = split_file(dest)?;
        info!("Exporting volume {} to {}", name, dest.display());
        self.run(&args([
            "run",
            "--rm",
            "-v",
            &format!("{}:/volume:ro", name),
            "-v",
            &format!("{}:/backup", dir),
            &self.helper_image,
            "tar",
            "-cf",
            &format!("/backup/{}", file),
            "-C",
            "/volume",
            ".",
        ]))
        .await?;
        Ok(())
    }

    async fn import_volume(&self, name: &str, src: &Path) -> Result<(), RuntimeError> {
        let (dir, file) = split_file(src)?;
        info!("Importing volume {} from {}", name, src.display());
        self.run(&args(["volume", "create", name])).await?;
        self.run(&args([
            "run",
            "--rm",
            "-v",
            &format!("{}:/volume", name),
            "-v",
            &format!("{}:/backup:ro", dir),
            &self.helper_image,
            "tar",
            "-xf",
            &format!("/backup/{}", file),
            "-C",
            "/volume",
        ]))
        .await?;
        Ok(())
    }
}
