//! Child process helpers

use std::process::{ExitStatus, Output, Stdio};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::deploy::log::BuildLog;

/// How a streamed child process ended
#[derive(Debug)]
pub enum ProcessOutcome {
    Exited(ExitStatus),
    Cancelled,
}

/// Run a command, forwarding stdout and stderr to the build log as produced.
/// Cancellation kills the child.
pub async fn run_streaming(
    mut cmd: Command,
    log: &BuildLog,
    cancel: &CancellationToken,
) -> std::io::Result<ProcessOutcome> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    debug!("Spawning {:?}", cmd.as_std());
    let mut child = cmd.spawn()?;

    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(64);
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(pump(stdout, tx.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(pump(stderr, tx.clone()));
    }
    drop(tx);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = child.kill().await;
                return Ok(ProcessOutcome::Cancelled);
            }
            chunk = rx.recv() => match chunk {
                Some(chunk) => log.write(&chunk).await,
                None => break,
            }
        }
    }

    tokio::select! {
        _ = cancel.cancelled() => {
            let _ = child.kill().await;
            Ok(ProcessOutcome::Cancelled)
        }
        status = child.wait() => Ok(ProcessOutcome::Exited(status?)),
    }
}

async fn pump<R: AsyncRead + Unpin>(mut reader: R, tx: mpsc::Sender<Vec<u8>>) {
    let mut buf = vec![0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if tx.send(buf[..n].to_vec()).await.is_err() {
                    break;
                }
            }
        }
    }
}

/// Run a command to completion and capture its output
pub async fn run_captured(mut cmd: Command) -> std::io::Result<Output> {
    cmd.stdin(Stdio::null()).kill_on_drop(true);
    debug!("Running {:?}", cmd.as_std());
    cmd.output().await
}

/// Last non-empty line of a byte buffer, for short error messages
pub fn last_line(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .unwrap_or("")
        .trim()
        .to_string()
}
