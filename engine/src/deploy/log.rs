//! Build log fan-out
//!
//! A [`BuildLog`] receives raw output chunks from build steps and forwards each
//! one to the durable deployment log and to the streaming caller. When the
//! caller goes away the build is cancelled.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::storage::store::StateStore;

pub struct BuildLog {
    durable: Option<(Arc<dyn StateStore>, String)>,
    sink: Option<mpsc::Sender<Vec<u8>>>,
    cancel: CancellationToken,
}

impl BuildLog {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            durable: None,
            sink: None,
            cancel,
        }
    }

    /// A log that drops everything; used for runtime calls outside a deployment
    pub fn discard() -> Self {
        Self::new(CancellationToken::new())
    }

    /// Persist chunks under a deployment id
    pub fn with_store(mut self, store: Arc<dyn StateStore>, deployment_id: &str) -> Self {
        self.durable = Some((store, deployment_id.to_string()));
        self
    }

    /// Stream chunks to a caller
    pub fn with_sink(mut self, sink: mpsc::Sender<Vec<u8>>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Stop persisting; the caller still receives output
    pub fn detach_store(&mut self) {
        self.durable = None;
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Forward a chunk verbatim
    pub async fn write(&self, chunk: &[u8]) {
        if chunk.is_empty() {
            return;
        }

        if let Some((store, deployment_id)) = &self.durable {
            if let Err(e) = store.append_log(deployment_id, chunk) {
                warn!("Failed to persist build log for {}: {}", deployment_id, e);
            }
        }

        if let Some(sink) = &self.sink {
            if sink.send(chunk.to_vec()).await.is_err() && !self.cancel.is_cancelled() {
                warn!("Build log receiver went away, cancelling build");
                self.cancel.cancel();
            }
        }
    }

    /// Write an engine-generated progress line
    pub async fn line(&self, message: impl AsRef<str>) {
        let text = format!("==> {}\n", message.as_ref());
        self.write(text.as_bytes()).await;
    }
}
