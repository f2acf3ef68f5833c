//! Periodic health sweep

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tracing::{debug, error, info};

use crate::health::HealthMonitor;

/// Health worker options
#[derive(Debug, Clone)]
pub struct Options {
    /// Time between sweeps
    pub interval: Duration,

    /// Delay before the first sweep
    pub initial_delay: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            initial_delay: Duration::from_secs(2),
        }
    }
}

/// Run the health worker until `shutdown_signal` resolves
pub async fn run<S, F>(
    options: &Options,
    monitor: &HealthMonitor,
    sleep_fn: S,
    mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) where
    S: Fn(Duration) -> F,
    F: Future<Output = ()>,
{
    info!("Health worker starting...");

    tokio::select! {
        _ = &mut shutdown_signal => {
            info!("Health worker shutting down...");
            return;
        }
        _ = sleep_fn(options.initial_delay) => {}
    }

    loop {
        match monitor.sweep().await {
            Ok(checked) => debug!("Health sweep checked {} apps", checked),
            Err(e) => error!("Health sweep failed: {}", e),
        }

        tokio::select! {
            _ = &mut shutdown_signal => {
                info!("Health worker shutting down...");
                monitor.wait_for_rollbacks().await;
                return;
            }
            _ = sleep_fn(options.interval) => {}
        }
    }
}
