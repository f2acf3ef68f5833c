//! Network health probes

use std::time::Duration;

use reqwest::Client;
use tokio::net::TcpStream;

use crate::errors::EngineError;
use crate::models::app::{App, HealthCheck};

/// Runs an app's health check against its published port
pub struct Prober {
    client: Client,
    timeout: Duration,
}

impl Prober {
    pub fn new(timeout: Duration) -> Result<Self, EngineError> {
        // Redirects count as healthy, so don't follow them
        let client = Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;

        Ok(Self { client, timeout })
    }

    /// Ok when the app has no health check or the check passes
    pub async fn probe(&self, app: &App) -> Result<(), String> {
        let Some(check) = &app.health_check else {
            return Ok(());
        };
        let port = app
            .host_port
            .ok_or_else(|| "app has no published port".to_string())?;

        match check {
            HealthCheck::Http { path } => self.probe_http(port, path).await,
            HealthCheck::Tcp => self.probe_tcp(port).await,
        }
    }

    async fn probe_http(&self, port: u16, path: &str) -> Result<(), String> {
        let path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{}", path)
        };
        let url = format!("http://127.0.0.1:{}{}", port, path);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| format!("GET {} failed: {}", url, e))?;

        let status = response.status();
        if status.is_success() || status.is_redirection() {
            Ok(())
        } else {
            Err(format!("GET {} returned {}", url, status))
        }
    }

    async fn probe_tcp(&self, port: u16) -> Result<(), String> {
        let addr = format!("127.0.0.1:{}", port);
        match tokio::time::timeout(self.timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(format!("connect {} failed: {}", addr, e)),
            Err(_) => Err(format!("connect {} timed out", addr)),
        }
    }
}
