//! Reverse proxy adapter

pub mod caddy;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use caddy::CaddyProxy;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("proxy unreachable: {0}")]
    Unreachable(String),

    #[error("proxy rejected request ({status}): {body}")]
    Rejected { status: u16, body: String },
}

impl From<reqwest::Error> for ProxyError {
    fn from(err: reqwest::Error) -> Self {
        ProxyError::Unreachable(err.to_string())
    }
}

/// A desired proxy route. Derived from an app, never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    /// Stable identifier of the route in the proxy
    pub id: String,

    /// Host matchers: domain first, then aliases
    pub hosts: Vec<String>,

    /// `host:port` to forward to
    pub upstream: String,
    pub tls: bool,
}

/// Operations the engine needs from a reverse proxy
#[async_trait]
pub trait ProxyAdapter: Send + Sync {
    /// Create or replace a route
    async fn upsert_route(&self, route: &Route) -> Result<(), ProxyError>;

    /// Delete a route; a missing route is success
    async fn remove_route(&self, route_id: &str) -> Result<(), ProxyError>;

    async fn ping(&self) -> Result<(), ProxyError>;
}

/// Proxy used when routing is disabled
pub struct DisabledProxy;

#[async_trait]
impl ProxyAdapter for DisabledProxy {
    async fn upsert_route(&self, _route: &Route) -> Result<(), ProxyError> {
        Ok(())
    }

    async fn remove_route(&self, _route_id: &str) -> Result<(), ProxyError> {
        Ok(())
    }

    async fn ping(&self) -> Result<(), ProxyError> {
        Ok(())
    }
}
