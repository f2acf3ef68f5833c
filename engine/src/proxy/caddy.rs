//! Caddy admin API client

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use tracing::{debug, error};

use crate::proxy::{ProxyAdapter, ProxyError, Route};

/// Routes are addressed by `@id`, so upsert is delete-then-append
pub struct CaddyProxy {
    client: Client,
    admin_url: String,
    http_server: String,
    https_server: String,
}

impl CaddyProxy {
    pub fn new(admin_url: &str, http_server: &str, https_server: &str) -> Result<Self, ProxyError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            client,
            admin_url: admin_url.trim_end_matches('/').to_string(),
            http_server: http_server.to_string(),
            https_server: https_server.to_string(),
        })
    }

    fn routes_url(&self, tls: bool) -> String {
        let server = if tls {
            &self.https_server
        } else {
            &self.http_server
        };
        format!(
            "{}/config/apps/http/servers/{}/routes",
            self.admin_url, server
        )
    }
}

/// Caddy JSON for a route
pub fn route_config(route: &Route) -> Value {
    json!({
        "@id": route.id,
        "match": [{ "host": route.hosts }],
        "handle": [{
            "handler": "reverse_proxy",
            "upstreams": [{ "dial": route.upstream }],
        }],
        "terminal": true,
    })
}

fn is_unknown_id(status: StatusCode, body: &str) -> bool {
    status == StatusCode::NOT_FOUND || body.contains("unknown object ID")
}

#[async_trait]
impl ProxyAdapter for CaddyProxy {
    async fn upsert_route(&self, route: &Route) -> Result<(), ProxyError> {
        self.remove_route(&route.id).await?;

        let url = self.routes_url(route.tls);
        debug!("POST {} ({})", url, route.id);

        let response = self
            .client
            .post(&url)
            .json(&route_config(route))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!("Route upsert failed: {} - {}", status, body);
            return Err(ProxyError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }

    async fn remove_route(&self, route_id: &str) -> Result<(), ProxyError> {
        let url = format!("{}/id/{}", self.admin_url, route_id);
        debug!("DELETE {}", url);

        let response = self.client.delete(&url).send().await?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        if is_unknown_id(status, &body) {
            return Ok(());
        }
        Err(ProxyError::Rejected {
            status: status.as_u16(),
            body,
        })
    }

    async fn ping(&self) -> Result<(), ProxyError> {
        let url = format!("{}/config/", self.admin_url);
        let response = self.client.get(&url).send().await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(ProxyError::Rejected {
                status: response.status().as_u16(),
                body: response.text().await.unwrap_or_default(),
            })
        }
    }
}
