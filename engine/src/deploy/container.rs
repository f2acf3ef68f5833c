//! Container lifecycle supervision
//!
//! Single-container apps run as `deckhand-<app>`. Multi-service apps run as a
//! group on a shared network and are started, stopped, and removed as a unit.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::health::probe::Prober;
use crate::models::app::{App, AppKind};
use crate::models::deployment::Deployment;
use crate::runtime::{self, ContainerRuntime, ContainerSpec, RuntimeError, APP_LABEL};

const READY_POLL_INTERVAL: Duration = Duration::from_millis(250);

pub struct ContainerManager {
    runtime: Arc<dyn ContainerRuntime>,
}

fn labels(app: &App) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(APP_LABEL.to_string(), app.name.clone());
    labels
}

/// Container spec for a single-container app
pub fn single_spec(app: &App, image: &str) -> ContainerSpec {
    ContainerSpec {
        name: runtime::container_name(&app.name),
        image: image.to_string(),
        env: app.env.clone(),
        labels: labels(app),
        host_port: app.host_port,
        container_port: app.port,
        volumes: app.volumes.clone(),
        memory_mb: app.resources.memory_mb,
        cpus: app.resources.cpus,
        network: None,
        network_alias: None,
    }
}

/// Container specs for every member of a service group, in declaration order.
/// Only the primary service is published and receives the app-level settings.
pub fn group_specs(app: &App, service_images: &BTreeMap<String, String>) -> Result<Vec<ContainerSpec>, String> {
    let primary = app
        .primary_service()
        .map(|s| s.name.clone())
        .ok_or_else(|| "app has no services".to_string())?;
    let network = runtime::group_name(&app.name);

    app.services
        .iter()
        .map(|service| {
            let image = service_images
                .get(&service.name)
                .cloned()
                .ok_or_else(|| format!("no image resolved for service '{}'", service.name))?;
            let is_primary = service.name == primary;

            let mut env = if is_primary {
                app.env.clone()
            } else {
                BTreeMap::new()
            };
            env.extend(service.env.clone());

            let mut volumes = if is_primary {
                app.volumes.clone()
            } else {
                BTreeMap::new()
            };
            volumes.extend(service.volumes.clone());

            let mut labels = labels(app);
            labels.insert(format!("{}.service", APP_LABEL), service.name.clone());

            Ok(ContainerSpec {
                name: runtime::service_container_name(&app.name, &service.name),
                image,
                env,
                labels,
                host_port: if is_primary { app.host_port } else { None },
                container_port: if is_primary { app.port } else { None },
                volumes,
                memory_mb: app.resources.memory_mb,
                cpus: app.resources.cpus,
                network: Some(network.clone()),
                network_alias: Some(service.name.clone()),
            })
        })
        .collect()
}

impl ContainerManager {
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self { runtime }
    }

    /// Names of every container the app owns
    pub fn container_names(app: &App) -> Vec<String> {
        match app.kind {
            AppKind::MultiService => app
                .services
                .iter()
                .map(|s| runtime::service_container_name(&app.name, &s.name))
                .collect(),
            _ => vec![runtime::container_name(&app.name)],
        }
    }

    /// Replace the app's containers with ones running the deployment's images.
    /// On failure nothing the call created is left behind.
    pub async fn release(&self, app: &App, deployment: &Deployment) -> Result<(), RuntimeError> {
        match app.kind {
            AppKind::MultiService => self.release_group(app, deployment).await,
            _ => {
                let image = deployment.image.as_deref().ok_or_else(|| {
                    RuntimeError::NotFound(format!("deployment {} has no image", deployment.id))
                })?;
                self.release_single(app, image).await
            }
        }
    }

    async fn release_single(&self, app: &App, image: &str) -> Result<(), RuntimeError> {
        let spec = single_spec(app, image);
        self.runtime.remove_container(&spec.name).await?;

        info!("Starting {} from {}", spec.name, image);
        if let Err(e) = self.start_new(&spec).await {
            self.discard(&spec.name).await;
            return Err(e);
        }
        Ok(())
    }

    async fn release_group(&self, app: &App, deployment: &Deployment) -> Result<(), RuntimeError> {
        let specs = group_specs(app, &deployment.service_images).map_err(RuntimeError::NotFound)?;

        self.remove(app).await?;
        let network = runtime::group_name(&app.name);
        self.runtime.create_group(&network, &app.name).await?;

        for spec in &specs {
            info!("Starting {} from {}", spec.name, spec.image);
            if let Err(e) = self.start_new(spec).await {
                warn!("Service {} failed to start, tearing down group: {}", spec.name, e);
                if let Err(cleanup) = self.remove(app).await {
                    warn!("Group teardown for {} incomplete: {}", app.name, cleanup);
                }
                return Err(e);
            }
        }
        Ok(())
    }

    async fn start_new(&self, spec: &ContainerSpec) -> Result<(), RuntimeError> {
        self.runtime.create_container(spec).await?;
        self.runtime.start_container(&spec.name).await
    }

    async fn discard(&self, name: &str) {
        if let Err(e) = self.runtime.remove_container(name).await {
            warn!("Failed to remove {}: {}", name, e);
        }
    }

    pub async fn start(&self, app: &App) -> Result<(), RuntimeError> {
        for name in Self::container_names(app) {
            self.runtime.start_container(&name).await?;
        }
        Ok(())
    }

    pub async fn stop(&self, app: &App) -> Result<(), RuntimeError> {
        for name in Self::container_names(app).iter().rev() {
            self.runtime.stop_container(name).await?;
        }
        Ok(())
    }

    /// Force-remove every container of the app and its group network
    pub async fn remove(&self, app: &App) -> Result<(), RuntimeError> {
        for name in Self::container_names(app) {
            self.runtime.remove_container(&name).await?;
        }
        if app.kind == AppKind::MultiService {
            self.runtime
                .remove_group(&runtime::group_name(&app.name))
                .await?;
        }
        Ok(())
    }

    /// Whether every container of the app is running
    pub async fn all_running(&self, app: &App) -> Result<(), String> {
        for name in Self::container_names(app) {
            match self.runtime.inspect_container(&name).await {
                Ok(Some(state)) if state.running => {}
                Ok(Some(state)) => {
                    return Err(format!("{} is {}", name, state.status));
                }
                Ok(None) => return Err(format!("{} does not exist", name)),
                Err(e) => return Err(format!("inspect {} failed: {}", name, e)),
            }
        }
        Ok(())
    }

    /// Wait until the containers run and, if the app has a health check, one
    /// probe passes
    pub async fn wait_ready(&self, app: &App, prober: &Prober, timeout: Duration) -> Result<(), String> {
        let deadline = Instant::now() + timeout;
        let mut last_error;

        loop {
            match self.all_running(app).await {
                Ok(()) => match prober.probe(app).await {
                    Ok(()) => return Ok(()),
                    Err(e) => last_error = e,
                },
                Err(e) => last_error = e,
            }

            if Instant::now() + READY_POLL_INTERVAL > deadline {
                return Err(format!(
                    "not ready within {}s: {}",
                    timeout.as_secs(),
                    last_error
                ));
            }
            debug!("{} not ready yet: {}", app.name, last_error);
            tokio::time::sleep(READY_POLL_INTERVAL).await;
        }
    }
}
