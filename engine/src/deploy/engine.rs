//! Deployment orchestration
//!
//! The engine owns every app mutation: create, deploy, rollback, start, stop,
//! restart, delete, and image pruning. Each mutation holds the app's try-lock
//! for its whole duration, and every status change goes through [`Lifecycle`].

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::RwLockReadGuard;
use tracing::{error, info, warn};

use crate::deploy::container::ContainerManager;
use crate::deploy::fsm::{AppEvent, AppFsm, AppStatus};
use crate::deploy::lifecycle::Lifecycle;
use crate::deploy::locks::{AppGuard, Locks};
use crate::deploy::log::BuildLog;
use crate::deploy::pipeline::{check_cancelled, Pipeline, PipelineOptions, Step};
use crate::deploy::source::DeployRequest;
use crate::errors::EngineError;
use crate::health::probe::Prober;
use crate::health::registry::HealthRegistry;
use crate::models::app::{App, AppKind, AppSpec, AppUpdate};
use crate::models::deployment::{Deployment, DeploymentStatus};
use crate::routes::{self, RouteSyncer};
use crate::runtime::{self, ContainerRuntime};
use crate::storage::layout::StorageLayout;
use crate::storage::store::StateStore;

const STATIC_SITE_PORT: u16 = 80;

#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// First loopback port handed out to apps
    pub host_port_base: u16,

    /// How long a released container has to become ready
    pub readiness_timeout: Duration,

    pub probe_timeout: Duration,

    pub pipeline: PipelineOptions,
}

/// A deploy that passed acceptance and owns the app's lock
pub struct AcceptedDeploy {
    guard: AppGuard,
    app: App,
    deployment: Deployment,
    request: DeployRequest,
}

impl AcceptedDeploy {
    pub fn app(&self) -> &App {
        &self.app
    }

    pub fn deployment(&self) -> &Deployment {
        &self.deployment
    }
}

// Skips the request, whose upload may be megabytes
impl std::fmt::Debug for AcceptedDeploy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcceptedDeploy")
            .field("app", &self.app.name)
            .field("deployment", &self.deployment.id)
            .field("source", &self.deployment.source)
            .finish_non_exhaustive()
    }
}

pub struct DeployEngine {
    store: Arc<dyn StateStore>,
    runtime: Arc<dyn ContainerRuntime>,
    routes: Arc<RouteSyncer>,
    locks: Arc<Locks>,
    health: Arc<HealthRegistry>,
    lifecycle: Lifecycle,
    containers: ContainerManager,
    pipeline: Pipeline,
    prober: Prober,
    layout: StorageLayout,
    options: EngineOptions,
}

impl DeployEngine {
    pub fn new(
        store: Arc<dyn StateStore>,
        runtime: Arc<dyn ContainerRuntime>,
        routes: Arc<RouteSyncer>,
        layout: StorageLayout,
        options: EngineOptions,
    ) -> Result<Self, EngineError> {
        Ok(Self {
            lifecycle: Lifecycle::new(store.clone(), routes.clone()),
            containers: ContainerManager::new(runtime.clone()),
            pipeline: Pipeline::new(runtime.clone(), layout.clone(), options.pipeline.clone()),
            prober: Prober::new(options.probe_timeout)?,
            locks: Arc::new(Locks::new()),
            health: Arc::new(HealthRegistry::new()),
            store,
            runtime,
            routes,
            layout,
            options,
        })
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.runtime
    }

    pub fn routes(&self) -> &Arc<RouteSyncer> {
        &self.routes
    }

    pub fn locks(&self) -> &Arc<Locks> {
        &self.locks
    }

    pub fn health(&self) -> &Arc<HealthRegistry> {
        &self.health
    }

    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    pub fn containers(&self) -> &ContainerManager {
        &self.containers
    }

    pub fn prober(&self) -> &Prober {
        &self.prober
    }

    pub fn layout(&self) -> &StorageLayout {
        &self.layout
    }

    // ---------------------------------------------------------------- apps

    pub async fn create_app(&self, spec: AppSpec) -> Result<App, EngineError> {
        spec.validate()?;

        if self.store.get_app(&spec.name)?.is_some() {
            return Err(EngineError::Conflict(format!(
                "App '{}' already exists",
                spec.name
            )));
        }
        let port = match (spec.port, spec.kind) {
            (None, AppKind::StaticSite) => Some(STATIC_SITE_PORT),
            (port, _) => port,
        };
        let now = Utc::now();
        let app = App {
            id: uuid::Uuid::new_v4().to_string(),
            host_port: Some(self.store.next_host_port(self.options.host_port_base)?),
            name: spec.name,
            kind: spec.kind,
            status: AppStatus::Pending,
            domain: spec.domain,
            aliases: spec.aliases,
            image: None,
            env: spec.env,
            port,
            resources: spec.resources,
            volumes: spec.volumes,
            services: spec.services,
            health_check: spec.health_check,
            ssl: spec.ssl,
            expose: spec.expose,
            created_at: now,
            updated_at: now,
        };

        self.check_hostnames(&app)?;
        self.store.insert_app(&app)?;
        info!("Created app {} ({})", app.name, app.kind.as_str());
        Ok(app)
    }

    /// No hostname the app would route may belong to another app, whether
    /// set explicitly or generated from the base domain
    fn check_hostnames(&self, app: &App) -> Result<(), EngineError> {
        let mut hosts = app.hostnames();
        if app.domain.is_none() {
            hosts.extend(routes::generated_host(&app.name, self.routes.base_domain()));
        }

        for host in &hosts {
            if self.store.hostname_in_use(host, Some(&app.id))?
                || self.is_generated_host_of_other(host, &app.id)?
            {
                return Err(EngineError::ValidationError(format!(
                    "Domain '{}' is already in use",
                    host
                )));
            }
        }
        Ok(())
    }

    fn is_generated_host_of_other(&self, host: &str, app_id: &str) -> Result<bool, EngineError> {
        let Some(base) = self.routes.base_domain().filter(|b| !b.is_empty()) else {
            return Ok(false);
        };
        let host = host.to_ascii_lowercase();
        let suffix = format!(".{}", base.to_ascii_lowercase());
        let Some(label) = host.strip_suffix(&suffix) else {
            return Ok(false);
        };
        Ok(self
            .store
            .get_app(label)?
            .is_some_and(|other| other.id != app_id && other.domain.is_none()))
    }

    pub fn get_app(&self, name: &str) -> Result<App, EngineError> {
        self.store
            .get_app(name)?
            .ok_or_else(|| EngineError::NotFound(format!("App '{}'", name)))
    }

    pub fn list_apps(&self) -> Result<Vec<App>, EngineError> {
        self.store.list_apps()
    }

    /// Update mutable fields. Routing changes apply immediately; container
    /// settings take effect on the next deploy or rollback.
    pub async fn update_app(&self, name: &str, update: AppUpdate) -> Result<App, EngineError> {
        let _locked = self.lock_app(name).await?;
        let mut app = self.get_app(name)?;

        update.apply_to(&mut app)?;
        self.check_hostnames(&app)?;
        self.store.update_app(&app)?;

        let app = self.get_app(name)?;
        if app.status == AppStatus::Running {
            self.routes.sync(&app).await;
        }
        Ok(app)
    }

    /// Remove the app's containers, route, deployments, and on-disk files
    pub async fn delete_app(&self, name: &str) -> Result<(), EngineError> {
        let _locked = self.lock_app(name).await?;
        let app = self.get_app(name)?;

        self.containers.remove(&app).await?;
        self.routes.remove(&app.name).await;
        self.store.delete_app(&app.id)?;
        self.health.forget(&app.name);

        self.layout.build_dir(&app.name).delete().await?;
        self.layout.site_dir(&app.name).delete().await?;
        self.layout.site_stage_dir(&app.name).delete().await?;
        self.layout
            .builds_dir()
            .file(&format!("{}.static.Dockerfile", app.name))
            .delete()
            .await?;

        info!("Deleted app {}", app.name);
        Ok(())
    }

    // ------------------------------------------------------------- deploys

    /// Take the app's lock and register a new deployment. Errors here
    /// (not found, conflict, validation) happen before any build output.
    pub async fn accept_deploy(
        &self,
        name: &str,
        request: DeployRequest,
    ) -> Result<AcceptedDeploy, EngineError> {
        request.validate()?;
        let guard = self.locks.try_lock_app(name)?;
        let app = self.get_app(name)?;

        if app.status.is_transient() {
            return Err(EngineError::Conflict(format!(
                "App '{}' is {}",
                app.name, app.status
            )));
        }

        let _accepting = self.locks.accept().await;
        let deployment = Deployment::new(
            &app.id,
            request.source.kind(),
            request.source.source_ref(),
        );
        self.store.insert_deployment(&deployment)?;

        let app = if app.status == AppStatus::Pending {
            self.lifecycle.apply(&app, AppEvent::DeployAccepted).await?
        } else {
            app
        };

        info!(
            "Accepted deployment {} for {} ({})",
            deployment.id,
            app.name,
            deployment.source.as_str()
        );
        Ok(AcceptedDeploy {
            guard,
            app,
            deployment,
            request,
        })
    }

    /// Build and release an accepted deploy, streaming output to `log`
    pub async fn run_deploy(
        &self,
        accepted: AcceptedDeploy,
        log: BuildLog,
    ) -> Result<Deployment, EngineError> {
        let AcceptedDeploy {
            guard: _guard,
            app,
            mut deployment,
            request,
        } = accepted;
        let log = log.with_store(self.store.clone(), &deployment.id);

        log.line(format!("Deploying {} ({})", app.name, deployment.id))
            .await;

        let built = match self
            .pipeline
            .build(&app, &mut deployment, &request, &log)
            .await
        {
            Ok(()) => check_cancelled(log.cancel_token(), Step::Release),
            Err(e) => Err(e),
        };

        if let Err(e) = built {
            return self.fail_build(&app, deployment, e, &log).await;
        }
        self.release_new(&app, deployment, log).await
    }

    /// Accept and run a deploy in one call
    pub async fn deploy(
        &self,
        name: &str,
        request: DeployRequest,
        log: BuildLog,
    ) -> Result<Deployment, EngineError> {
        let accepted = self.accept_deploy(name, request).await?;
        self.run_deploy(accepted, log).await
    }

    async fn fail_build(
        &self,
        app: &App,
        mut deployment: Deployment,
        err: EngineError,
        log: &BuildLog,
    ) -> Result<Deployment, EngineError> {
        error!("Build of {} for {} failed: {}", deployment.id, app.name, err);
        log.line(format!("Build failed: {}", err)).await;
        self.pipeline.discard_site(app).await;

        deployment.status = DeploymentStatus::Failed;
        deployment.error = Some(err.to_string());
        deployment.finished_at = Some(Utc::now());
        self.store.finish_deployment(&deployment)?;

        let current = self.reload(app)?;
        if current.status == AppStatus::Building {
            self.lifecycle
                .apply(&current, AppEvent::BuildFailed(err.to_string()))
                .await?;
        }
        Err(err)
    }

    async fn release_new(
        &self,
        app: &App,
        mut deployment: Deployment,
        mut log: BuildLog,
    ) -> Result<Deployment, EngineError> {
        let current = self.reload(app)?;
        let event = if current.status == AppStatus::Building {
            AppEvent::BuildSucceeded
        } else {
            AppEvent::Redeploy
        };
        let app = self.lifecycle.apply(&current, event).await?;

        log.line(format!("[{}] starting containers", Step::Release.as_str()))
            .await;

        match self.release_and_wait(&app, &deployment).await {
            Ok(()) => {
                deployment.status = DeploymentStatus::Deployed;
                deployment.finished_at = Some(Utc::now());
                self.store.finish_deployment(&deployment)?;
                self.store
                    .activate_deployment(&app.id, &deployment.id, false)?;
                self.health.reset(&app.name);
                if let Err(e) = self.pipeline.publish_site(&app).await {
                    warn!("Failed to publish site of {}: {}", app.name, e);
                    log.line(format!("Site not published: {}", e)).await;
                }

                let app = self.lifecycle.apply(&app, AppEvent::ContainerHealthy).await?;
                log.line(format!("Deployed {} ({})", app.name, deployment.short_id()))
                    .await;
                info!("Deployed {} as {}", app.name, deployment.id);

                self.store
                    .get_deployment(&deployment.id)?
                    .ok_or_else(|| EngineError::NotFound(format!("Deployment {}", deployment.id)))
            }
            Err(reason) => {
                error!("Release of {} for {} failed: {}", deployment.id, app.name, reason);
                log.line(format!("Release failed: {}", reason)).await;
                self.discard_containers(&app).await;
                self.pipeline.discard_site(&app).await;

                deployment.status = DeploymentStatus::Failed;
                deployment.error = Some(reason.clone());
                deployment.finished_at = Some(Utc::now());
                self.store.finish_deployment(&deployment)?;

                let app = self
                    .lifecycle
                    .apply(&app, AppEvent::ContainerUnhealthy(reason.clone()))
                    .await?;

                if let Some(previous) = self.store.active_deployment(&app.id)? {
                    // Rollback output still reaches the caller but is not part
                    // of the failed deployment's log
                    log.detach_store();
                    log.line(format!("Rolling back to {}", previous.short_id()))
                        .await;
                    match self.rollback_locked(app, previous, &log).await {
                        Ok(_) => log.line("Rollback complete").await,
                        Err(e) => {
                            warn!("Automatic rollback failed: {}", e);
                            log.line(format!("Rollback failed: {}", e)).await;
                        }
                    }
                }

                Err(EngineError::DeployError(format!(
                    "Deployment {} failed: {}",
                    deployment.short_id(),
                    reason
                )))
            }
        }
    }

    async fn release_and_wait(&self, app: &App, deployment: &Deployment) -> Result<(), String> {
        self.containers
            .release(app, deployment)
            .await
            .map_err(|e| e.to_string())?;
        self.containers
            .wait_ready(app, &self.prober, self.options.readiness_timeout)
            .await
    }

    async fn discard_containers(&self, app: &App) {
        if let Err(e) = self.containers.remove(app).await {
            warn!("Failed to remove containers of {}: {}", app.name, e);
        }
    }

    /// Take the app's lock, then wait out a database snapshot or restore
    async fn lock_app(
        &self,
        name: &str,
    ) -> Result<(AppGuard, RwLockReadGuard<'_, ()>), EngineError> {
        let guard = self.locks.try_lock_app(name)?;
        let accepting = self.locks.accept().await;
        Ok((guard, accepting))
    }

    fn reload(&self, app: &App) -> Result<App, EngineError> {
        self.store
            .get_app_by_id(&app.id)?
            .ok_or_else(|| EngineError::NotFound(format!("App '{}'", app.name)))
    }

    // ----------------------------------------------------------- rollbacks

    /// Release a previously deployed artifact again, without rebuilding
    pub async fn rollback(&self, name: &str, deployment_id: &str) -> Result<App, EngineError> {
        let _locked = self.lock_app(name).await?;
        let app = self.get_app(name)?;
        let target = self
            .store
            .get_deployment(deployment_id)?
            .filter(|d| d.app_id == app.id)
            .ok_or_else(|| {
                EngineError::NotFound(format!("Deployment {} of app '{}'", deployment_id, name))
            })?;

        self.rollback_locked(app, target, &BuildLog::discard()).await
    }

    /// Roll an app that just failed its health checks back to the deployment
    /// before the active one. Holds `guard` until done.
    pub async fn rollback_after_failure(
        &self,
        guard: AppGuard,
        app_id: &str,
    ) -> Result<Option<App>, EngineError> {
        let _guard = guard;
        let _accepting = self.locks.accept().await;
        let Some(app) = self.store.get_app_by_id(app_id)? else {
            return Ok(None);
        };
        if app.status != AppStatus::Failed {
            return Ok(None);
        }

        let Some(target) = self.previous_deployment(&app)? else {
            info!("{} has no previous deployment to roll back to", app.name);
            return Ok(None);
        };

        info!("Rolling {} back to {}", app.name, target.id);
        self.rollback_locked(app, target, &BuildLog::discard())
            .await
            .map(Some)
    }

    /// Newest released deployment older than the active one
    fn previous_deployment(&self, app: &App) -> Result<Option<Deployment>, EngineError> {
        let Some(active) = self.store.active_deployment(&app.id)? else {
            return Ok(None);
        };
        let deployments = self.store.list_deployments(&app.id)?;
        let position = deployments.iter().position(|d| d.id == active.id);

        Ok(position.and_then(|pos| {
            deployments[..pos]
                .iter()
                .rev()
                .find(|d| d.status.was_released() && d.image.is_some())
                .cloned()
        }))
    }

    async fn rollback_locked(
        &self,
        app: App,
        target: Deployment,
        log: &BuildLog,
    ) -> Result<App, EngineError> {
        if !target.status.was_released() || target.image.is_none() {
            return Err(EngineError::ValidationError(format!(
                "Deployment {} was never released",
                target.id
            )));
        }
        for image in target.artifacts() {
            if !self.runtime.image_exists(&image).await? {
                return Err(EngineError::ArtifactUnavailable(format!(
                    "Image {} of deployment {} is no longer available",
                    image, target.id
                )));
            }
        }

        let app = self.lifecycle.apply(&app, AppEvent::Redeploy).await?;
        log.line(format!("[{}] restoring {}", Step::Release.as_str(), target.short_id()))
            .await;

        match self.release_and_wait(&app, &target).await {
            Ok(()) => {
                self.store.activate_deployment(&app.id, &target.id, true)?;
                self.health.reset(&app.name);
                let app = self.lifecycle.apply(&app, AppEvent::ContainerHealthy).await?;
                info!("Rolled {} back to {}", app.name, target.id);
                Ok(app)
            }
            Err(reason) => {
                self.discard_containers(&app).await;
                self.lifecycle
                    .apply(&app, AppEvent::ContainerUnhealthy(reason.clone()))
                    .await?;
                Err(EngineError::DeployError(format!(
                    "Rollback to {} failed: {}",
                    target.short_id(),
                    reason
                )))
            }
        }
    }

    // ---------------------------------------------------- start/stop/restart

    pub async fn stop(&self, name: &str) -> Result<App, EngineError> {
        let _locked = self.lock_app(name).await?;
        let app = self.get_app(name)?;
        AppFsm::transition(app.status, &AppEvent::Stop)?;

        match self.containers.stop(&app).await {
            Ok(()) => self.lifecycle.apply(&app, AppEvent::Stop).await,
            Err(e) => {
                error!("Stopping {} failed: {}", app.name, e);
                self.lifecycle
                    .apply(&app, AppEvent::RuntimeFailed(e.to_string()))
                    .await?;
                Err(e.into())
            }
        }
    }

    pub async fn start(&self, name: &str) -> Result<App, EngineError> {
        let _locked = self.lock_app(name).await?;
        let app = self.get_app(name)?;
        self.start_locked(app).await
    }

    async fn start_locked(&self, app: App) -> Result<App, EngineError> {
        AppFsm::transition(app.status, &AppEvent::Start)?;

        match self.containers.start(&app).await {
            Ok(()) => {
                self.health.reset(&app.name);
                self.lifecycle.apply(&app, AppEvent::Start).await
            }
            Err(e) => {
                error!("Starting {} failed: {}", app.name, e);
                self.lifecycle
                    .apply(&app, AppEvent::RuntimeFailed(e.to_string()))
                    .await?;
                Err(e.into())
            }
        }
    }

    /// Restart containers. A running app stays running; a failed app keeps
    /// its status until the health monitor sees it pass again.
    pub async fn restart(&self, name: &str) -> Result<App, EngineError> {
        let _locked = self.lock_app(name).await?;
        let app = self.get_app(name)?;

        match app.status {
            AppStatus::Stopped => self.start_locked(app).await,
            AppStatus::Running | AppStatus::Failed => {
                let restarted = match self.containers.stop(&app).await {
                    Ok(()) => self.containers.start(&app).await,
                    Err(e) => Err(e),
                };
                match restarted {
                    Ok(()) => {
                        self.health.reset(&app.name);
                        info!("Restarted {}", app.name);
                        Ok(app)
                    }
                    Err(e) if app.status == AppStatus::Running => {
                        self.lifecycle
                            .apply(&app, AppEvent::RuntimeFailed(e.to_string()))
                            .await?;
                        Err(e.into())
                    }
                    Err(e) => Err(e.into()),
                }
            }
            status => Err(EngineError::InvalidTransition {
                from: status.to_string(),
                event: "restart".to_string(),
            }),
        }
    }

    // ------------------------------------------------------------- queries

    pub fn list_deployments(&self, name: &str) -> Result<Vec<Deployment>, EngineError> {
        let app = self.get_app(name)?;
        self.store.list_deployments(&app.id)
    }

    pub fn deployment_log(&self, deployment_id: &str) -> Result<Vec<u8>, EngineError> {
        if self.store.get_deployment(deployment_id)?.is_none() {
            return Err(EngineError::NotFound(format!("Deployment {}", deployment_id)));
        }
        self.store.read_log(deployment_id)
    }

    /// Recent container output; one section per service for groups
    pub async fn container_logs(&self, name: &str, tail: usize) -> Result<String, EngineError> {
        let app = self.get_app(name)?;
        if app.kind != AppKind::MultiService {
            let logs = self
                .runtime
                .container_logs(&runtime::container_name(&app.name), tail)
                .await?;
            return Ok(logs);
        }

        let mut out = String::new();
        for service in &app.services {
            let container = runtime::service_container_name(&app.name, &service.name);
            out.push_str(&format!("==> {} <==\n", service.name));
            match self.runtime.container_logs(&container, tail).await {
                Ok(logs) => out.push_str(&logs),
                Err(e) => out.push_str(&format!("({})\n", e)),
            }
        }
        Ok(out)
    }

    // ---------------------------------------------------------- maintenance

    /// Remove images of inactive deployments, keeping the newest `keep`
    /// released ones per app. Returns the removed image references.
    pub async fn prune_images(&self, keep: usize) -> Result<Vec<String>, EngineError> {
        let _ops = self.locks.try_lock_cross_app("prune images")?;

        let mut protected = HashSet::new();
        let mut candidates = Vec::new();
        for app in self.store.list_apps()? {
            let busy = self.locks.is_app_locked(&app.name);
            let mut kept = 0;
            for deployment in self.store.list_deployments(&app.id)?.into_iter().rev() {
                let artifacts = deployment.artifacts();
                if busy || deployment.active {
                    protected.extend(artifacts);
                } else if deployment.status.was_released() && kept < keep {
                    kept += 1;
                    protected.extend(artifacts);
                } else {
                    candidates.extend(artifacts);
                }
            }
        }

        let mut removed = Vec::new();
        for image in candidates {
            if protected.contains(&image) || removed.contains(&image) {
                continue;
            }
            match self.runtime.remove_image(&image).await {
                Ok(()) => removed.push(image),
                Err(e) => warn!("Could not remove image {}: {}", image, e),
            }
        }

        info!("Pruned {} images", removed.len());
        Ok(removed)
    }

    /// Settle state left behind by an engine that stopped mid-operation
    pub async fn recover(&self) -> Result<(), EngineError> {
        for app in self.store.list_apps()? {
            for mut deployment in self.store.list_deployments(&app.id)? {
                if deployment.status == DeploymentStatus::Building {
                    deployment.status = DeploymentStatus::Failed;
                    deployment.error = Some("interrupted by engine restart".to_string());
                    deployment.finished_at = Some(Utc::now());
                    self.store.finish_deployment(&deployment)?;
                    warn!("Marked interrupted deployment {} failed", deployment.id);
                }
            }
            if app.status.is_transient() {
                self.lifecycle.apply(&app, AppEvent::Interrupted).await?;
            }
        }

        self.routes.resync_all(self.store.as_ref()).await
    }
}
