//! Shared fakes and harness for the integration tests

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use deckhand::app::options::AppOptions;
use deckhand::app::state::AppState;
use deckhand::archive::{pack_to_bytes, IgnoreList};
use deckhand::deploy::log::BuildLog;
use deckhand::deploy::source::{DeployRequest, DeploySource};
use deckhand::models::app::{App, AppKind, AppSpec};
use deckhand::models::deployment::Deployment;
use deckhand::proxy::{ProxyAdapter, ProxyError, Route};
use deckhand::runtime::{
    BuildSpec, ContainerRuntime, ContainerSpec, ContainerState, ExecOutput, RuntimeError,
    APP_LABEL,
};
use deckhand::storage::layout::StorageLayout;
use deckhand::storage::settings::Settings;
use deckhand::storage::store::{SqliteStore, StateStore};

// ================================ RUNTIME ================================ //

#[derive(Debug, Clone)]
pub struct FakeContainer {
    pub spec: ContainerSpec,
    pub running: bool,
}

/// In-memory container runtime
#[derive(Default)]
pub struct FakeRuntime {
    containers: Mutex<BTreeMap<String, FakeContainer>>,
    images: Mutex<BTreeSet<String>>,
    volumes: Mutex<BTreeMap<String, Vec<u8>>>,
    groups: Mutex<BTreeSet<String>>,

    /// Images whose containers exit right after starting
    crashing: Mutex<BTreeSet<String>>,
    fail_builds: AtomicBool,
    build_delay: Mutex<Option<Duration>>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn container(&self, name: &str) -> Option<FakeContainer> {
        self.containers.lock().unwrap().get(name).cloned()
    }

    pub fn container_names(&self) -> Vec<String> {
        self.containers.lock().unwrap().keys().cloned().collect()
    }

    pub fn has_image(&self, image: &str) -> bool {
        self.images.lock().unwrap().contains(image)
    }

    pub fn add_image(&self, image: &str) {
        self.images.lock().unwrap().insert(image.to_string());
    }

    pub fn drop_image(&self, image: &str) {
        self.images.lock().unwrap().remove(image);
    }

    pub fn crash_on_start(&self, image: &str) {
        self.crashing.lock().unwrap().insert(image.to_string());
    }

    /// Stop a container behind the engine's back
    pub fn kill(&self, name: &str) {
        if let Some(container) = self.containers.lock().unwrap().get_mut(name) {
            container.running = false;
        }
    }

    pub fn remove_container_now(&self, name: &str) {
        self.containers.lock().unwrap().remove(name);
    }

    pub fn fail_builds(&self, fail: bool) {
        self.fail_builds.store(fail, Ordering::SeqCst);
    }

    pub fn set_build_delay(&self, delay: Duration) {
        *self.build_delay.lock().unwrap() = Some(delay);
    }

    pub fn put_volume(&self, name: &str, contents: &[u8]) {
        self.volumes
            .lock()
            .unwrap()
            .insert(name.to_string(), contents.to_vec());
    }

    pub fn volume(&self, name: &str) -> Option<Vec<u8>> {
        self.volumes.lock().unwrap().get(name).cloned()
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn create_container(&self, spec: &ContainerSpec) -> Result<(), RuntimeError> {
        if !self.has_image(&spec.image) {
            return Err(RuntimeError::NotFound(format!("image {}", spec.image)));
        }
        let mut containers = self.containers.lock().unwrap();
        if containers.contains_key(&spec.name) {
            return Err(RuntimeError::CommandFailed {
                command: format!("create {}", spec.name),
                stderr: "name already in use".to_string(),
            });
        }
        containers.insert(
            spec.name.clone(),
            FakeContainer {
                spec: spec.clone(),
                running: false,
            },
        );
        Ok(())
    }

    async fn start_container(&self, name: &str) -> Result<(), RuntimeError> {
        let crashing = self.crashing.lock().unwrap().clone();
        let mut containers = self.containers.lock().unwrap();
        let container = containers
            .get_mut(name)
            .ok_or_else(|| RuntimeError::NotFound(name.to_string()))?;
        container.running = !crashing.contains(&container.spec.image);
        Ok(())
    }

    async fn stop_container(&self, name: &str) -> Result<(), RuntimeError> {
        let mut containers = self.containers.lock().unwrap();
        let container = containers
            .get_mut(name)
            .ok_or_else(|| RuntimeError::NotFound(name.to_string()))?;
        container.running = false;
        Ok(())
    }

    async fn remove_container(&self, name: &str) -> Result<(), RuntimeError> {
        self.containers.lock().unwrap().remove(name);
        Ok(())
    }

    async fn inspect_container(&self, name: &str) -> Result<Option<ContainerState>, RuntimeError> {
        Ok(self.container(name).map(|c| ContainerState {
            name: c.spec.name.clone(),
            app: c.spec.labels.get(APP_LABEL).cloned(),
            image: c.spec.image.clone(),
            status: if c.running { "running" } else { "exited" }.to_string(),
            running: c.running,
            exit_code: if c.running { None } else { Some(1) },
        }))
    }

    async fn list_containers(&self) -> Result<Vec<ContainerState>, RuntimeError> {
        let mut states = Vec::new();
        for name in self.container_names() {
            if let Some(state) = self.inspect_container(&name).await? {
                states.push(state);
            }
        }
        Ok(states)
    }

    async fn build_image(
        &self,
        spec: &BuildSpec,
        log: &BuildLog,
        cancel: &CancellationToken,
    ) -> Result<(), RuntimeError> {
        log.write(format!("building {}\n", spec.tag).as_bytes()).await;

        let delay = *self.build_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => return Err(RuntimeError::Cancelled),
            }
        }
        if self.fail_builds.load(Ordering::SeqCst) {
            return Err(RuntimeError::CommandFailed {
                command: "build".to_string(),
                stderr: "step 2/4 failed".to_string(),
            });
        }
        if !spec.dockerfile.is_file() {
            return Err(RuntimeError::NotFound(spec.dockerfile.display().to_string()));
        }
        self.add_image(&spec.tag);
        Ok(())
    }

    async fn pull_image(
        &self,
        image: &str,
        log: &BuildLog,
        _cancel: &CancellationToken,
    ) -> Result<(), RuntimeError> {
        log.write(format!("pulling {}\n", image).as_bytes()).await;
        if image.contains("missing") {
            return Err(RuntimeError::CommandFailed {
                command: format!("pull {}", image),
                stderr: "manifest unknown".to_string(),
            });
        }
        self.add_image(image);
        Ok(())
    }

    async fn image_exists(&self, image: &str) -> Result<bool, RuntimeError> {
        Ok(self.has_image(image))
    }

    async fn remove_image(&self, image: &str) -> Result<(), RuntimeError> {
        self.drop_image(image);
        Ok(())
    }

    async fn container_logs(&self, name: &str, _tail: usize) -> Result<String, RuntimeError> {
        match self.container(name) {
            Some(_) => Ok(format!("hello from {}\n", name)),
            None => Err(RuntimeError::NotFound(name.to_string())),
        }
    }

    async fn exec(&self, _name: &str, _command: &[String]) -> Result<ExecOutput, RuntimeError> {
        Ok(ExecOutput {
            exit_code: 0,
            stdout: String::new(),
            stderr: String::new(),
        })
    }

    async fn create_group(&self, name: &str, _app: &str) -> Result<(), RuntimeError> {
        self.groups.lock().unwrap().insert(name.to_string());
        Ok(())
    }

    async fn remove_group(&self, name: &str) -> Result<(), RuntimeError> {
        self.groups.lock().unwrap().remove(name);
        Ok(())
    }

    async fn list_volumes(&self) -> Result<Vec<String>, RuntimeError> {
        Ok(self.volumes.lock().unwrap().keys().cloned().collect())
    }

    async fn export_volume(&self, name: &str, dest: &Path) -> Result<(), RuntimeError> {
        let contents = self
            .volume(name)
            .ok_or_else(|| RuntimeError::NotFound(name.to_string()))?;
        std::fs::write(dest, contents)?;
        Ok(())
    }

    async fn import_volume(&self, name: &str, src: &Path) -> Result<(), RuntimeError> {
        let contents = std::fs::read(src)?;
        self.put_volume(name, &contents);
        Ok(())
    }
}

// ================================= PROXY ================================= //

/// In-memory reverse proxy
#[derive(Default)]
pub struct FakeProxy {
    routes: Mutex<BTreeMap<String, Route>>,
    down: AtomicBool,
}

impl FakeProxy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(&self, id: &str) -> Option<Route> {
        self.routes.lock().unwrap().get(id).cloned()
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    fn check_up(&self) -> Result<(), ProxyError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(ProxyError::Unreachable("connection refused".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ProxyAdapter for FakeProxy {
    async fn upsert_route(&self, route: &Route) -> Result<(), ProxyError> {
        self.check_up()?;
        self.routes
            .lock()
            .unwrap()
            .insert(route.id.clone(), route.clone());
        Ok(())
    }

    async fn remove_route(&self, route_id: &str) -> Result<(), ProxyError> {
        self.check_up()?;
        self.routes.lock().unwrap().remove(route_id);
        Ok(())
    }

    async fn ping(&self) -> Result<(), ProxyError> {
        self.check_up()
    }
}

// ================================ HARNESS ================================ //

pub struct Harness {
    pub dir: TempDir,
    pub options: AppOptions,
    pub store: Arc<dyn StateStore>,
    pub runtime: Arc<FakeRuntime>,
    pub proxy: Arc<FakeProxy>,
    pub state: AppState,
}

impl Harness {
    pub async fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let layout = StorageLayout::new(dir.path());
        layout.setup().await.unwrap();

        let mut options = AppOptions::from_settings(layout.clone(), &Settings::default());
        options.proxy.base_domain = Some("apps.test".to_string());
        options.engine.readiness_timeout = Duration::from_millis(600);
        options.monitor.failure_threshold = 2;

        let store: Arc<dyn StateStore> = Arc::new(SqliteStore::open(&layout.db_path()).unwrap());
        let runtime = Arc::new(FakeRuntime::new());
        let proxy = Arc::new(FakeProxy::new());
        let state =
            AppState::with_adapters(&options, store.clone(), runtime.clone(), proxy.clone()).unwrap();

        Self {
            dir,
            options,
            store,
            runtime,
            proxy,
            state,
        }
    }

    pub fn layout(&self) -> &StorageLayout {
        &self.options.layout
    }

    pub async fn create(&self, name: &str) -> App {
        self.state
            .engine
            .create_app(AppSpec::new(name, AppKind::Container))
            .await
            .unwrap()
    }

    /// Deploy a prebuilt image and return the deployment
    pub async fn deploy_image(&self, name: &str, image: &str) -> Result<Deployment, deckhand::errors::EngineError> {
        let request = DeployRequest::new(DeploySource::Image {
            reference: image.to_string(),
        });
        self.state
            .engine
            .deploy(name, request, BuildLog::discard())
            .await
    }

    pub fn app(&self, name: &str) -> App {
        self.state.engine.get_app(name).unwrap()
    }
}

/// gzipped tar of a project directory holding the given files
pub fn project_archive(files: &[(&str, &str)]) -> Vec<u8> {
    let dir = tempfile::tempdir().unwrap();
    for (path, contents) in files {
        let path = dir.path().join(path);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, contents).unwrap();
    }
    pack_to_bytes(dir.path(), &IgnoreList::none()).unwrap()
}
