//! Application configuration options

use std::time::Duration;

use crate::archive::IgnoreList;
use crate::deploy::pipeline::PipelineOptions;
use crate::deploy::EngineOptions;
use crate::health::MonitorOptions;
use crate::storage::layout::StorageLayout;
use crate::storage::settings::Settings;
use crate::workers::health;

/// Main application options
#[derive(Debug, Clone)]
pub struct AppOptions {
    /// Lifecycle configuration
    pub lifecycle: LifecycleOptions,

    /// Storage layout paths
    pub layout: StorageLayout,

    /// Enable local HTTP server
    pub enable_socket_server: bool,

    /// Enable the periodic health sweep
    pub enable_health_worker: bool,

    /// Server configuration
    pub server: ServerOptions,

    pub runtime: RuntimeOptions,

    pub proxy: ProxyOptions,

    /// Deploy engine options
    pub engine: EngineOptions,

    /// Health worker options
    pub health_worker: health::Options,

    pub monitor: MonitorOptions,
}

impl AppOptions {
    /// Map settings onto typed options rooted at `layout`
    pub fn from_settings(layout: StorageLayout, settings: &Settings) -> Self {
        Self {
            lifecycle: LifecycleOptions::default(),
            layout,
            enable_socket_server: true,
            enable_health_worker: true,
            server: ServerOptions {
                host: settings.server.host.clone(),
                port: settings.server.port,
                max_upload_bytes: (settings.server.max_upload_mb as usize)
                    .saturating_mul(1024 * 1024),
            },
            runtime: RuntimeOptions {
                binary: settings.runtime.binary.clone(),
                helper_image: settings.runtime.helper_image.clone(),
            },
            proxy: ProxyOptions {
                enabled: settings.proxy.enabled,
                admin_url: settings.proxy.admin_url.clone(),
                base_domain: settings.proxy.base_domain.clone(),
                http_server: settings.proxy.http_server.clone(),
                https_server: settings.proxy.https_server.clone(),
            },
            engine: EngineOptions {
                host_port_base: settings.runtime.host_port_base,
                readiness_timeout: Duration::from_secs(settings.deploy.readiness_timeout_secs),
                probe_timeout: Duration::from_secs(settings.health.probe_timeout_secs),
                pipeline: PipelineOptions {
                    shell: settings.deploy.shell.clone(),
                    static_image: settings.deploy.static_image.clone(),
                    static_root: settings.deploy.static_root.clone(),
                    ignore: IgnoreList::new(settings.deploy.ignore.as_slice()),
                    max_concurrent_builds: settings.deploy.max_concurrent_builds,
                },
            },
            health_worker: health::Options {
                interval: Duration::from_secs(settings.health.interval_secs.max(1)),
                ..Default::default()
            },
            monitor: MonitorOptions {
                failure_threshold: settings.health.failure_threshold.max(1),
            },
        }
    }
}

impl Default for AppOptions {
    fn default() -> Self {
        Self::from_settings(StorageLayout::default(), &Settings::default())
    }
}

/// Lifecycle options for the engine
#[derive(Debug, Clone)]
pub struct LifecycleOptions {
    /// Maximum delay for graceful shutdown
    pub max_shutdown_delay: Duration,
}

impl Default for LifecycleOptions {
    fn default() -> Self {
        Self {
            max_shutdown_delay: Duration::from_secs(30),
        }
    }
}

/// Local HTTP server options
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Host to bind to
    pub host: String,

    /// Port to listen on
    pub port: u16,

    /// Body limit of the deploy route
    pub max_upload_bytes: usize,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 7070,
            max_upload_bytes: 512 * 1024 * 1024,
        }
    }
}

/// Container runtime CLI
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    pub binary: String,
    pub helper_image: String,
}

/// Reverse proxy connection
#[derive(Debug, Clone)]
pub struct ProxyOptions {
    /// When false, routes are computed but never pushed
    pub enabled: bool,
    pub admin_url: String,
    pub base_domain: Option<String>,
    pub http_server: String,
    pub https_server: String,
}
