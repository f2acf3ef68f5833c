//! Settings file management

use serde::{Deserialize, Serialize};

use crate::logs::LogLevel;

/// Engine settings, read from `settings.json`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub log_level: LogLevel,

    /// Emit JSON log lines
    #[serde(default)]
    pub log_json: bool,

    #[serde(default)]
    pub server: ServerSettings,

    #[serde(default)]
    pub runtime: RuntimeSettings,

    #[serde(default)]
    pub proxy: ProxySettings,

    #[serde(default)]
    pub deploy: DeploySettings,

    #[serde(default)]
    pub health: HealthSettings,
}

fn default_true() -> bool {
    true
}

/// Local control API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_server_host")]
    pub host: String,

    #[serde(default = "default_server_port")]
    pub port: u16,

    /// Largest accepted deploy upload, in megabytes
    #[serde(default = "default_max_upload_mb")]
    pub max_upload_mb: u64,
}

fn default_server_host() -> String {
    "127.0.0.1".to_string()
}

fn default_server_port() -> u16 {
    7070
}

fn default_max_upload_mb() -> u64 {
    512
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: default_server_host(),
            port: default_server_port(),
            max_upload_mb: default_max_upload_mb(),
        }
    }
}

/// Container runtime
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeSettings {
    /// `docker` or a compatible CLI such as `podman`
    #[serde(default = "default_runtime_binary")]
    pub binary: String,

    /// First loopback port handed out to apps
    #[serde(default = "default_host_port_base")]
    pub host_port_base: u16,

    /// Image with `tar`, used to export and import volumes
    #[serde(default = "default_helper_image")]
    pub helper_image: String,
}

fn default_runtime_binary() -> String {
    "docker".to_string()
}

fn default_host_port_base() -> u16 {
    20000
}

fn default_helper_image() -> String {
    "alpine:3".to_string()
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            binary: default_runtime_binary(),
            host_port_base: default_host_port_base(),
            helper_image: default_helper_image(),
        }
    }
}

/// Reverse proxy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxySettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_admin_url")]
    pub admin_url: String,

    /// Apps without a domain are served at `<name>.<base_domain>`
    #[serde(default)]
    pub base_domain: Option<String>,

    #[serde(default = "default_http_server")]
    pub http_server: String,

    #[serde(default = "default_https_server")]
    pub https_server: String,
}

fn default_admin_url() -> String {
    "http://127.0.0.1:2019".to_string()
}

fn default_http_server() -> String {
    "http".to_string()
}

fn default_https_server() -> String {
    "https".to_string()
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            enabled: true,
            admin_url: default_admin_url(),
            base_domain: None,
            http_server: default_http_server(),
            https_server: default_https_server(),
        }
    }
}

/// Build and release
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploySettings {
    #[serde(default = "default_readiness_timeout")]
    pub readiness_timeout_secs: u64,

    #[serde(default = "default_max_concurrent_builds")]
    pub max_concurrent_builds: usize,

    /// Base image static sites are packaged into
    #[serde(default = "default_static_image")]
    pub static_image: String,

    /// Directory the static image serves from
    #[serde(default = "default_static_root")]
    pub static_root: String,

    /// Upload entries skipped on extraction (names or `*.ext` patterns)
    #[serde(default = "default_ignore")]
    pub ignore: Vec<String>,

    /// Shell that runs build commands
    #[serde(default = "default_shell")]
    pub shell: String,
}

fn default_readiness_timeout() -> u64 {
    30
}

fn default_max_concurrent_builds() -> usize {
    2
}

fn default_static_image() -> String {
    "nginx:alpine".to_string()
}

fn default_static_root() -> String {
    "/usr/share/nginx/html".to_string()
}

fn default_ignore() -> Vec<String> {
    crate::archive::DEFAULT_IGNORE
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_shell() -> String {
    "sh".to_string()
}

impl Default for DeploySettings {
    fn default() -> Self {
        Self {
            readiness_timeout_secs: default_readiness_timeout(),
            max_concurrent_builds: default_max_concurrent_builds(),
            static_image: default_static_image(),
            static_root: default_static_root(),
            ignore: default_ignore(),
            shell: default_shell(),
        }
    }
}

/// Health monitor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSettings {
    #[serde(default = "default_interval")]
    pub interval_secs: u64,

    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,
}

fn default_interval() -> u64 {
    10
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_probe_timeout() -> u64 {
    5
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            interval_secs: default_interval(),
            failure_threshold: default_failure_threshold(),
            probe_timeout_secs: default_probe_timeout(),
        }
    }
}
