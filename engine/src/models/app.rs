//! App models

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::deploy::fsm::AppStatus;
use crate::errors::EngineError;

/// Kind of deployable unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AppKind {
    Container,
    StaticSite,
    MultiService,
}

impl AppKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppKind::Container => "container",
            AppKind::StaticSite => "static-site",
            AppKind::MultiService => "multi-service",
        }
    }
}

impl std::str::FromStr for AppKind {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "container" => Ok(AppKind::Container),
            "static-site" => Ok(AppKind::StaticSite),
            "multi-service" => Ok(AppKind::MultiService),
            _ => Err(EngineError::ValidationError(format!("Unknown app kind: {}", s))),
        }
    }
}

/// Resource limits applied to the app's containers
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Memory limit in megabytes
    #[serde(default)]
    pub memory_mb: Option<u64>,

    /// CPU limit (fractional cores)
    #[serde(default)]
    pub cpus: Option<f64>,
}

/// Health check definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum HealthCheck {
    /// HTTP GET against the exposed port; 2xx and 3xx pass
    Http { path: String },

    /// TCP dial against the exposed port
    Tcp,
}

/// One member of a multi-service app
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceSpec {
    /// Service name, unique within the app
    pub name: String,

    /// Image for this service; the primary service may leave it empty to use
    /// the image built by the deployment
    #[serde(default)]
    pub image: Option<String>,

    /// Whether this service receives the app's published port
    #[serde(default)]
    pub primary: bool,

    #[serde(default)]
    pub env: BTreeMap<String, String>,

    #[serde(default)]
    pub volumes: BTreeMap<String, String>,
}

/// A named deployable unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct App {
    pub id: String,
    pub name: String,
    pub kind: AppKind,
    pub status: AppStatus,
    pub domain: Option<String>,
    pub aliases: Vec<String>,

    /// Image of the active deployment
    pub image: Option<String>,
    pub env: BTreeMap<String, String>,

    /// Port the container listens on
    pub port: Option<u16>,

    /// Loopback port the container is published on, allocated at creation
    pub host_port: Option<u16>,
    pub resources: ResourceLimits,

    /// Volume name -> container path
    pub volumes: BTreeMap<String, String>,
    pub services: Vec<ServiceSpec>,
    pub health_check: Option<HealthCheck>,
    pub ssl: bool,

    /// Whether a public route should be pushed for this app
    pub expose: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl App {
    /// The service that receives the published port in a multi-service app
    pub fn primary_service(&self) -> Option<&ServiceSpec> {
        self.services
            .iter()
            .find(|s| s.primary)
            .or_else(|| self.services.first())
    }

    /// Domain followed by aliases
    pub fn hostnames(&self) -> Vec<String> {
        self.domain
            .iter()
            .chain(self.aliases.iter())
            .cloned()
            .collect()
    }
}

fn default_true() -> bool {
    true
}

/// Request to create an app
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppSpec {
    pub name: String,

    #[serde(default = "default_kind")]
    pub kind: AppKind,

    #[serde(default)]
    pub domain: Option<String>,

    #[serde(default)]
    pub aliases: Vec<String>,

    #[serde(default)]
    pub env: BTreeMap<String, String>,

    #[serde(default)]
    pub port: Option<u16>,

    #[serde(default)]
    pub resources: ResourceLimits,

    #[serde(default)]
    pub volumes: BTreeMap<String, String>,

    #[serde(default)]
    pub services: Vec<ServiceSpec>,

    #[serde(default)]
    pub health_check: Option<HealthCheck>,

    #[serde(default)]
    pub ssl: bool,

    #[serde(default = "default_true")]
    pub expose: bool,
}

fn default_kind() -> AppKind {
    AppKind::Container
}

impl AppSpec {
    pub fn new(name: impl Into<String>, kind: AppKind) -> Self {
        Self {
            name: name.into(),
            kind,
            domain: None,
            aliases: Vec::new(),
            env: BTreeMap::new(),
            port: None,
            resources: ResourceLimits::default(),
            volumes: BTreeMap::new(),
            services: Vec::new(),
            health_check: None,
            ssl: false,
            expose: true,
        }
    }

    /// Validate field shapes; uniqueness is checked against the store
    pub fn validate(&self) -> Result<(), EngineError> {
        validate_app_name(&self.name)?;
        for host in self.domain.iter().chain(self.aliases.iter()) {
            validate_domain(host)?;
        }
        if self.port == Some(0) {
            return Err(EngineError::ValidationError("Port must be non-zero".to_string()));
        }
        if let Some(cpus) = self.resources.cpus {
            if cpus <= 0.0 {
                return Err(EngineError::ValidationError(
                    "CPU limit must be positive".to_string(),
                ));
            }
        }
        match self.kind {
            AppKind::MultiService => {
                if self.services.is_empty() {
                    return Err(EngineError::ValidationError(
                        "Multi-service apps need at least one service".to_string(),
                    ));
                }
                let mut seen = std::collections::HashSet::new();
                for service in &self.services {
                    validate_app_name(&service.name)?;
                    if !seen.insert(service.name.as_str()) {
                        return Err(EngineError::ValidationError(format!(
                            "Duplicate service name: {}",
                            service.name
                        )));
                    }
                }
                if self.services.iter().filter(|s| s.primary).count() > 1 {
                    return Err(EngineError::ValidationError(
                        "Only one service may be primary".to_string(),
                    ));
                }
                let primary = self
                    .services
                    .iter()
                    .position(|s| s.primary)
                    .unwrap_or(0);
                if let Some(service) = self
                    .services
                    .iter()
                    .enumerate()
                    .find(|(i, s)| *i != primary && s.image.is_none())
                    .map(|(_, s)| s)
                {
                    return Err(EngineError::ValidationError(format!(
                        "Service '{}' needs an image; only the primary service is built",
                        service.name
                    )));
                }
            }
            _ => {
                if !self.services.is_empty() {
                    return Err(EngineError::ValidationError(format!(
                        "Services are only allowed on multi-service apps, not {}",
                        self.kind.as_str()
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Partial update of an app's mutable fields
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppUpdate {
    /// New primary domain; an empty string clears it
    #[serde(default)]
    pub domain: Option<String>,

    #[serde(default)]
    pub aliases: Option<Vec<String>>,

    #[serde(default)]
    pub env: Option<BTreeMap<String, String>>,

    #[serde(default)]
    pub port: Option<u16>,

    #[serde(default)]
    pub resources: Option<ResourceLimits>,

    #[serde(default)]
    pub volumes: Option<BTreeMap<String, String>>,

    #[serde(default)]
    pub health_check: Option<HealthCheck>,

    #[serde(default)]
    pub clear_health_check: bool,

    #[serde(default)]
    pub ssl: Option<bool>,

    #[serde(default)]
    pub expose: Option<bool>,
}

impl AppUpdate {
    /// Apply the update onto an app record
    pub fn apply_to(&self, app: &mut App) -> Result<(), EngineError> {
        if let Some(domain) = &self.domain {
            if domain.is_empty() {
                app.domain = None;
            } else {
                validate_domain(domain)?;
                app.domain = Some(domain.clone());
            }
        }
        if let Some(aliases) = &self.aliases {
            for host in aliases {
                validate_domain(host)?;
            }
            app.aliases = aliases.clone();
        }
        if let Some(env) = &self.env {
            app.env = env.clone();
        }
        if let Some(port) = self.port {
            if port == 0 {
                return Err(EngineError::ValidationError("Port must be non-zero".to_string()));
            }
            app.port = Some(port);
        }
        if let Some(resources) = &self.resources {
            app.resources = resources.clone();
        }
        if let Some(volumes) = &self.volumes {
            app.volumes = volumes.clone();
        }
        if self.clear_health_check {
            app.health_check = None;
        } else if let Some(health_check) = &self.health_check {
            app.health_check = Some(health_check.clone());
        }
        if let Some(ssl) = self.ssl {
            app.ssl = ssl;
        }
        if let Some(expose) = self.expose {
            app.expose = expose;
        }
        app.updated_at = Utc::now();
        Ok(())
    }
}

/// App names must be DNS labels: 1-63 chars of lowercase alphanumerics and
/// hyphens, not starting or ending with a hyphen
pub fn validate_app_name(name: &str) -> Result<(), EngineError> {
    let valid = !name.is_empty()
        && name.len() <= 63
        && !name.starts_with('-')
        && !name.ends_with('-')
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');

    if valid {
        Ok(())
    } else {
        Err(EngineError::ValidationError(format!(
            "Invalid name '{}': expected a DNS label (a-z, 0-9, '-')",
            name
        )))
    }
}

/// Validate a hostname made of DNS labels
pub fn validate_domain(domain: &str) -> Result<(), EngineError> {
    let invalid = || EngineError::ValidationError(format!("Invalid domain: '{}'", domain));

    if domain.is_empty() || domain.len() > 253 {
        return Err(invalid());
    }
    for label in domain.split('.') {
        let label_ok = !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-');
        if !label_ok {
            return Err(invalid());
        }
    }
    Ok(())
}
