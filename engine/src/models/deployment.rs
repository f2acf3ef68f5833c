//! Deployment models

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::EngineError;

/// Where a deployment's artifact came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Upload,
    Image,
    Git,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Upload => "upload",
            SourceKind::Image => "image",
            SourceKind::Git => "git",
        }
    }
}

impl std::str::FromStr for SourceKind {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "upload" => Ok(SourceKind::Upload),
            "image" => Ok(SourceKind::Image),
            "git" => Ok(SourceKind::Git),
            _ => Err(EngineError::ValidationError(format!("Unknown source kind: {}", s))),
        }
    }
}

/// Deployment status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeploymentStatus {
    Building,
    Deployed,
    Failed,
    RolledBack,
}

impl DeploymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentStatus::Building => "building",
            DeploymentStatus::Deployed => "deployed",
            DeploymentStatus::Failed => "failed",
            DeploymentStatus::RolledBack => "rolled-back",
        }
    }

    /// Terminal deployments are never mutated again, apart from the active flag
    /// and the deployed -> rolled-back demotion on rollback
    pub fn is_terminal(&self) -> bool {
        !matches!(self, DeploymentStatus::Building)
    }

    /// Whether the deployment once produced a working container
    pub fn was_released(&self) -> bool {
        matches!(self, DeploymentStatus::Deployed | DeploymentStatus::RolledBack)
    }
}

impl std::str::FromStr for DeploymentStatus {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "building" => Ok(DeploymentStatus::Building),
            "deployed" => Ok(DeploymentStatus::Deployed),
            "failed" => Ok(DeploymentStatus::Failed),
            "rolled-back" => Ok(DeploymentStatus::RolledBack),
            _ => Err(EngineError::ValidationError(format!(
                "Unknown deployment status: {}",
                s
            ))),
        }
    }
}

/// Git metadata of a git-sourced deployment
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitMeta {
    pub commit: Option<String>,
    pub branch: Option<String>,
    pub message: Option<String>,
}

/// One build+deploy attempt for an app
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deployment {
    pub id: String,
    pub app_id: String,
    pub source: SourceKind,

    /// Image reference, git URL, or uploaded archive name
    pub source_ref: Option<String>,
    pub git: Option<GitMeta>,

    /// Built or pulled image reference
    pub image: Option<String>,

    /// Service name -> image for multi-service apps
    #[serde(default)]
    pub service_images: BTreeMap<String, String>,
    pub status: DeploymentStatus,
    pub active: bool,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Deployment {
    /// Create a new deployment in building state
    pub fn new(app_id: &str, source: SourceKind, source_ref: Option<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            app_id: app_id.to_string(),
            source,
            source_ref,
            git: None,
            image: None,
            service_images: BTreeMap::new(),
            status: DeploymentStatus::Building,
            active: false,
            error: None,
            created_at: Utc::now(),
            finished_at: None,
        }
    }

    /// First eight characters of the id, used in image tags
    pub fn short_id(&self) -> &str {
        let end = self.id.len().min(8);
        &self.id[..end]
    }

    /// Every image this deployment needs at release time
    pub fn artifacts(&self) -> Vec<String> {
        let mut images: Vec<String> = self.image.iter().cloned().collect();
        for image in self.service_images.values() {
            if !images.contains(image) {
                images.push(image.clone());
            }
        }
        images
    }
}
