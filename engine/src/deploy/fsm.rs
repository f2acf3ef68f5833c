//! Finite state machine for app lifecycle

use serde::{Deserialize, Serialize};

use crate::errors::EngineError;

/// App status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppStatus {
    /// Created, never deployed
    Pending,

    /// First build in progress
    Building,

    /// Container being (re)created and checked for readiness
    Deploying,

    /// Container running and healthy
    Running,

    /// Stopped on request
    Stopped,

    /// Build, release, or health failure
    Failed,
}

impl AppStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppStatus::Pending => "pending",
            AppStatus::Building => "building",
            AppStatus::Deploying => "deploying",
            AppStatus::Running => "running",
            AppStatus::Stopped => "stopped",
            AppStatus::Failed => "failed",
        }
    }

    /// States only held while an operation owns the app
    pub fn is_transient(&self) -> bool {
        matches!(self, AppStatus::Building | AppStatus::Deploying)
    }
}

impl std::fmt::Display for AppStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AppStatus {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(AppStatus::Pending),
            "building" => Ok(AppStatus::Building),
            "deploying" => Ok(AppStatus::Deploying),
            "running" => Ok(AppStatus::Running),
            "stopped" => Ok(AppStatus::Stopped),
            "failed" => Ok(AppStatus::Failed),
            _ => Err(EngineError::ValidationError(format!("Unknown app status: {}", s))),
        }
    }
}

/// App lifecycle event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppEvent {
    /// First deploy accepted, build starting
    DeployAccepted,

    /// Build produced an artifact
    BuildSucceeded,

    /// Build failed or was cancelled
    BuildFailed(String),

    /// A new or previous artifact is being released
    Redeploy,

    /// Released container passed readiness
    ContainerHealthy,

    /// Released container failed readiness
    ContainerUnhealthy(String),

    /// Stop requested
    Stop,

    /// Start requested
    Start,

    /// Runtime refused to start or stop the container
    RuntimeFailed(String),

    /// Health checks failed past the threshold
    HealthFailed(String),

    /// Failed app's container passes checks again
    Recovered,

    /// Engine restarted while an operation was in flight
    Interrupted,
}

impl AppEvent {
    pub fn name(&self) -> &'static str {
        match self {
            AppEvent::DeployAccepted => "deploy-accepted",
            AppEvent::BuildSucceeded => "build-succeeded",
            AppEvent::BuildFailed(_) => "build-failed",
            AppEvent::Redeploy => "redeploy",
            AppEvent::ContainerHealthy => "container-healthy",
            AppEvent::ContainerUnhealthy(_) => "container-unhealthy",
            AppEvent::Stop => "stop",
            AppEvent::Start => "start",
            AppEvent::RuntimeFailed(_) => "runtime-failed",
            AppEvent::HealthFailed(_) => "health-failed",
            AppEvent::Recovered => "recovered",
            AppEvent::Interrupted => "interrupted",
        }
    }

    /// Failure reason carried by the event, if any
    pub fn reason(&self) -> Option<&str> {
        match self {
            AppEvent::BuildFailed(r)
            | AppEvent::ContainerUnhealthy(r)
            | AppEvent::RuntimeFailed(r)
            | AppEvent::HealthFailed(r) => Some(r),
            _ => None,
        }
    }
}

/// A validated status change. Only the state machine constructs these, so any
/// status written to the store went through the transition table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    from: AppStatus,
    to: AppStatus,
    event: &'static str,
}

impl Transition {
    pub fn from(&self) -> AppStatus {
        self.from
    }

    pub fn to(&self) -> AppStatus {
        self.to
    }

    pub fn event(&self) -> &'static str {
        self.event
    }

    pub fn leaves_running(&self) -> bool {
        self.from == AppStatus::Running && self.to != AppStatus::Running
    }

    pub fn enters_running(&self) -> bool {
        self.from != AppStatus::Running && self.to == AppStatus::Running
    }
}

/// App lifecycle state machine
pub struct AppFsm;

impl AppFsm {
    /// Compute the transition for an event, or reject it
    pub fn transition(from: AppStatus, event: &AppEvent) -> Result<Transition, EngineError> {
        use AppStatus::*;

        let to = match (from, event) {
            (Pending, AppEvent::DeployAccepted) => Building,

            (Building, AppEvent::BuildSucceeded) => Deploying,
            (Building, AppEvent::BuildFailed(_)) => Failed,
            (Building, AppEvent::Interrupted) => Failed,

            (Running | Stopped | Failed, AppEvent::Redeploy) => Deploying,

            (Deploying, AppEvent::ContainerHealthy) => Running,
            (Deploying, AppEvent::ContainerUnhealthy(_)) => Failed,
            (Deploying, AppEvent::Interrupted) => Failed,

            (Running, AppEvent::Stop) => Stopped,
            (Running, AppEvent::HealthFailed(_)) => Failed,
            (Running, AppEvent::RuntimeFailed(_)) => Failed,

            (Stopped, AppEvent::Start) => Running,
            (Stopped, AppEvent::RuntimeFailed(_)) => Failed,

            (Failed, AppEvent::Recovered) => Running,

            (state, event) => {
                return Err(EngineError::InvalidTransition {
                    from: state.to_string(),
                    event: event.name().to_string(),
                });
            }
        };

        Ok(Transition {
            from,
            to,
            event: event.name(),
        })
    }

    /// Whether an event is accepted in the given state
    pub fn can(from: AppStatus, event: &AppEvent) -> bool {
        Self::transition(from, event).is_ok()
    }
}
