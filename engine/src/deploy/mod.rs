//! Deployment module

pub mod container;
pub mod engine;
pub mod fsm;
pub mod lifecycle;
pub mod locks;
pub mod log;
pub mod pipeline;
pub mod source;

pub use engine::{AcceptedDeploy, DeployEngine, EngineOptions};
