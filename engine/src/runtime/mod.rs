//! Container runtime adapter and naming

pub mod docker;
pub mod traits;

pub use docker::CliRuntime;
pub use traits::{
    BuildSpec, ContainerRuntime, ContainerSpec, ContainerState, ExecOutput, RuntimeError,
};

/// Label every managed container carries
pub const APP_LABEL: &str = "deckhand.app";

const PREFIX: &str = "deckhand";

/// Container name of a single-container app
pub fn container_name(app: &str) -> String {
    format!("{}-{}", PREFIX, app)
}

/// Container name of one member of a service group. App names are DNS labels,
/// so `_` keeps `shop` + `db` apart from an app named `shop-db`.
pub fn service_container_name(app: &str, service: &str) -> String {
    format!("{}-{}_{}", PREFIX, app, service)
}

/// Network shared by a service group
pub fn group_name(app: &str) -> String {
    format!("{}-{}", PREFIX, app)
}

/// Tag of an image built for a deployment
pub fn image_tag(app: &str, deployment_short_id: &str) -> String {
    format!("{}/{}:{}", PREFIX, app, deployment_short_id)
}
