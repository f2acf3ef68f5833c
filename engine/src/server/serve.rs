//! HTTP server setup

use std::future::Future;
use std::sync::Arc;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::app::options::ServerOptions;
use crate::errors::EngineError;
use crate::server::handlers::*;
use crate::server::state::ServerState;

/// Routes of the local control API
pub fn router(state: Arc<ServerState>) -> Router {
    let upload_limit = DefaultBodyLimit::max(state.max_upload_bytes);

    Router::new()
        // Health and version
        .route("/health", get(health_handler))
        .route("/version", get(version_handler))
        // Apps
        .route("/apps", get(list_apps_handler).post(create_app_handler))
        .route(
            "/apps/{name}",
            get(get_app_handler)
                .patch(update_app_handler)
                .delete(delete_app_handler),
        )
        .route(
            "/apps/{name}/deploy",
            post(deploy_handler).layer(upload_limit),
        )
        .route("/apps/{name}/start", post(start_app_handler))
        .route("/apps/{name}/stop", post(stop_app_handler))
        .route("/apps/{name}/restart", post(restart_app_handler))
        .route("/apps/{name}/rollback/{deployment}", post(rollback_handler))
        .route("/apps/{name}/deployments", get(list_deployments_handler))
        .route("/apps/{name}/logs", get(container_logs_handler))
        .route("/apps/{name}/health", get(app_health_handler))
        .route("/apps/{name}/health/check", post(check_health_handler))
        .route("/deployments/{id}/log", get(deployment_log_handler))
        // Backups
        .route("/backups", get(list_backups_handler).post(create_backup_handler))
        .route("/backups/{id}", axum::routing::delete(delete_backup_handler))
        .route("/backups/{id}/restore", post(restore_backup_handler))
        // Images
        .route("/images/prune", post(prune_images_handler))
        // State and middleware
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Start the HTTP server
pub async fn serve(
    options: &ServerOptions,
    state: Arc<ServerState>,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<JoinHandle<Result<(), EngineError>>, EngineError> {
    let app = router(state);

    let addr = format!("{}:{}", options.host, options.port);
    info!("Starting HTTP server on {}", addr);

    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| EngineError::ServerError(e.to_string()))?;

    let handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal)
            .await
            .map_err(|e| EngineError::ServerError(e.to_string()))
    });

    Ok(handle)
}
