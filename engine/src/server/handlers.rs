//! HTTP request handlers

use std::sync::Arc;

use axum::{
    body::{Body, Bytes},
    extract::{Path, Query, State},
    http::{header, HeaderName, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::deploy::log::BuildLog;
use crate::deploy::source::{BuildOptions, DeployRequest, DeploySource};
use crate::errors::EngineError;
use crate::models::app::{AppSpec, AppUpdate};
use crate::models::backup::{BackupOptions, RestoreOptions};
use crate::server::error::ApiError;
use crate::server::state::ServerState;
use crate::utils::version_info;

type ApiResult<T> = Result<T, ApiError>;

const DEPLOYMENT_ID_HEADER: HeaderName = HeaderName::from_static("x-deployment-id");
const DEFAULT_LOG_TAIL: usize = 200;

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
}

/// Health check handler
pub async fn health_handler() -> impl IntoResponse {
    let version = version_info();
    Json(HealthResponse {
        status: "healthy".to_string(),
        service: "deckhand".to_string(),
        version: version.version,
    })
}

/// Version handler
pub async fn version_handler() -> impl IntoResponse {
    Json(version_info())
}

// ---------------------------------------------------------------------- apps

pub async fn list_apps_handler(State(state): State<Arc<ServerState>>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.engine.list_apps()?))
}

pub async fn create_app_handler(
    State(state): State<Arc<ServerState>>,
    Json(spec): Json<AppSpec>,
) -> ApiResult<impl IntoResponse> {
    let app = state.engine.create_app(spec).await?;
    Ok((StatusCode::CREATED, Json(app)))
}

pub async fn get_app_handler(
    State(state): State<Arc<ServerState>>,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.engine.get_app(&name)?))
}

pub async fn update_app_handler(
    State(state): State<Arc<ServerState>>,
    Path(name): Path<String>,
    Json(update): Json<AppUpdate>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.engine.update_app(&name, update).await?))
}

pub async fn delete_app_handler(
    State(state): State<Arc<ServerState>>,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    state.engine.delete_app(&name).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn start_app_handler(
    State(state): State<Arc<ServerState>>,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.engine.start(&name).await?))
}

pub async fn stop_app_handler(
    State(state): State<Arc<ServerState>>,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.engine.stop(&name).await?))
}

pub async fn restart_app_handler(
    State(state): State<Arc<ServerState>>,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.engine.restart(&name).await?))
}

pub async fn rollback_handler(
    State(state): State<Arc<ServerState>>,
    Path((name, deployment)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.engine.rollback(&name, &deployment).await?))
}

pub async fn list_deployments_handler(
    State(state): State<Arc<ServerState>>,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.engine.list_deployments(&name)?))
}

pub async fn deployment_log_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let log = state.engine.deployment_log(&id)?;
    Ok(([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], log))
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    pub tail: Option<usize>,
}

pub async fn container_logs_handler(
    State(state): State<Arc<ServerState>>,
    Path(name): Path<String>,
    Query(query): Query<LogsQuery>,
) -> ApiResult<impl IntoResponse> {
    let logs = state
        .engine
        .container_logs(&name, query.tail.unwrap_or(DEFAULT_LOG_TAIL))
        .await?;
    Ok(([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], logs))
}

// -------------------------------------------------------------------- deploy

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeployKind {
    Image,
    Git,
    Upload,
}

/// Deploy parameters; an upload's archive is the request body
#[derive(Debug, Deserialize)]
pub struct DeployQuery {
    pub kind: DeployKind,
    pub image: Option<String>,
    pub url: Option<String>,
    pub branch: Option<String>,

    #[serde(flatten)]
    pub options: BuildOptions,
}

fn deploy_request(query: DeployQuery, body: Bytes) -> Result<DeployRequest, EngineError> {
    let missing = |field: &str| EngineError::ValidationError(format!("'{}' is required", field));

    let source = match query.kind {
        DeployKind::Image => DeploySource::Image {
            reference: query.image.ok_or_else(|| missing("image"))?,
        },
        DeployKind::Git => DeploySource::Git {
            url: query.url.ok_or_else(|| missing("url"))?,
            branch: query.branch,
        },
        DeployKind::Upload => DeploySource::Upload {
            archive: body.to_vec(),
        },
    };
    Ok(DeployRequest::new(source).with_options(query.options))
}

/// Accept a deploy and stream its build log. Acceptance errors are returned
/// as normal error responses; once streaming starts, the outcome is the last
/// line of the body. Dropping the connection cancels the build.
pub async fn deploy_handler(
    State(state): State<Arc<ServerState>>,
    Path(name): Path<String>,
    Query(query): Query<DeployQuery>,
    body: Bytes,
) -> ApiResult<impl IntoResponse> {
    let request = deploy_request(query, body)?;
    let accepted = state.engine.accept_deploy(&name, request).await?;
    let deployment_id = accepted.deployment().id.clone();

    let (tx, rx) = mpsc::channel::<Vec<u8>>(64);
    let cancel = CancellationToken::new();
    let log = BuildLog::new(cancel.clone()).with_sink(tx.clone());
    let engine = state.engine.clone();

    // A quiet build still notices the client leaving
    let closed = tx.clone();
    let watcher = tokio::spawn(async move {
        closed.closed().await;
        cancel.cancel();
    });

    tokio::spawn(async move {
        let outcome = engine.run_deploy(accepted, log).await;
        watcher.abort();
        let status = match outcome {
            Ok(deployment) => format!("\n==> status: deployed {}\n", deployment.id),
            Err(e) => format!("\n==> status: failed: {}\n", e),
        };
        if tx.send(status.into_bytes()).await.is_err() {
            info!("Deploy client went away before the final status");
        }
    });

    let stream = futures::stream::unfold(rx, |mut rx| async move {
        rx.recv()
            .await
            .map(|chunk| (Ok::<_, std::io::Error>(chunk), rx))
    });

    Ok((
        [
            (header::CONTENT_TYPE, "text/plain; charset=utf-8".to_string()),
            (DEPLOYMENT_ID_HEADER, deployment_id),
        ],
        Body::from_stream(stream),
    ))
}

// -------------------------------------------------------------------- health

pub async fn app_health_handler(
    State(state): State<Arc<ServerState>>,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.monitor.report(&name)?))
}

pub async fn check_health_handler(
    State(state): State<Arc<ServerState>>,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.monitor.check_now(&name).await?))
}

// ------------------------------------------------------------------- backups

pub async fn list_backups_handler(
    State(state): State<Arc<ServerState>>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.backups.list()?))
}

pub async fn create_backup_handler(
    State(state): State<Arc<ServerState>>,
    Query(options): Query<BackupOptions>,
) -> ApiResult<impl IntoResponse> {
    let backup = state.backups.create(options).await?;
    Ok((StatusCode::CREATED, Json(backup)))
}

/// Restore flags; none given restores everything
#[derive(Debug, Default, Deserialize)]
pub struct RestoreQuery {
    pub database: Option<bool>,
    pub config: Option<bool>,
    pub apps: Option<bool>,
    pub volumes: Option<bool>,
}

impl RestoreQuery {
    fn into_options(self) -> RestoreOptions {
        if self.database.is_none()
            && self.config.is_none()
            && self.apps.is_none()
            && self.volumes.is_none()
        {
            return RestoreOptions::all();
        }
        RestoreOptions {
            restore_database: self.database.unwrap_or(false),
            restore_config: self.config.unwrap_or(false),
            restore_apps: self.apps.unwrap_or(false),
            restore_volumes: self.volumes.unwrap_or(false),
        }
    }
}

pub async fn restore_backup_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
    Query(query): Query<RestoreQuery>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.backups.restore(&id, query.into_options()).await?))
}

#[derive(Debug, Serialize)]
pub struct DeleteBackupResponse {
    pub id: String,
    pub warnings: Vec<String>,
}

pub async fn delete_backup_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let warnings = state.backups.delete(&id).await?;
    Ok(Json(DeleteBackupResponse { id, warnings }))
}

// -------------------------------------------------------------------- images

#[derive(Debug, Deserialize)]
pub struct PruneQuery {
    #[serde(default = "default_keep")]
    pub keep: usize,
}

fn default_keep() -> usize {
    2
}

#[derive(Debug, Serialize)]
pub struct PruneResponse {
    pub removed: Vec<String>,
}

pub async fn prune_images_handler(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<PruneQuery>,
) -> ApiResult<impl IntoResponse> {
    let removed = state.engine.prune_images(query.keep).await?;
    Ok(Json(PruneResponse { removed }))
}
