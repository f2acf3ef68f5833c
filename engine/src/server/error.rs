//! Mapping engine errors onto HTTP responses

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::errors::{EngineError, ErrorKind};

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub kind: &'static str,
}

/// Engine error returned from a handler
#[derive(Debug)]
pub struct ApiError(pub EngineError);

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        ApiError(err)
    }
}

/// Status code for an engine error
pub fn status_for(err: &EngineError) -> StatusCode {
    match err.kind() {
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::Validation => StatusCode::BAD_REQUEST,
        ErrorKind::BuildFailed | ErrorKind::ArtifactUnavailable => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        ErrorKind::Cancelled => StatusCode::INTERNAL_SERVER_ERROR,
        ErrorKind::Infrastructure => match err {
            EngineError::RuntimeError(_)
            | EngineError::ProxyError(_)
            | EngineError::HttpError(_)
            | EngineError::DeployError(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        },
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        let body = ErrorBody {
            error: self.0.to_string(),
            kind: self.0.kind().as_str(),
        };
        (status, Json(body)).into_response()
    }
}
