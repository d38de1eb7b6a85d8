// SPDX-License-Identifier: PolyForm-Shield-1.0

//! HTTP surface: the native management api under `/api/v1` and the
//! Ollama-compatible api under `/api`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use model_runtime::ollama::ErrorResponse;
use tracing::{error, warn};

use crate::error::LifecycleError;
use crate::proxy::ProxyError;
use crate::runtime::SharedContext;

mod management;
mod ollama;

pub fn router(ctx: SharedContext) -> Router {
    Router::new()
        .route("/health", get(management::health))
        .route("/api/v1/models", get(management::models))
        .route("/api/v1/gpus", get(management::gpus))
        .route("/api/v1/slots", get(management::slots))
        .route("/api/v1/slots/{key}", get(management::slot))
        .route("/api/v1/slots/{key}/load", post(management::load))
        .route("/api/v1/slots/{key}/unload", post(management::unload))
        .route("/api/v1/slots/{key}/switch", post(management::switch))
        .route("/api/v1/slots/{key}/health", get(management::slot_health))
        .route(
            "/api/v1/slots/{key}/logs",
            get(management::logs).delete(management::clear_logs),
        )
        .route("/api/v1/registry", get(management::registry))
        .route("/api/v1/registry/verify", post(management::verify))
        .route("/api/v1/registry/cleanup", post(management::cleanup))
        .route("/api/generate", post(ollama::generate))
        .route("/api/chat", post(ollama::chat))
        .route("/api/tags", get(ollama::tags))
        .route("/api/show", post(ollama::show))
        .route("/api/ps", get(ollama::ps))
        .route("/api/delete", axum::routing::delete(ollama::delete))
        .route("/api/version", get(ollama::version))
        .with_state(ctx)
}

/// Handler error, rendered as `{"error": ".."}` with a matching status.
#[derive(Debug)]
pub enum ApiError {
    Lifecycle(LifecycleError),
    Proxy(ProxyError),
}

impl From<LifecycleError> for ApiError {
    fn from(err: LifecycleError) -> Self {
        ApiError::Lifecycle(err)
    }
}

impl From<ProxyError> for ApiError {
    fn from(err: ProxyError) -> Self {
        ApiError::Proxy(err)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Lifecycle(err) => match err {
                LifecycleError::NotFound(_) | LifecycleError::NotBound(_) => StatusCode::NOT_FOUND,
                LifecycleError::AlreadyBound { .. } | LifecycleError::Busy(_) => {
                    StatusCode::CONFLICT
                }
                LifecycleError::InvalidResourceKey(_) => StatusCode::BAD_REQUEST,
                LifecycleError::StartupTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
                LifecycleError::Adapter { .. } | LifecycleError::Registry { .. } => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
            ApiError::Proxy(err) => match err {
                ProxyError::NoBackendBound(_) => StatusCode::SERVICE_UNAVAILABLE,
                ProxyError::NotFound(_) => StatusCode::NOT_FOUND,
                ProxyError::NotSupported(_) => StatusCode::NOT_IMPLEMENTED,
                ProxyError::Upstream { status, .. } => {
                    StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
                }
                ProxyError::Transport(_) => StatusCode::BAD_GATEWAY,
            },
        }
    }

    fn message(&self) -> String {
        match self {
            ApiError::Lifecycle(err) => err.to_string(),
            ApiError::Proxy(err) => err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = self.message();
        if status.is_server_error() {
            error!("{} {}", status.as_u16(), message);
        } else {
            warn!("{} {}", status.as_u16(), message);
        }
        (status, Json(ErrorResponse { error: message })).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
