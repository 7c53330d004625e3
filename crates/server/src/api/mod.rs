use crate::config::AppState;
use anyhow::Result;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tokenflow_core::EngineError;
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};

mod handlers;

/// Serve the API until `shutdown` resolves
pub async fn serve(addr: &str, state: AppState, shutdown: impl Future<Output = ()> + Send + 'static) -> Result<()> {
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("API server listening on {}", addr);

    axum::serve(listener, app).with_graceful_shutdown(shutdown).await?;

    Ok(())
}

/// Create the API router
fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health_check))
        .route(
            "/api/definitions",
            get(handlers::list_definitions).post(handlers::deploy_definition),
        )
        .route("/api/definitions/{key}", get(handlers::get_definition))
        .route(
            "/api/definitions/{key}/versions/{version}",
            get(handlers::get_definition_version),
        )
        .route(
            "/api/instances",
            get(handlers::list_instances).post(handlers::start_instance),
        )
        .route("/api/instances/{instance_id}", get(handlers::get_instance))
        .route("/api/instances/{instance_id}/events", get(handlers::get_instance_events))
        .route("/api/instances/{instance_id}/signal", post(handlers::signal_token))
        .route("/api/instances/{instance_id}/messages", post(handlers::deliver_message))
        .route("/api/instances/{instance_id}/terminate", post(handlers::terminate_instance))
        .route("/api/instances/{instance_id}/suspend", post(handlers::suspend_instance))
        .route("/api/instances/{instance_id}/resume", post(handlers::resume_instance))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().include_headers(true))
                .on_response(DefaultOnResponse::new().include_headers(true)),
        )
        .layer(CorsLayer::permissive())
        .with_state(Arc::new(state))
}

/// Health check endpoint
async fn health_check(axum::extract::State(state): axum::extract::State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "tokenflow",
        "version": env!("CARGO_PKG_VERSION"),
        "active": state.service.is_active().await,
    }))
}

/// API error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            details: None,
        }
    }

    pub fn with_details(error: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            details: Some(details.into()),
        }
    }
}

/// Custom error type for API handlers
pub struct ApiError(anyhow::Error);

impl ApiError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self(EngineError::Validation(msg.into()).into())
    }

    fn status(&self) -> StatusCode {
        match self.0.downcast_ref::<EngineError>() {
            Some(EngineError::Validation(_)) => StatusCode::BAD_REQUEST,
            Some(EngineError::NotFound(_)) => StatusCode::NOT_FOUND,
            Some(EngineError::InvalidState(_))
            | Some(EngineError::StaleSignal(_))
            | Some(EngineError::Synchronization(_)) => StatusCode::CONFLICT,
            Some(EngineError::NoMatchingPath(_)) => StatusCode::UNPROCESSABLE_ENTITY,
            Some(EngineError::Storage(_)) => StatusCode::SERVICE_UNAVAILABLE,
            Some(EngineError::TaskFailed(_)) | None => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let error_msg = self.0.to_string();
        let details = self.0.chain().skip(1).map(|e| e.to_string()).collect::<Vec<_>>().join(": ");

        let response = if details.is_empty() {
            ErrorResponse::new(error_msg)
        } else {
            ErrorResponse::with_details(error_msg, details)
        };

        if status.is_server_error() {
            tracing::error!("Request failed: {}", response.error);
        }
        (status, Json(response)).into_response()
    }
}

impl<E> From<E> for ApiError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
