//! Health and metrics handlers.

use std::sync::Arc;

use axum::{extract::State, http::header, response::IntoResponse, Json};

use crate::controller::Controller;
use crate::http::responses::ApiError;

/// Health check endpoint.
pub async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

/// Prometheus metrics endpoint.
pub async fn metrics_handler(
    State(controller): State<Arc<Controller>>,
) -> Result<impl IntoResponse, ApiError> {
    let body = crate::metrics::collect_metrics(&controller).await?;
    Ok(([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body))
}
