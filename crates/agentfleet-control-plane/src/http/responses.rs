//! HTTP error responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use agentfleet_store::StoreError;

use crate::error::ControllerError;

/// Error response.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// A controller error rendered as a JSON body.
#[derive(Debug)]
pub struct ApiError(pub ControllerError);

impl From<ControllerError> for ApiError {
    fn from(err: ControllerError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            ControllerError::Unauthorized => StatusCode::UNAUTHORIZED,
            ControllerError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            ControllerError::AgentUnavailable(_) | ControllerError::Store(StoreError::NotFound { .. }) => {
                StatusCode::NOT_FOUND
            }
            ControllerError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = ErrorResponse {
            error: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}
