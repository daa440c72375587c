//! Bearer token check for the admin API.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::middleware::Next;
use axum::response::Response;

use crate::controller::Controller;
use crate::http::responses::ApiError;

/// Reject requests whose `Authorization: Bearer` token does not match the
/// controller's. Passes everything when no token is configured.
pub async fn require_token(
    State(controller): State<Arc<Controller>>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));
    controller.authorize(token)?;
    Ok(next.run(request).await)
}
