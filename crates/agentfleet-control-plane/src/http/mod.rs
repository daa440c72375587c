//! HTTP admin server for the control plane.
//!
//! Provides endpoints for:
//! - Record listings (`/v1/nodes`, `/v1/agents`, `/v1/tasks`), behind the
//!   bearer token when one is configured
//! - Health check (`/health`)
//! - Prometheus metrics (`/metrics`)

use std::sync::Arc;

use axum::{middleware, routing::get, Router};
use tower_http::cors::{Any, CorsLayer};

use crate::controller::Controller;

mod auth;
mod handlers;
pub mod responses;

/// Create the HTTP router.
pub fn create_router(controller: Arc<Controller>) -> Router {
    // CORS layer for dashboard access
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Record listings require the bearer token when one is configured
    let api = Router::new()
        .route("/v1/nodes", get(handlers::list_nodes))
        .route("/v1/agents", get(handlers::list_agents))
        .route("/v1/tasks", get(handlers::list_tasks))
        .route("/v1/tasks/:task_id", get(handlers::get_task))
        .route_layer(middleware::from_fn_with_state(controller.clone(), auth::require_token));

    Router::new()
        .merge(api)
        // Observability routes
        .route("/health", get(handlers::health_check))
        .route("/metrics", get(handlers::metrics_handler))
        .layer(cors)
        .with_state(controller)
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentfleet_core::NodeRegistration;
    use agentfleet_store::MemoryStore;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tokio_util::sync::CancellationToken;
    use tower::ServiceExt;

    use crate::controller::ControllerSettings;

    fn controller() -> Arc<Controller> {
        Arc::new(Controller::new(
            Arc::new(MemoryStore::new()),
            ControllerSettings::default(),
            CancellationToken::new(),
        ))
    }

    async fn get_body(router: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = router
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_health() {
        let (status, body) = get_body(create_router(controller()), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_list_nodes() {
        let controller = controller();
        controller
            .register_node(NodeRegistration::new("worker-1"))
            .await
            .unwrap();

        let (status, body) = get_body(create_router(controller), "/v1/nodes").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[0]["name"], "worker-1");
        assert_eq!(body[0]["status"], "ready");
    }

    #[tokio::test]
    async fn test_bad_task_filter_and_missing_task() {
        let router = create_router(controller());

        let (status, body) = get_body(router.clone(), "/v1/tasks?status=bogus").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("bogus"));

        let (status, _) = get_body(router, "/v1/tasks/missing").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_records_require_token_when_configured() {
        let controller = Arc::new(Controller::new(
            Arc::new(MemoryStore::new()),
            ControllerSettings {
                token: Some("secret".to_string()),
                ..Default::default()
            },
            CancellationToken::new(),
        ));
        let router = create_router(controller);

        let (status, body) = get_body(router.clone(), "/v1/tasks").await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(body["error"].as_str().unwrap().contains("unauthorized"));

        let response = router
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/v1/tasks")
                    .header("authorization", "Bearer secret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let (status, _) = get_body(router, "/health").await;
        assert_eq!(status, StatusCode::OK);
    }
}
