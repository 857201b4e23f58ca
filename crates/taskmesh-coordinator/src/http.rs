//! HTTP status surface for a coordinator instance.
//!
//! Provides endpoints for:
//! - Health check (`/health`)
//! - Prometheus metrics (`/metrics`)
//! - Cluster status (`/v1/status`)
//! - Open alerts (`/v1/alerts`)

use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tracing::error;

use crate::coordinator::Coordinator;

/// Create the HTTP router.
pub fn create_router(coordinator: Arc<Coordinator>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/v1/status", get(status_handler))
        .route("/v1/alerts", get(alerts_handler))
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_handler))
        .layer(cors)
        .with_state(coordinator)
}

/// Health check endpoint.
pub async fn health_check() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

/// Prometheus metrics endpoint.
pub async fn metrics_handler(State(coordinator): State<Arc<Coordinator>>) -> impl IntoResponse {
    let body = crate::metrics::collect_metrics(&coordinator).await;
    ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body)
}

pub async fn status_handler(State(coordinator): State<Arc<Coordinator>>) -> Response {
    match coordinator.status().await {
        Ok(report) => Json(report).into_response(),
        Err(e) => {
            error!(error = %e, "Failed to build status report");
            internal_error(&e)
        }
    }
}

pub async fn alerts_handler(State(coordinator): State<Arc<Coordinator>>) -> Response {
    match coordinator.alerts().list(false).await {
        Ok(alerts) => Json(alerts).into_response(),
        Err(e) => {
            error!(error = %e, "Failed to list alerts");
            internal_error(&e)
        }
    }
}

fn internal_error(e: &crate::error::CoordinatorError) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": e.to_string() })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::config::Config;
    use crate::executor::NullBackend;
    use crate::health::NoopTarget;

    #[tokio::test]
    async fn test_status_handler_ok() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            state_dir: dir.path().to_path_buf(),
            ..Config::default()
        };
        let coordinator = Arc::new(
            Coordinator::new(config, Arc::new(NullBackend), Arc::new(NoopTarget))
                .await
                .unwrap(),
        );

        let response = status_handler(State(coordinator)).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_health_check() {
        let response = health_check().await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
