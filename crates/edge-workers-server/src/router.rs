//! HTTP router configuration.
//!
//! This module provides functions to build the Axum router with all
//! necessary routes and middleware.

use std::time::Duration;

use axum::Router;
use axum::routing::get;
use tower_http::cors::{Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::admin::{AdminState, build_admin_router};
use crate::handler::{dispatch_worker, health_check, readiness_check};
use crate::state::AppState;

/// Admin API configuration for router.
#[derive(Debug, Clone)]
pub struct AdminRouterConfig {
    /// Admin API prefix (e.g., "/api").
    pub prefix: String,
    /// Admin authentication token; `None` leaves the API open.
    pub token: Option<String>,
}

/// Build the main application router.
///
/// Routes:
/// - `GET /health` - Health check
/// - `GET /ready` - Readiness check
/// - everything else - Worker dispatch
pub fn build_router(state: AppState, request_timeout: Duration) -> Router {
    build_router_with_admin(state, request_timeout, None)
}

/// Build the main application router with optional Admin API.
///
/// The request timeout bounds the time until response headers are
/// produced; streamed bodies are not cut off by it.
///
/// # Arguments
///
/// * `state` - Application state
/// * `request_timeout` - Request timeout duration
/// * `admin_config` - Optional Admin API configuration
pub fn build_router_with_admin(
    state: AppState,
    request_timeout: Duration,
    admin_config: Option<AdminRouterConfig>,
) -> Router {
    let health_routes = Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check));

    let mut router = Router::new().merge(health_routes);

    if let Some(config) = admin_config {
        let admin_state = AdminState {
            app_state: state.clone(),
            admin_token: config.token.filter(|t| !t.is_empty()),
        };
        let admin_router = build_admin_router(admin_state);
        router = router.nest(&config.prefix, admin_router);
    }

    router
        .fallback(dispatch_worker)
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(request_timeout))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::{Body, to_bytes};
    use axum::http::{Request, StatusCode};
    use edge_workers_common::RuntimeConfig;
    use edge_workers_core::{MemoryStore, WorkerManager};
    use edge_workers_host::StandardHost;
    use tower::util::ServiceExt;

    use super::*;

    const HELLO: &str = r"addEventListener('fetch', (event) => {
        event.respondWith(new Response('hello', { status: 201 }));
    });";

    fn setup_state(store: MemoryStore) -> AppState {
        let config = RuntimeConfig::default();
        let store = Arc::new(store);
        let host = StandardHost::new(&config.outbound).unwrap();
        let manager = WorkerManager::new(&config, store.clone(), store, Arc::new(host));
        AppState::new(Arc::new(manager))
    }

    fn setup_router(state: AppState) -> Router {
        build_router_with_admin(
            state,
            Duration::from_secs(30),
            Some(AdminRouterConfig {
                prefix: "/api".into(),
                token: Some("secret".into()),
            }),
        )
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_health_check() {
        let app = setup_router(setup_state(MemoryStore::new()));
        let response = app.oneshot(get_request("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_readiness_check() {
        let app = setup_router(setup_state(MemoryStore::new()));
        let response = app.oneshot(get_request("/ready")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["running_workers"], 0);
    }

    #[tokio::test]
    async fn test_unknown_path_is_not_found() {
        let app = setup_router(setup_state(MemoryStore::new()));
        let response = app.oneshot(get_request("/nothing-here")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], br#"{"error":"Not found"}"#);
    }

    #[tokio::test]
    async fn test_admin_requires_token() {
        let app = setup_router(setup_state(MemoryStore::new()));
        let response = app.oneshot(get_request("/api/workers")).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_start_then_dispatch() {
        let state = setup_state(MemoryStore::new().with_worker("hello", "hello", HELLO));
        let app = setup_router(state.clone());

        let start = Request::builder()
            .method("POST")
            .uri("/api/workers/hello/start")
            .header("X-Admin-Token", "secret")
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(start).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(state.manager().is_running("hello"));

        let response = app.oneshot(get_request("/hello/anything")).await.unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response.headers()["content-type"], "text/plain; charset=utf-8");
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"hello");
    }

    #[tokio::test]
    async fn test_stopped_worker_is_404() {
        let app = setup_router(setup_state(MemoryStore::new().with_worker("hello", "hello", HELLO)));
        let response = app.oneshot(get_request("/hello")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
