//! Request handlers for worker dispatch and health checks.
//!
//! Worker dispatch is the router's fallback: every path that no other
//! route claims is offered to the [`WorkerManager`](edge_workers_core::WorkerManager).

use std::time::Instant;

use axum::Json;
use axum::body::to_bytes;
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use edge_workers_common::WorkerError;

use crate::request::inbound_from_axum;
use crate::response::into_axum_response;
use crate::state::AppState;

/// JSON error body with the given status.
pub fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}

/// Route a request to a worker and adapt its response.
///
/// This handler:
/// 1. Buffers the request body up to the configured limit
/// 2. Lets the manager resolve the route and run the guest handler
/// 3. Converts the guest response, streaming it if needed
#[instrument(skip_all, fields(method = %request.method(), path = %request.uri().path()))]
pub async fn dispatch_worker(State(state): State<AppState>, request: Request) -> Response {
    let start = Instant::now();
    let request_id = Uuid::new_v4().to_string();

    let (parts, body) = request.into_parts();
    let body = match to_bytes(body, state.max_body_bytes()).await {
        Ok(body) => body,
        Err(e) => {
            warn!(request_id = %request_id, error = %e, "Rejected request body");
            return error_response(StatusCode::PAYLOAD_TOO_LARGE, "Request body too large");
        }
    };
    let inbound = inbound_from_axum(&axum::http::Request::from_parts(parts, ()), body);

    match state.manager().dispatch(inbound).await {
        Ok(dispatched) => {
            info!(
                request_id = %request_id,
                worker_id = %dispatched.worker_id,
                status = dispatched.response.status,
                body = ?dispatched.response.body.kind(),
                duration_ms = start.elapsed().as_millis(),
                "Request dispatched"
            );
            into_axum_response(dispatched.response)
        }
        Err(e) => {
            if !e.is_routing_outcome() {
                error!(
                    request_id = %request_id,
                    error = %e,
                    duration_ms = start.elapsed().as_millis(),
                    "Request failed"
                );
            }
            error_to_response(&e)
        }
    }
}

/// Convert a dispatch error to an HTTP response.
///
/// Guest messages and stack traces stay in the worker's logs; clients only
/// see a generic message.
pub fn error_to_response(error: &WorkerError) -> Response {
    match error {
        WorkerError::NotAWorkerRoute { .. } => error_response(StatusCode::NOT_FOUND, "Not found"),
        WorkerError::WorkerNotRunning { route } => error_response(
            StatusCode::NOT_FOUND,
            &format!("No running worker for route: {route}"),
        ),
        WorkerError::UnknownRoute { .. } => {
            error_response(StatusCode::NOT_FOUND, "Worker route does not exist")
        }
        WorkerError::Timeout { budget_ms, .. } => error_response(
            StatusCode::GATEWAY_TIMEOUT,
            &format!("Worker timed out after {budget_ms}ms"),
        ),
        WorkerError::ShuttingDown => {
            error_response(StatusCode::SERVICE_UNAVAILABLE, "Server is shutting down")
        }
        _ => error_response(StatusCode::INTERNAL_SERVER_ERROR, "Worker execution error"),
    }
}

/// Health check handler.
///
/// Returns 200 OK if the server is running.
pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

/// Readiness check handler.
///
/// Returns 200 OK with the number of running workers while requests are
/// accepted, 503 once shutdown has begun.
pub async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let manager = state.manager();
    let accepting = manager.is_accepting();
    let body = serde_json::json!({
        "status": if accepting { "ready" } else { "shutting_down" },
        "running_workers": manager.snapshot().len(),
        "inflight": manager.inflight(),
    });
    let status = if accepting {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_routing_outcomes_are_404() {
        let err = WorkerError::NotAWorkerRoute { path: "/x".into() };
        assert_eq!(error_to_response(&err).status(), StatusCode::NOT_FOUND);

        let err = WorkerError::WorkerNotRunning { route: "x".into() };
        assert_eq!(error_to_response(&err).status(), StatusCode::NOT_FOUND);

        let err = WorkerError::UnknownRoute { path: "/xy".into() };
        assert_eq!(error_to_response(&err).status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_error_to_response_timeout() {
        let err = WorkerError::Timeout {
            worker_id: "w".into(),
            budget_ms: 1000,
        };
        assert_eq!(error_to_response(&err).status(), StatusCode::GATEWAY_TIMEOUT);
    }

    #[test]
    fn test_handler_error_is_generic_500() {
        let err = WorkerError::handler("w", "TypeError: secret detail at line 3");
        let resp = error_to_response(&err);
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_shutting_down_is_503() {
        assert_eq!(
            error_to_response(&WorkerError::ShuttingDown).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
