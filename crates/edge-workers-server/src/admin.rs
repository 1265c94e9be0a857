//! Admin API handlers for worker management.
//!
//! This module exposes the lifecycle manager and the Log Channel over HTTP.
//!
//! # Authentication
//!
//! When a token is configured, every endpoint requires the `X-Admin-Token`
//! header to match it. The comparison is constant-time.
//!
//! # Endpoints
//!
//! - `GET /workers` - List workers with their running state
//! - `GET /workers/:id` - Get one worker
//! - `POST /workers/:id/start` - Start a worker
//! - `POST /workers/:id/stop` - Stop a worker
//! - `POST /workers/restart-all` - Restart every running worker
//! - `GET /workers/:id/code` - Read a worker's source
//! - `PUT /workers/:id/code` - Replace a worker's source
//! - `GET /workers/:id/logs` - Read a worker's logs
//! - `DELETE /workers/:id/logs` - Clear a worker's logs

use axum::{
    Extension, Json, Router,
    extract::Path,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use subtle::ConstantTimeEq;
use tracing::{info, instrument, warn};

use edge_workers_common::{StoreError, WorkerError};
use edge_workers_core::{HandlerKind, WorkerDefinition};

use crate::handler::error_response;
use crate::state::AppState;

/// Admin API state containing app state and auth token.
#[derive(Clone)]
pub struct AdminState {
    /// Application state.
    pub app_state: AppState,
    /// Expected admin token; `None` leaves the API open.
    pub admin_token: Option<String>,
}

/// Worker information for API responses.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerInfo {
    /// Worker ID.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Bound route.
    pub route: String,
    /// Description.
    pub description: String,
    /// Whether an instance is running.
    pub running: bool,
    /// Handler style of the running instance.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handler: Option<HandlerKind>,
    /// When the running instance started.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// Last modification of the definition.
    pub updated_at: DateTime<Utc>,
}

impl WorkerInfo {
    fn new(definition: WorkerDefinition, admin_state: &AdminState) -> Self {
        let instance = admin_state.app_state.manager().instance(&definition.id);
        Self {
            running: instance.is_some(),
            handler: instance.as_ref().map(|i| i.handler()),
            started_at: instance.as_ref().map(|i| i.started_at()),
            id: definition.id,
            name: definition.name,
            route: definition.route,
            description: definition.description,
            updated_at: definition.updated_at,
        }
    }
}

/// Build the Admin API router.
///
/// Returns a router that uses Extension to pass the admin state,
/// allowing it to be nested into routers with different state types.
///
/// # Arguments
///
/// * `admin_state` - Admin state containing app state and auth token
pub fn build_admin_router(admin_state: AdminState) -> Router<AppState> {
    Router::new()
        .route("/workers", get(list_workers))
        .route("/workers/restart-all", post(restart_all))
        .route("/workers/:id", get(get_worker))
        .route("/workers/:id/start", post(start_worker))
        .route("/workers/:id/stop", post(stop_worker))
        .route("/workers/:id/code", get(get_code).put(put_code))
        .route("/workers/:id/logs", get(get_logs).delete(clear_logs))
        .layer(Extension(admin_state))
}

/// Verify the admin token from request headers.
fn verify_token(headers: &HeaderMap, expected: Option<&str>) -> Result<(), (StatusCode, &'static str)> {
    let Some(expected) = expected else {
        return Ok(());
    };
    match headers.get("X-Admin-Token") {
        Some(token) => {
            if bool::from(token.as_bytes().ct_eq(expected.as_bytes())) {
                Ok(())
            } else {
                Err((StatusCode::UNAUTHORIZED, "Invalid admin token"))
            }
        }
        None => Err((StatusCode::UNAUTHORIZED, "Missing X-Admin-Token header")),
    }
}

fn authorize(admin_state: &AdminState, headers: &HeaderMap) -> Result<(), Response> {
    verify_token(headers, admin_state.admin_token.as_deref())
        .map_err(|(status, message)| error_response(status, message))
}

/// Map a lifecycle error to an admin response.
fn lifecycle_error(error: &WorkerError) -> Response {
    let status = match error {
        e if e.is_not_found() => StatusCode::NOT_FOUND,
        WorkerError::AlreadyRunning { .. } | WorkerError::NotRunning { .. } => StatusCode::CONFLICT,
        WorkerError::CompileError { .. } | WorkerError::NoHandler { .. } => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        WorkerError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        WorkerError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(status, &error.to_string())
}

fn store_error(worker_id: &str, error: &StoreError) -> Response {
    match error {
        StoreError::NotFound { .. } => {
            error_response(StatusCode::NOT_FOUND, &format!("Worker not found: {worker_id}"))
        }
        other => {
            warn!(worker_id, error = %other, "Store access failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Store error")
        }
    }
}

/// List all workers.
///
/// # Response
///
/// ```json
/// {
///   "workers": [
///     { "id": "hello", "name": "Hello", "route": "hello", "running": true, ... }
///   ],
///   "count": 1
/// }
/// ```
#[instrument(skip(admin_state, headers))]
pub async fn list_workers(
    Extension(admin_state): Extension<AdminState>,
    headers: HeaderMap,
) -> Response {
    if let Err(resp) = authorize(&admin_state, &headers) {
        return resp;
    }

    match admin_state.app_state.manager().definitions().list_definitions().await {
        Ok(definitions) => {
            let workers: Vec<WorkerInfo> = definitions
                .into_iter()
                .map(|definition| WorkerInfo::new(definition, &admin_state))
                .collect();
            let count = workers.len();
            Json(serde_json::json!({ "workers": workers, "count": count })).into_response()
        }
        Err(e) => store_error("*", &e),
    }
}

/// Get one worker.
#[instrument(skip(admin_state, headers))]
pub async fn get_worker(
    Extension(admin_state): Extension<AdminState>,
    headers: HeaderMap,
    Path(worker_id): Path<String>,
) -> Response {
    if let Err(resp) = authorize(&admin_state, &headers) {
        return resp;
    }

    match admin_state.app_state.manager().definitions().get_definition(&worker_id).await {
        Ok(definition) => Json(WorkerInfo::new(definition, &admin_state)).into_response(),
        Err(e) => store_error(&worker_id, &e),
    }
}

/// Start a worker.
///
/// # Response
///
/// ```json
/// { "id": "hello", "running": true, "handler": "eventListener" }
/// ```
#[instrument(skip(admin_state, headers))]
pub async fn start_worker(
    Extension(admin_state): Extension<AdminState>,
    headers: HeaderMap,
    Path(worker_id): Path<String>,
) -> Response {
    if let Err(resp) = authorize(&admin_state, &headers) {
        return resp;
    }

    match admin_state.app_state.manager().start(&worker_id).await {
        Ok(instance) => {
            info!(id = %worker_id, "Worker started via admin API");
            Json(serde_json::json!({
                "id": worker_id,
                "running": true,
                "handler": instance.handler(),
            }))
            .into_response()
        }
        Err(e) => {
            warn!(id = %worker_id, error = %e, "Start failed");
            lifecycle_error(&e)
        }
    }
}

/// Stop a worker.
#[instrument(skip(admin_state, headers))]
pub async fn stop_worker(
    Extension(admin_state): Extension<AdminState>,
    headers: HeaderMap,
    Path(worker_id): Path<String>,
) -> Response {
    if let Err(resp) = authorize(&admin_state, &headers) {
        return resp;
    }

    match admin_state.app_state.manager().stop(&worker_id).await {
        Ok(()) => {
            info!(id = %worker_id, "Worker stopped via admin API");
            Json(serde_json::json!({ "id": worker_id, "running": false })).into_response()
        }
        Err(e) => lifecycle_error(&e),
    }
}

/// Restart every running worker.
#[instrument(skip(admin_state, headers))]
pub async fn restart_all(
    Extension(admin_state): Extension<AdminState>,
    headers: HeaderMap,
) -> Response {
    if let Err(resp) = authorize(&admin_state, &headers) {
        return resp;
    }

    let manager = admin_state.app_state.manager();
    let restarted = manager.restart_all().await;
    Json(serde_json::json!({
        "restarted": restarted,
        "running": manager.snapshot(),
    }))
    .into_response()
}

/// Read a worker's source.
#[instrument(skip(admin_state, headers))]
pub async fn get_code(
    Extension(admin_state): Extension<AdminState>,
    headers: HeaderMap,
    Path(worker_id): Path<String>,
) -> Response {
    if let Err(resp) = authorize(&admin_state, &headers) {
        return resp;
    }

    match admin_state.app_state.manager().definitions().read_source(&worker_id).await {
        Ok(code) => (
            [(axum::http::header::CONTENT_TYPE, "application/javascript")],
            code,
        )
            .into_response(),
        Err(e) => store_error(&worker_id, &e),
    }
}

/// Replace a worker's source. Takes effect on the next start.
#[instrument(skip(admin_state, headers, code))]
pub async fn put_code(
    Extension(admin_state): Extension<AdminState>,
    headers: HeaderMap,
    Path(worker_id): Path<String>,
    code: String,
) -> Response {
    if let Err(resp) = authorize(&admin_state, &headers) {
        return resp;
    }

    match admin_state
        .app_state
        .manager()
        .definitions()
        .write_source(&worker_id, &code)
        .await
    {
        Ok(()) => {
            info!(id = %worker_id, bytes = code.len(), "Worker source updated");
            Json(serde_json::json!({ "id": worker_id, "message": "Source updated" })).into_response()
        }
        Err(e) => store_error(&worker_id, &e),
    }
}

/// Read a worker's logs, oldest first.
#[instrument(skip(admin_state, headers))]
pub async fn get_logs(
    Extension(admin_state): Extension<AdminState>,
    headers: HeaderMap,
    Path(worker_id): Path<String>,
) -> Response {
    if let Err(resp) = authorize(&admin_state, &headers) {
        return resp;
    }

    let logs = admin_state.app_state.manager().logs().get_logs(&worker_id);
    Json(serde_json::json!({ "workerId": worker_id, "logs": logs })).into_response()
}

/// Clear a worker's logs.
#[instrument(skip(admin_state, headers))]
pub async fn clear_logs(
    Extension(admin_state): Extension<AdminState>,
    headers: HeaderMap,
    Path(worker_id): Path<String>,
) -> Response {
    if let Err(resp) = authorize(&admin_state, &headers) {
        return resp;
    }

    admin_state.app_state.manager().logs().clear_logs(&worker_id);
    StatusCode::NO_CONTENT.into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verify_token_valid() {
        let mut headers = HeaderMap::new();
        headers.insert("X-Admin-Token", "secret".parse().unwrap());

        let result = verify_token(&headers, Some("secret"));
        assert!(result.is_ok());
    }

    #[test]
    fn test_verify_token_invalid() {
        let mut headers = HeaderMap::new();
        headers.insert("X-Admin-Token", "wrong".parse().unwrap());

        let result = verify_token(&headers, Some("secret"));
        assert_eq!(result.unwrap_err().0, StatusCode::UNAUTHORIZED);

        headers.insert("X-Admin-Token", "secret-but-longer".parse().unwrap());
        assert!(verify_token(&headers, Some("secret")).is_err());
    }

    #[test]
    fn test_verify_token_missing() {
        let headers = HeaderMap::new();

        let result = verify_token(&headers, Some("secret"));
        assert_eq!(result.unwrap_err().0, StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn test_no_token_configured() {
        assert!(verify_token(&HeaderMap::new(), None).is_ok());
    }

    #[test]
    fn test_lifecycle_error_status() {
        assert_eq!(
            lifecycle_error(&WorkerError::not_found("x")).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            lifecycle_error(&WorkerError::already_running("x")).status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            lifecycle_error(&WorkerError::NoHandler { worker_id: "x".into() }).status(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
    }
}
