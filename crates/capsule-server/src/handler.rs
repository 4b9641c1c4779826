//! Request handlers for job execution.
//!
//! This module provides HTTP handlers that run jobs through the
//! [`Executor`](capsule_core::Executor) and report on the engine.

use std::time::Instant;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::response::{ErrorBody, error_body, output_response};
use crate::state::AppState;

/// Header carrying the caller's request id, echoed on the response.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Run the job registered under `job_type` with the request body as input.
///
/// The request id is taken from `X-Request-Id` when present and becomes the
/// parent id of every bus message the job emits.
#[instrument(skip(state, headers, body), fields(request_id = tracing::field::Empty))]
pub async fn handle_function(
    State(state): State<AppState>,
    Path(job_type): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let start = Instant::now();
    let request_id = request_id(&headers);
    tracing::Span::current().record("request_id", request_id.as_str());

    let result = state
        .executor()
        .do_job(&job_type, &request_id, body.to_vec())
        .await;
    let duration_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);

    let mut response = match result {
        Ok(output) => {
            info!(duration_ms, output_len = output.len(), "Request completed");
            output_response(output)
        }
        Err(err) => {
            let body = error_body(&err);
            warn!(duration_ms, status = body.status, error = %err, "Request failed");
            body.into_response()
        }
    };

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

fn request_id(headers: &HeaderMap) -> String {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map_or_else(|| Uuid::new_v4().to_string(), ToString::to_string)
}

/// Health check handler.
///
/// Returns 200 OK if the server is running.
pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

/// Readiness check handler.
///
/// Ready once the executor has an engine to run jobs on.
pub async fn readiness_check(State(state): State<AppState>) -> Response {
    match state.engine() {
        Some(engine) => {
            let body = serde_json::json!({
                "status": "ready",
                "backend": engine.backend().to_string(),
                "modules_loaded": engine.registered().len(),
            });
            (StatusCode::OK, axum::Json(body)).into_response()
        }
        None => ErrorBody::new(StatusCode::SERVICE_UNAVAILABLE, "executor not fully configured")
            .into_response(),
    }
}

/// List registered job types.
pub async fn list_modules(State(state): State<AppState>) -> impl IntoResponse {
    let modules = state.list_modules();
    axum::Json(serde_json::json!({
        "modules": modules,
        "count": modules.len(),
    }))
}

/// Engine activity counters and per-job-type worker state.
pub async fn metrics(State(state): State<AppState>) -> Response {
    match state.executor().metrics() {
        Ok(metrics) => axum::Json(metrics).into_response(),
        Err(err) => ErrorBody::new(StatusCode::SERVICE_UNAVAILABLE, err.to_string()).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_id_from_header() {
        let mut headers = HeaderMap::new();
        headers.insert(REQUEST_ID_HEADER, "req-42".parse().unwrap());
        assert_eq!(request_id(&headers), "req-42");
    }

    #[test]
    fn test_request_id_generated() {
        let mut headers = HeaderMap::new();
        let generated = request_id(&headers);
        assert!(Uuid::parse_str(&generated).is_ok());

        headers.insert(REQUEST_ID_HEADER, "  ".parse().unwrap());
        assert_ne!(request_id(&headers), "  ");
    }
}
