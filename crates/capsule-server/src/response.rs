//! HTTP responses for job results.
//!
//! Successful jobs answer with their raw output. Failures answer with an
//! [`ErrorBody`] whose status mirrors the HTTP status line.

use axum::body::Body;
use axum::http::{Response, StatusCode, header};
use axum::response::IntoResponse;
use serde::Serialize;

use capsule_common::{ExecutorError, RuntimeError};

/// JSON body of every failed function call: `{"status":..,"message":..}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorBody {
    /// HTTP status, repeated in the body.
    pub status: u16,
    /// Error message.
    pub message: String,
}

impl ErrorBody {
    /// Create an error body for `status`.
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status: status.as_u16(),
            message: message.into(),
        }
    }

    /// The fallback for failures the guest did not describe itself.
    pub fn unknown() -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "unknown error")
    }

    fn status_code(&self) -> StatusCode {
        StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }
}

impl IntoResponse for ErrorBody {
    fn into_response(self) -> axum::response::Response {
        (self.status_code(), axum::Json(self)).into_response()
    }
}

/// Map an executor failure to its response body.
///
/// Guest-reported errors keep their code as the HTTP status when it is one;
/// everything the guest did not describe becomes `500 unknown error`.
pub fn error_body(error: &ExecutorError) -> ErrorBody {
    match error {
        ExecutorError::CannotHandle { job_type } => {
            ErrorBody::new(StatusCode::NOT_FOUND, format!("cannot handle job: {job_type}"))
        }
        ExecutorError::Runtime(RuntimeError::Run(run_err)) => {
            let status = u16::try_from(run_err.code)
                .ok()
                .filter(|code| (100..600).contains(code))
                .and_then(|code| StatusCode::from_u16(code).ok())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            ErrorBody::new(status, run_err.message.clone())
        }
        ExecutorError::Runtime(RuntimeError::FuelExhausted) => {
            ErrorBody::new(StatusCode::TOO_MANY_REQUESTS, error.to_string())
        }
        ExecutorError::Runtime(RuntimeError::ExecutionTimeout { .. }) => {
            ErrorBody::new(StatusCode::GATEWAY_TIMEOUT, error.to_string())
        }
        _ => ErrorBody::unknown(),
    }
}

/// A `200 OK` carrying the job output as-is.
pub fn output_response(output: Vec<u8>) -> Response<Body> {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/octet-stream")],
        output,
    )
        .into_response()
}
