//! Pipeline error taxonomy and JSON error responses

use crate::dispatch::ForwardError;
use crate::runtime::RuntimeError;
use crate::{full, ProxyBody};
use hyper::{Response, StatusCode};
use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Why a workload could not be found or provisioned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotFoundReason {
    /// No container exists and auto-creation is turned off
    AutoCreateDisabled,
    /// Auto-creation is on but no template or create function is configured
    NoCreateStrategy,
}

impl fmt::Display for NotFoundReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NotFoundReason::AutoCreateDisabled => write!(f, "auto_create: false"),
            NotFoundReason::NoCreateStrategy => write!(f, "missing create template"),
        }
    }
}

/// Everything that can go wrong between reading a workload name and
/// receiving a backend response.
///
/// Connection resets never appear here: the dispatcher turns them into a
/// retry page before they reach the entry point.
#[derive(Debug, Error)]
pub enum WorkloadError {
    #[error("no container found: {name} ({reason})")]
    NotFound { name: String, reason: NotFoundReason },

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error("container '{name}' publishes no port (status: '{status}')")]
    MalformedInstance { name: String, status: String },

    #[error("container '{name}' disappeared after it was started")]
    Vanished { name: String },

    #[error("upstream request failed: {0}")]
    Upstream(#[from] ForwardError),
}

impl WorkloadError {
    /// Error code reported to the client
    pub fn code(&self) -> ProxyErrorCode {
        match self {
            WorkloadError::NotFound { .. } => ProxyErrorCode::NoWorkload,
            WorkloadError::Runtime(_) | WorkloadError::Vanished { .. } => {
                ProxyErrorCode::RuntimeFailure
            }
            WorkloadError::MalformedInstance { .. } => ProxyErrorCode::MalformedInstance,
            WorkloadError::Upstream(_) => ProxyErrorCode::UpstreamFailed,
        }
    }
}

/// Error codes for proxy errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyErrorCode {
    /// Request carried no workload, or the workload does not exist
    NoWorkload,
    /// A list/create/start call against the runtime failed
    RuntimeFailure,
    /// The runtime reported a running container without a published port
    MalformedInstance,
    /// Forwarding to the backend failed for a reason other than a reset
    UpstreamFailed,
    /// Internal proxy error
    InternalError,
}

impl ProxyErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::NoWorkload => StatusCode::NOT_FOUND,
            ProxyErrorCode::RuntimeFailure
            | ProxyErrorCode::MalformedInstance
            | ProxyErrorCode::UpstreamFailed
            | ProxyErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::NoWorkload => "NO_WORKLOAD",
            ProxyErrorCode::RuntimeFailure => "RUNTIME_FAILURE",
            ProxyErrorCode::MalformedInstance => "MALFORMED_INSTANCE",
            ProxyErrorCode::UpstreamFailed => "UPSTREAM_FAILED",
            ProxyErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// The error code
    pub code: ProxyErrorCode,
    /// Human-readable error message
    pub message: String,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorResponse {
    /// Create a new error response
    pub fn new(code: ProxyErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    /// Convert to JSON string
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Create a JSON error response with X-Proxy-Error header
pub fn json_error_response(
    code: ProxyErrorCode,
    message: impl Into<String>,
) -> Response<ProxyBody> {
    let error = ErrorResponse::new(code, message);
    let mut response = Response::new(full(error.to_json()));
    *response.status_mut() = code.status_code();
    let headers = response.headers_mut();
    headers.insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("application/json"),
    );
    headers.insert(
        "x-proxy-error",
        hyper::header::HeaderValue::from_static(code.as_header_value()),
    );
    response
}

/// Terminal error path for a workload request: the error's description
/// becomes the message.
pub fn workload_error_response(err: &WorkloadError) -> Response<ProxyBody> {
    json_error_response(err.code(), err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    #[test]
    fn test_error_code_status_codes() {
        assert_eq!(ProxyErrorCode::NoWorkload.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(
            ProxyErrorCode::RuntimeFailure.status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            ProxyErrorCode::MalformedInstance.status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            ProxyErrorCode::UpstreamFailed.status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_error_response_json() {
        let error = ErrorResponse::new(ProxyErrorCode::RuntimeFailure, "failed to list containers: boom");
        let json = error.to_json();

        assert!(json.contains("\"code\":\"RUNTIME_FAILURE\""));
        assert!(json.contains("\"message\":\"failed to list containers: boom\""));
        assert!(json.contains("\"status\":500"));
    }

    #[test]
    fn test_json_error_response_headers() {
        let response = json_error_response(ProxyErrorCode::NoWorkload, "No workload for this request");

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            response.headers().get("Content-Type").unwrap(),
            "application/json"
        );
        assert_eq!(response.headers().get("X-Proxy-Error").unwrap(), "NO_WORKLOAD");
    }

    #[test]
    fn test_workload_error_codes() {
        let not_found = WorkloadError::NotFound {
            name: "alice".to_string(),
            reason: NotFoundReason::AutoCreateDisabled,
        };
        assert_eq!(not_found.code(), ProxyErrorCode::NoWorkload);
        assert_eq!(
            not_found.to_string(),
            "no container found: alice (auto_create: false)"
        );

        let runtime = WorkloadError::from(RuntimeError::List("socket closed".to_string()));
        assert_eq!(runtime.code(), ProxyErrorCode::RuntimeFailure);
        assert_eq!(runtime.to_string(), "failed to list containers: socket closed");

        let malformed = WorkloadError::MalformedInstance {
            name: "bob".to_string(),
            status: "Up 2 hours".to_string(),
        };
        assert_eq!(
            malformed.to_string(),
            "container 'bob' publishes no port (status: 'Up 2 hours')"
        );
        assert_eq!(malformed.code(), ProxyErrorCode::MalformedInstance);

        let vanished = WorkloadError::Vanished {
            name: "bob".to_string(),
        };
        assert_eq!(vanished.code(), ProxyErrorCode::RuntimeFailure);
    }

    #[tokio::test]
    async fn test_workload_error_response_carries_description() {
        let err = WorkloadError::from(RuntimeError::Start {
            name: "alice".to_string(),
            message: "no such image".to_string(),
        });
        let response = workload_error_response(&err);
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(response.headers().get("x-proxy-error").unwrap(), "RUNTIME_FAILURE");

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let body = String::from_utf8(body.to_vec()).unwrap();
        assert!(body.contains("failed to start container 'alice': no such image"));
    }
}
