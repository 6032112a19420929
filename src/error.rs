//! Error types for the supervisor and JSON error responses for the router

use crate::router::RouterBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use std::path::PathBuf;

/// Boxed error used for streamed bodies crossing the router
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors surfaced by [`EngineSupervisor`](crate::supervisor::EngineSupervisor) operations
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    /// No engine binary is known for the host operating system
    #[error("no engine binary registered for platform '{0}'")]
    UnsupportedPlatform(String),

    /// The resolved engine binary does not exist
    #[error("engine binary not found at {}", .0.display())]
    BinaryNotFound(PathBuf),

    /// `start()` was called on a supervisor that already left the idle state
    #[error("start() may only be called once per supervisor")]
    AlreadyStarted,

    /// `stop()` was called while no engine process exists
    #[error("no engine process is running")]
    NotRunning,

    /// The engine did not report readiness in time
    #[error("engine did not report readiness within {0} ms (timed out)")]
    StartupTimeout(u64),

    /// The engine refused to start because its configuration is invalid
    #[error("engine crashed due to invalid configuration (exit code {0})")]
    ConfigurationRejected(i32),

    /// `stop()` ran before the pending start resolved
    #[error("supervisor was stopped before the engine became ready")]
    Stopped,

    /// The engine configuration is structurally invalid
    #[error("invalid engine configuration: {0}")]
    Config(#[from] ConfigError),

    /// The engine process could not be spawned
    #[error("failed to spawn engine process: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Structural problems in the engine or sidecar configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("engine configuration must be a JSON object")]
    NotAnObject,

    #[error("'{0}' must be an array")]
    NotAnArray(&'static str),

    #[error("'{0}' must be an object")]
    InvalidSection(&'static str),

    #[error("'{field}[{index}]' must be an object")]
    InvalidEntry { field: &'static str, index: usize },

    #[error("backend port is not configured and PORT is not set")]
    MissingBackendPort,

    #[error("endpoint must start with '/': {0:?}")]
    InvalidEndpoint(String),
}

/// Error codes for router errors
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyErrorCode {
    /// Failed to connect to the engine
    ConnectionFailed,
    /// The forwarded request could not be built
    InternalError,
}

impl ProxyErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::ConnectionFailed => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::ConnectionFailed => "CONNECTION_FAILED",
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
pub fn json_error_response(code: ProxyErrorCode, message: impl Into<String>) -> Response<RouterBody> {
    let error = ErrorResponse::new(code, message);
    let body = error.to_json();

    Response::builder()
        .status(code.status_code())
        .header("Content-Type", "application/json")
        .header("X-Proxy-Error", code.as_header_value())
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed_unsync())
        .expect("valid response with StatusCode enum and static headers")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_status_codes() {
        assert_eq!(
            ProxyErrorCode::ConnectionFailed.status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ProxyErrorCode::InternalError.status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_error_response_json() {
        let error = ErrorResponse::new(ProxyErrorCode::ConnectionFailed, "engine unreachable");
        let json = error.to_json();

        assert!(json.contains("\"code\":\"CONNECTION_FAILED\""));
        assert!(json.contains("\"message\":\"engine unreachable\""));
        assert!(json.contains("\"status\":502"));
    }

    #[test]
    fn test_json_error_response() {
        let response = json_error_response(ProxyErrorCode::ConnectionFailed, "down");

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            response.headers().get("Content-Type").unwrap(),
            "application/json"
        );
        assert_eq!(
            response.headers().get("X-Proxy-Error").unwrap(),
            "CONNECTION_FAILED"
        );
    }

    #[test]
    fn test_supervisor_error_messages() {
        assert!(SupervisorError::StartupTimeout(50)
            .to_string()
            .contains("timed out"));
        assert!(SupervisorError::ConfigurationRejected(78)
            .to_string()
            .contains("invalid configuration"));
        let err: SupervisorError = ConfigError::NotAnArray("origins").into();
        assert!(err.to_string().contains("'origins' must be an array"));
    }
}
