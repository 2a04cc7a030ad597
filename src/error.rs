//! Error codes, structured `{code, message}` replies, and JSON error responses
//! for the embedded proxy

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::alloc::AllocError;
use crate::ipc::IpcError;
use crate::router::RouterError;
use crate::supervisor::SupervisorError;

/// Stable error codes surfaced to callers of the orchestrator API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ParamMissing,
    ParamError,
    AppAlreadyMounted,
    AppNotMounted,
    /// Operation not legal in the supervisor's current state
    ServerBusy,
    SpawnError,
    BootTimeout,
    AppInitError,
    AppImplementationError,
    UnexpectedExit,
    ReloadFailed,
    RouterPushError,
    /// No IPC reply within the configured window
    Timeout,
    IpcSendFailed,
    IpcClosed,
    UnknownCommand,
    AllocExhausted,
    ManifestError,
    InternalError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ParamMissing => "PARAM_MISSING",
            ErrorCode::ParamError => "PARAM_ERROR",
            ErrorCode::AppAlreadyMounted => "APP_ALREADY_MOUNTED",
            ErrorCode::AppNotMounted => "APP_NOT_MOUNTED",
            ErrorCode::ServerBusy => "SERVER_BUSY",
            ErrorCode::SpawnError => "SPAWN_ERROR",
            ErrorCode::BootTimeout => "BOOT_TIMEOUT",
            ErrorCode::AppInitError => "APP_INIT_ERROR",
            ErrorCode::AppImplementationError => "APP_IMPLEMENTATION_ERROR",
            ErrorCode::UnexpectedExit => "UNEXPECTED_EXIT",
            ErrorCode::ReloadFailed => "RELOAD_FAILED",
            ErrorCode::RouterPushError => "ROUTER_PUSH_ERROR",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::IpcSendFailed => "IPC_SEND_FAILED",
            ErrorCode::IpcClosed => "IPC_CLOSED",
            ErrorCode::UnknownCommand => "UNKNOWN_COMMAND",
            ErrorCode::AllocExhausted => "ALLOC_EXHAUSTED",
            ErrorCode::ManifestError => "MANIFEST_ERROR",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The `{code, message}` pair returned through operation results and carried
/// in IPC error replies
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReply {
    pub code: ErrorCode,
    pub message: String,
}

impl ErrorReply {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for ErrorReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for ErrorReply {}

/// Top-level error for orchestrator operations
#[derive(Debug, thiserror::Error)]
pub enum HiveError {
    #[error("missing parameter: {0}")]
    ParamMissing(&'static str),
    #[error("invalid parameter: {0}")]
    Param(String),
    #[error("app already mounted: {0}")]
    AlreadyMounted(String),
    #[error("app not mounted: {0}")]
    NotMounted(String),
    #[error("invalid app manifest: {0}")]
    Manifest(String),
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
    #[error(transparent)]
    Router(#[from] RouterError),
    #[error(transparent)]
    Ipc(#[from] IpcError),
    #[error(transparent)]
    Alloc(#[from] AllocError),
    #[error("{0}")]
    Remote(ErrorReply),
}

impl HiveError {
    pub fn code(&self) -> ErrorCode {
        match self {
            HiveError::ParamMissing(_) => ErrorCode::ParamMissing,
            HiveError::Param(_) => ErrorCode::ParamError,
            HiveError::AlreadyMounted(_) => ErrorCode::AppAlreadyMounted,
            HiveError::NotMounted(_) => ErrorCode::AppNotMounted,
            HiveError::Manifest(_) => ErrorCode::ManifestError,
            HiveError::Supervisor(e) => e.code(),
            HiveError::Router(_) => ErrorCode::RouterPushError,
            HiveError::Ipc(e) => e.code(),
            HiveError::Alloc(_) => ErrorCode::AllocExhausted,
            HiveError::Remote(reply) => reply.code,
        }
    }

    pub fn to_reply(&self) -> ErrorReply {
        match self {
            HiveError::Remote(reply) => reply.clone(),
            other => ErrorReply::new(other.code(), other.to_string()),
        }
    }
}

impl From<ErrorReply> for HiveError {
    fn from(reply: ErrorReply) -> Self {
        HiveError::Remote(reply)
    }
}

/// Error codes for requests the embedded proxy cannot route
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyErrorCode {
    /// No application matches host and path
    RouteNotFound,
    /// Matched application has no live targets
    NoTargets,
    /// Request timed out waiting for the worker
    RequestTimeout,
    /// Failed to connect to the worker
    ConnectionFailed,
    /// Internal proxy error
    InternalError,
}

impl ProxyErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::RouteNotFound => StatusCode::NOT_FOUND,
            ProxyErrorCode::NoTargets => StatusCode::SERVICE_UNAVAILABLE,
            ProxyErrorCode::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyErrorCode::ConnectionFailed => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::RouteNotFound => "ROUTE_NOT_FOUND",
            ProxyErrorCode::NoTargets => "NO_TARGETS",
            ProxyErrorCode::RequestTimeout => "REQUEST_TIMEOUT",
            ProxyErrorCode::ConnectionFailed => "CONNECTION_FAILED",
            ProxyErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: ProxyErrorCode,
    pub message: String,
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
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let error = ErrorResponse::new(code, message);
    let status = code.status_code();
    let body = error.to_json();

    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("X-Proxy-Error", code.as_header_value())
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_serializes_screaming_snake() {
        let json = serde_json::to_string(&ErrorCode::AppNotMounted).unwrap();
        assert_eq!(json, "\"APP_NOT_MOUNTED\"");
        let code: ErrorCode = serde_json::from_str("\"TIMEOUT\"").unwrap();
        assert_eq!(code, ErrorCode::Timeout);
    }

    #[test]
    fn test_as_str_matches_serde() {
        for code in [
            ErrorCode::ParamMissing,
            ErrorCode::ServerBusy,
            ErrorCode::AppImplementationError,
            ErrorCode::RouterPushError,
            ErrorCode::IpcSendFailed,
        ] {
            let json = serde_json::to_string(&code).unwrap();
            assert_eq!(json.trim_matches('"'), code.as_str());
        }
    }

    #[test]
    fn test_hive_error_reply() {
        let err = HiveError::NotMounted("simple-app_1.0.0_1".to_string());
        let reply = err.to_reply();
        assert_eq!(reply.code, ErrorCode::AppNotMounted);
        assert!(reply.message.contains("simple-app_1.0.0_1"));

        let json = serde_json::to_value(&reply).unwrap();
        assert_eq!(json["code"], "APP_NOT_MOUNTED");
    }

    #[test]
    fn test_remote_error_keeps_code() {
        let err: HiveError = ErrorReply::new(ErrorCode::Timeout, "no reply").into();
        assert_eq!(err.code(), ErrorCode::Timeout);
        assert_eq!(err.to_reply().message, "no reply");
    }

    #[test]
    fn test_proxy_error_status_codes() {
        assert_eq!(
            ProxyErrorCode::RouteNotFound.status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ProxyErrorCode::RequestTimeout.status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            ProxyErrorCode::ConnectionFailed.status_code(),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn test_json_error_response() {
        let response = json_error_response(ProxyErrorCode::RouteNotFound, "router not found");

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            response.headers().get("Content-Type").unwrap(),
            "application/json"
        );
        assert_eq!(
            response.headers().get("X-Proxy-Error").unwrap(),
            "ROUTE_NOT_FOUND"
        );
    }

    #[test]
    fn test_error_response_json() {
        let error = ErrorResponse::new(ProxyErrorCode::NoTargets, "no live workers");
        let json = error.to_json();
        assert!(json.contains("\"code\":\"NO_TARGETS\""));
        assert!(json.contains("\"status\":503"));
    }
}
