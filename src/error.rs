//! Error types and JSON error responses
//!
//! Management errors are returned to the admin API caller. Proxy errors are
//! local to one proxied request and are answered with a JSON body.

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use std::net::Ipv4Addr;

/// Errors from registry mutations
#[derive(Debug, thiserror::Error)]
pub enum ManagementError {
    #[error("port {port} is already bound by service {identifier}")]
    PortConflict { port: u16, identifier: String },

    #[error("service {0} already exists")]
    AlreadyExists(String),

    #[error("no service {0}")]
    NotFound(String),

    #[error("invalid service request: {0}")]
    InvalidRequest(String),

    #[error("failed to bind port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },
}

impl ManagementError {
    /// HTTP status reported by the management API
    pub fn status_code(&self) -> StatusCode {
        match self {
            ManagementError::PortConflict { .. } => StatusCode::CONFLICT,
            ManagementError::AlreadyExists(_) => StatusCode::CONFLICT,
            ManagementError::NotFound(_) => StatusCode::NOT_FOUND,
            ManagementError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ManagementError::Bind { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Errors from backend DNS resolution
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("lookup of {name} failed after {attempts} attempts: {last}")]
    Exhausted {
        name: String,
        attempts: u32,
        last: String,
    },

    #[error("no A record for {0}")]
    NoAnswer(String),

    #[error("dns protocol error: {0}")]
    Protocol(String),

    #[error("dns socket error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<hickory_proto::error::ProtoError> for ResolveError {
    fn from(err: hickory_proto::error::ProtoError) -> Self {
        ResolveError::Protocol(err.to_string())
    }
}

/// Result of a successful lookup
pub type ResolveResult = Result<Ipv4Addr, ResolveError>;

/// Error codes for per-request proxy failures
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyErrorCode {
    /// Inbound request body could not be read
    BadRequestBody,
    /// Inbound request body exceeded the configured limit
    PayloadTooLarge,
    /// Outbound request could not be built
    RequestBuildFailed,
    /// Backend could not be contacted or the round trip failed
    BackendUnreachable,
    /// Backend address could not be resolved
    ResolutionFailed,
    /// Resolution and round trip exceeded the request deadline
    RequestTimeout,
}

impl ProxyErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::BadRequestBody => StatusCode::BAD_REQUEST,
            ProxyErrorCode::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            ProxyErrorCode::RequestBuildFailed => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyErrorCode::BackendUnreachable => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyErrorCode::ResolutionFailed => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
        }
    }

    /// Get the error code as a string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::BadRequestBody => "BAD_REQUEST_BODY",
            ProxyErrorCode::PayloadTooLarge => "PAYLOAD_TOO_LARGE",
            ProxyErrorCode::RequestBuildFailed => "REQUEST_BUILD_FAILED",
            ProxyErrorCode::BackendUnreachable => "BACKEND_UNREACHABLE",
            ProxyErrorCode::ResolutionFailed => "RESOLUTION_FAILED",
            ProxyErrorCode::RequestTimeout => "REQUEST_TIMEOUT",
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
