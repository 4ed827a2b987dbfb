//! MCP Error Types
//!
//! This module defines the error type shared by the dispatcher, the transports
//! and the client. Every error that crosses a transport boundary is carried as
//! [`ErrorData`] with an HTTP-aligned integer code, so a client can recover the
//! original code and message from a response body or an error frame.

use serde::{ Deserialize, Serialize };
use serde_json::{ Map, Value };
use std::fmt;
use thiserror::Error;

/// Wire form of an error, carried verbatim inside response envelopes
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ErrorData {
    /// Error code (HTTP-aligned, see [`error_codes`])
    pub code: i32,
    /// Human-readable error message
    pub message: String,
    /// Optional additional data
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Map<String, Value>>,
}

impl ErrorData {
    /// Create error data without extra payload
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Attach an extra data member
    pub fn with_data(mut self, key: impl Into<String>, value: Value) -> Self {
        self.data.get_or_insert_with(Map::new).insert(key.into(), value);
        self
    }
}

impl fmt::Display for ErrorData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (code {})", self.message, self.code)
    }
}

/// HTTP-aligned error codes used on every transport
pub mod error_codes {
    /// Malformed envelope, missing method, invalid parameters
    pub const BAD_REQUEST: i32 = 400;
    /// Missing or invalid credentials
    pub const UNAUTHORIZED: i32 = 401;
    /// Authenticated but not allowed
    pub const FORBIDDEN: i32 = 403;
    /// Unknown method, tool, prompt, resource or session
    pub const NOT_FOUND: i32 = 404;
    /// Handler exceeded the transport deadline
    pub const REQUEST_TIMEOUT: i32 = 408;
    /// Duplicate registration or duplicate in-flight request id
    pub const CONFLICT: i32 = 409;
    /// Envelope or body over the configured size limit
    pub const PAYLOAD_TOO_LARGE: i32 = 413;
    /// Admission control rejected the request
    pub const TOO_MANY_REQUESTS: i32 = 429;
    /// Request was cancelled before it produced a result
    pub const CANCELLED: i32 = 499;
    /// Handler failure or recovered panic
    pub const INTERNAL_ERROR: i32 = 500;
}

/// The main Error type for the MCP library
#[derive(Error, Debug)]
pub enum Error {
    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Transport-related errors (connection reset, write failure)
    #[error("Transport error: {0}")]
    Transport(String),

    /// Protocol violations (malformed envelope, missing method)
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Invalid parameters for a method or tool
    #[error("Invalid parameters: {0}")]
    InvalidParams(String),

    /// No handler is registered for the method
    #[error("handler not registered: {0}")]
    HandlerNotRegistered(String),

    /// Unknown tool, prompt or resource
    #[error("Not found: {0}")]
    NotFound(String),

    /// `initialize` on a session that is already initialized
    #[error("already initialized")]
    AlreadyInitialized,

    /// Method call before `initialize`
    #[error("session not initialized")]
    NotInitialized,

    /// Session id is unknown or its TTL elapsed
    #[error("session expired: {0}")]
    SessionExpired(String),

    /// Authentication error
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Authorization error
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Duplicate registration or conflicting state
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Payload over the configured limit
    #[error("Payload too large: {0}")]
    PayloadTooLarge(String),

    /// Rate limit exceeded
    #[error("Rate limit exceeded: {0}")]
    RateLimited(String),

    /// Request timeout
    #[error("Request timeout: {0}")]
    Timeout(String),

    /// Request was cancelled
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Write or read on a closed stream pipe
    #[error("stream closed")]
    StreamClosed,

    /// Invalid state for requested operation
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// A structured error received from the peer, code preserved
    #[error("{0}")]
    Rpc(ErrorData),

    /// Other errors
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Build an error with an arbitrary code and message
    pub fn rpc(code: i32, message: impl Into<String>) -> Self {
        Error::Rpc(ErrorData::new(code, message))
    }

    /// Wrap any foreign error as an internal error, keeping its display string
    pub fn internal<E: std::error::Error>(err: E) -> Self {
        Error::Other(err.to_string())
    }

    /// Convert an error to its wire code
    pub fn code(&self) -> i32 {
        use error_codes::*;
        match self {
            Error::Json(_) => BAD_REQUEST,
            Error::Protocol(_) => BAD_REQUEST,
            Error::InvalidParams(_) => BAD_REQUEST,
            Error::AlreadyInitialized => BAD_REQUEST,
            Error::NotInitialized => BAD_REQUEST,
            Error::HandlerNotRegistered(_) => NOT_FOUND,
            Error::NotFound(_) => NOT_FOUND,
            Error::SessionExpired(_) => NOT_FOUND,
            Error::Unauthorized(_) => UNAUTHORIZED,
            Error::Forbidden(_) => FORBIDDEN,
            Error::Conflict(_) => CONFLICT,
            Error::InvalidState(_) => CONFLICT,
            Error::PayloadTooLarge(_) => PAYLOAD_TOO_LARGE,
            Error::RateLimited(_) => TOO_MANY_REQUESTS,
            Error::Timeout(_) => REQUEST_TIMEOUT,
            Error::Cancelled(_) => CANCELLED,
            Error::Rpc(data) => data.code,
            Error::Io(_) => INTERNAL_ERROR,
            Error::Transport(_) => INTERNAL_ERROR,
            Error::StreamClosed => INTERNAL_ERROR,
            Error::Other(_) => INTERNAL_ERROR,
        }
    }

    /// The message put on the wire: the inner text for known errors
    pub fn message(&self) -> String {
        match self {
            Error::Protocol(s) |
            Error::InvalidParams(s) |
            Error::NotFound(s) |
            Error::Unauthorized(s) |
            Error::Forbidden(s) |
            Error::Conflict(s) |
            Error::PayloadTooLarge(s) |
            Error::RateLimited(s) |
            Error::Timeout(s) |
            Error::Cancelled(s) |
            Error::InvalidState(s) |
            Error::Other(s) => s.clone(),
            Error::HandlerNotRegistered(_) => "handler not registered".to_string(),
            Error::SessionExpired(_) => "session expired".to_string(),
            Error::Rpc(data) => data.message.clone(),
            other => other.to_string(),
        }
    }

    /// Coerce this error into its wire form
    pub fn to_error_data(&self) -> ErrorData {
        match self {
            Error::Rpc(data) => data.clone(),
            other => ErrorData::new(other.code(), other.message()),
        }
    }

    /// Whether the error means the connection itself is unusable
    pub fn is_transport(&self) -> bool {
        matches!(self, Error::Transport(_) | Error::Io(_))
    }
}

impl From<ErrorData> for Error {
    fn from(data: ErrorData) -> Self {
        Error::Rpc(data)
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Error::Transport(format!("WebSocket error: {}", err))
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::Transport(format!("HTTP error: {}", err))
    }
}

// Manual implementation of Clone that handles non-cloneable types
impl Clone for Error {
    fn clone(&self) -> Self {
        match self {
            Error::Json(e) => Error::Protocol(format!("JSON error: {}", e)),
            Error::Io(e) => Error::Transport(format!("I/O error: {}", e)),
            Error::Transport(s) => Error::Transport(s.clone()),
            Error::Protocol(s) => Error::Protocol(s.clone()),
            Error::InvalidParams(s) => Error::InvalidParams(s.clone()),
            Error::HandlerNotRegistered(s) => Error::HandlerNotRegistered(s.clone()),
            Error::NotFound(s) => Error::NotFound(s.clone()),
            Error::AlreadyInitialized => Error::AlreadyInitialized,
            Error::NotInitialized => Error::NotInitialized,
            Error::SessionExpired(s) => Error::SessionExpired(s.clone()),
            Error::Unauthorized(s) => Error::Unauthorized(s.clone()),
            Error::Forbidden(s) => Error::Forbidden(s.clone()),
            Error::Conflict(s) => Error::Conflict(s.clone()),
            Error::PayloadTooLarge(s) => Error::PayloadTooLarge(s.clone()),
            Error::RateLimited(s) => Error::RateLimited(s.clone()),
            Error::Timeout(s) => Error::Timeout(s.clone()),
            Error::Cancelled(s) => Error::Cancelled(s.clone()),
            Error::StreamClosed => Error::StreamClosed,
            Error::InvalidState(s) => Error::InvalidState(s.clone()),
            Error::Rpc(data) => Error::Rpc(data.clone()),
            Error::Other(s) => Error::Other(s.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_errors_keep_inner_message() {
        let err = Error::InvalidParams("Division by zero".to_string());
        let data = err.to_error_data();
        assert_eq!(data.code, 400);
        assert_eq!(data.message, "Division by zero");
        assert!(data.data.is_none());
    }

    #[test]
    fn unregistered_handler_maps_to_404() {
        let data = Error::HandlerNotRegistered("listTools".to_string()).to_error_data();
        assert_eq!(data.code, 404);
        assert_eq!(data.message, "handler not registered");
    }

    #[test]
    fn foreign_errors_become_500_with_display_string() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk on fire");
        let err = Error::internal(io);
        let data = err.to_error_data();
        assert_eq!(data.code, 500);
        assert_eq!(data.message, "disk on fire");
    }

    #[test]
    fn rpc_errors_round_trip_through_the_wire_form() {
        let original = Error::rpc(418, "teapot");
        let json = serde_json::to_string(&original.to_error_data()).unwrap();
        assert_eq!(json, r#"{"code":418,"message":"teapot"}"#);

        let recovered: Error = serde_json::from_str::<ErrorData>(&json).unwrap().into();
        assert_eq!(recovered.code(), 418);
        assert_eq!(recovered.message(), "teapot");
    }

    #[test]
    fn error_data_carries_optional_map() {
        let data = ErrorData::new(409, "duplicate").with_data("id", serde_json::json!("r1"));
        let value = serde_json::to_value(&data).unwrap();
        assert_eq!(value["data"]["id"], "r1");
    }
}
