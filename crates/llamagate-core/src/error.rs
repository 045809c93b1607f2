//! Error types for llamagate.
//!
//! This module defines the error type shared by every gateway crate, from
//! configuration loading through upstream forwarding.

use std::time::Duration;

/// The main error type for llamagate operations.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid configuration value
    #[error("Invalid configuration for '{field}': {message}")]
    InvalidConfig { field: String, message: String },

    /// Configuration file not found
    #[error("Configuration file not found at path: {0}")]
    ConfigNotFound(String),

    /// Every port in the fallback window was already taken
    #[error("Failed to bind after {attempts} attempts starting from port {start_port}")]
    BindExhausted { start_port: u16, attempts: u16 },

    /// Listener setup failed for a reason other than the port being in use
    #[error("Failed to bind listener on port {port}: {message}")]
    Bind { port: u16, message: String },

    /// Malformed HTTP traffic, inbound or upstream
    #[error("HTTP protocol error: {0}")]
    Http(String),

    /// TCP connect to an upstream failed
    #[error("Failed to connect to '{host}:{port}': {message}")]
    Connect {
        host: String,
        port: u16,
        message: String,
    },

    /// TLS handshake with an upstream failed
    #[error("TLS error talking to '{host}': {message}")]
    Tls { host: String, message: String },

    /// Upstream answered with a non-2xx status
    #[error("Upstream '{backend}' returned HTTP {status}: {body}")]
    UpstreamStatus {
        backend: String,
        status: u16,
        body: String,
    },

    /// Upstream answered 2xx but produced no payload
    #[error("Empty response from upstream '{0}'")]
    EmptyResponse(String),

    /// An upstream read or write stalled for longer than the idle limit
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// No backend configurations are loaded
    #[error("No backends configured")]
    NoBackends,

    /// All forwarding attempts failed
    #[error("All {attempts} forwarding attempts failed; last error: {last_error}")]
    RetriesExhausted { attempts: usize, last_error: String },

    /// The host dispatcher queue has been dropped
    #[error("Host dispatcher is closed")]
    DispatcherClosed,

    /// JSON serialization errors (wraps serde_json errors)
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Create a config error with a message
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config(message.into())
    }

    /// Create an invalid config error
    pub fn invalid_config<F: Into<String>, M: Into<String>>(field: F, message: M) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create an HTTP protocol error
    pub fn http<S: Into<String>>(message: S) -> Self {
        Self::Http(message.into())
    }

    /// Create a connect error
    pub fn connect<H: Into<String>, M: Into<String>>(host: H, port: u16, message: M) -> Self {
        Self::Connect {
            host: host.into(),
            port,
            message: message.into(),
        }
    }

    /// Create a TLS error
    pub fn tls<H: Into<String>, M: Into<String>>(host: H, message: M) -> Self {
        Self::Tls {
            host: host.into(),
            message: message.into(),
        }
    }

    /// Create an upstream status error
    pub fn upstream_status<B: Into<String>, M: Into<String>>(backend: B, status: u16, body: M) -> Self {
        Self::UpstreamStatus {
            backend: backend.into(),
            status,
            body: body.into(),
        }
    }

    /// Short, stable label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) | Self::InvalidConfig { .. } | Self::ConfigNotFound(_) => "config",
            Self::BindExhausted { .. } | Self::Bind { .. } => "bind",
            Self::Http(_) => "http",
            Self::Connect { .. } => "connect",
            Self::Tls { .. } => "tls",
            Self::UpstreamStatus { .. } => "upstream_status",
            Self::EmptyResponse(_) => "empty_response",
            Self::Timeout(_) => "timeout",
            Self::NoBackends => "no_backends",
            Self::RetriesExhausted { .. } => "retries_exhausted",
            Self::DispatcherClosed => "dispatcher_closed",
            Self::Json(_) => "json",
            Self::Io(_) => "io",
            Self::Internal(_) => "internal",
        }
    }
}

/// Result type alias for llamagate operations
pub type Result<T> = std::result::Result<T, GatewayError>;
