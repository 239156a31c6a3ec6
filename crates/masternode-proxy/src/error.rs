//! Error types for the proxy.

use hyper::StatusCode;
use thiserror::Error;

/// Proxy error type.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Could not open a connection to the origin.
    #[error("Origin connect to {origin} failed: {reason}")]
    OriginConnect { origin: String, reason: String },

    /// The origin did not accept the connection in time.
    #[error("Origin connect to {0} timed out")]
    OriginTimeout(String),

    /// The origin connection failed mid-transaction.
    #[error("Origin error: {0}")]
    Origin(String),

    /// The client went away or the response was aborted.
    #[error("Client connection aborted")]
    ClientAborted,

    /// HTTP error.
    #[error("HTTP error: {0}")]
    Http(String),

    /// JSON parsing error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Storage error.
    #[error("Storage error: {0}")]
    Storage(#[from] masternode_storage::StorageError),

    /// Peer gateway error.
    #[error("Gateway error: {0}")]
    Gateway(String),
}

impl ProxyError {
    /// Status reported to a client when the origin cannot be reached.
    pub fn gateway_status(&self) -> StatusCode {
        match self {
            ProxyError::OriginTimeout(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::BAD_GATEWAY,
        }
    }
}

impl From<hyper::Error> for ProxyError {
    fn from(e: hyper::Error) -> Self {
        ProxyError::Http(e.to_string())
    }
}

impl From<reqwest::Error> for ProxyError {
    fn from(e: reqwest::Error) -> Self {
        ProxyError::Gateway(e.to_string())
    }
}

/// Result type for proxy operations.
pub type Result<T> = std::result::Result<T, ProxyError>;
