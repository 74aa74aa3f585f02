//! Error types for Subtract

use axum::http::StatusCode;
use thiserror::Error;

/// Main error type for Subtract operations
#[derive(Error, Debug)]
pub enum SubtractError {
    /// Configuration errors (bad rule file, invalid settings)
    #[error("Configuration error: {0}")]
    Config(String),

    /// robots.txt fetch answered with a non-2xx, non-404 status
    #[error("Failed to fetch robots.txt for {domain}: HTTP {status}")]
    RobotsFetch { domain: String, status: u16 },

    /// Transport-level failures (connect, DNS, reset)
    #[error("Network error: {0}")]
    Network(String),

    /// Proxy-layer failures (timeouts, broken upstream streams)
    #[error("Proxy error: {0}")]
    Proxy(String),

    /// Remote content-filter failures
    #[error("Remote filter error: {0}")]
    RemoteFilter(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// General errors
    #[error("{0}")]
    General(String),
}

impl SubtractError {
    /// Stable machine-readable code used in error response bodies
    pub fn code(&self) -> &'static str {
        match self {
            SubtractError::Config(_) | SubtractError::RobotsFetch { .. } => "CONFIG_ERROR",
            SubtractError::Network(_) => "NETWORK_ERROR",
            SubtractError::Proxy(_) => "PROXY_ERROR",
            SubtractError::RemoteFilter(_) => "REMOTE_FILTER_ERROR",
            SubtractError::Io(_)
            | SubtractError::Serialization(_)
            | SubtractError::General(_) => "APP_ERROR",
        }
    }

    /// HTTP status a client sees when this error ends a request
    pub fn status_code(&self) -> StatusCode {
        match self {
            SubtractError::Network(_) => StatusCode::SERVICE_UNAVAILABLE,
            SubtractError::Proxy(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Structured context attached to the error, if any
    pub fn metadata(&self) -> Option<serde_json::Value> {
        match self {
            SubtractError::RobotsFetch { domain, status } => Some(serde_json::json!({
                "domain": domain,
                "status": status,
            })),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for SubtractError {
    fn from(e: serde_json::Error) -> Self {
        SubtractError::Serialization(e.to_string())
    }
}

/// Result type alias for Subtract operations
pub type Result<T> = std::result::Result<T, SubtractError>;
