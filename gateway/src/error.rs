//! Error types for the kaiku gateway

use thiserror::Error;

// Re-export the handler-facing errors from kaiku-core
pub use kaiku_core::{DecodeError, HandlerError};

/// Result type alias for gateway operations
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Main error type for the gateway
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// A handler failed; the pipeline cannot continue
    #[error(transparent)]
    Handler(#[from] HandlerError),

    /// IO error on the input or output channel
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Metrics registration or encoding error
    #[error("metrics error: {0}")]
    Metrics(String),

    /// A pipeline task died without reporting a handler error
    #[error("task failed: {0}")]
    Task(String),
}

impl From<prometheus::Error> for GatewayError {
    fn from(err: prometheus::Error) -> Self {
        GatewayError::Metrics(err.to_string())
    }
}
