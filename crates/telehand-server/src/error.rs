//! Server error types.

use thiserror::Error;

/// HTTP server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// No bindable port in the scan range
    #[error("no available port found starting from {0}")]
    NoAvailablePort(u16),
}

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;
