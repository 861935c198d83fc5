//! Error types for session endpoint operations

use transport::TransportError;

/// Errors from the refresh and logout endpoints.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("HTTP request failed: {0}")]
    Http(#[from] TransportError),

    #[error("refresh rejected ({status}): {body}")]
    Unauthorized { status: u16, body: String },

    #[error("token refresh returned {status}: {body}")]
    TokenRefresh { status: u16, body: String },

    #[error("invalid token response: {0}")]
    InvalidResponse(String),
}

/// Result alias for session operations.
pub type Result<T> = std::result::Result<T, Error>;
