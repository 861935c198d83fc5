//! Error types for the request pipeline

use std::time::Duration;

use transport::TransportError;

/// Why a credential refresh did not produce a new credential.
///
/// Every variant except `Cancelled` tears the session down before the error
/// reaches any caller. `Cancelled` marks a refresh cycle abandoned by a reset
/// or by a termination that happened elsewhere, and leaves session state
/// untouched.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RefreshError {
    #[error("refresh rejected ({status}): {body}")]
    Unauthorized { status: u16, body: String },

    #[error("refresh endpoint returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("refresh request failed: {0}")]
    Transport(TransportError),

    #[error("refresh timed out after {0:?}")]
    Timeout(Duration),

    #[error("invalid refresh response: {0}")]
    InvalidResponse(String),

    #[error("refresh abandoned before completion")]
    Cancelled,
}

impl From<session::Error> for RefreshError {
    fn from(e: session::Error) -> Self {
        match e {
            session::Error::Http(err) => RefreshError::Transport(err),
            session::Error::Unauthorized { status, body } => {
                RefreshError::Unauthorized { status, body }
            }
            session::Error::TokenRefresh { status, body } => RefreshError::Status { status, body },
            session::Error::InvalidResponse(msg) => RefreshError::InvalidResponse(msg),
        }
    }
}

/// Errors surfaced to callers of the pipeline.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No response received; never an auth condition
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Non-2xx response passed through unchanged (including a 401 on a
    /// call that was already retried once)
    #[error("request failed with status {status}: {body}")]
    Status { status: u16, body: String },

    /// The session could not be renewed. Unless the cause is `Cancelled`,
    /// it has been terminated.
    #[error("session expired: {0}")]
    RefreshFailed(#[from] RefreshError),

    #[error("invalid response body: {0}")]
    Decode(String),
}

impl Error {
    /// HTTP status carried by the error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Whether the session was terminated as part of this failure.
    ///
    /// False for a queued call's own 401 (`Error::Status`); callers that
    /// need to know whether the session survived should check the session
    /// status instead.
    pub fn is_session_expired(&self) -> bool {
        matches!(self, Error::RefreshFailed(cause) if !matches!(cause, RefreshError::Cancelled))
    }
}

/// Result alias for pipeline operations.
pub type Result<T> = std::result::Result<T, Error>;
