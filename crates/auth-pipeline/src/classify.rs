//! Failure classification for backend responses
//!
//! Only a 401 is treated as credential expiry. What happens next depends on
//! which endpoint produced it and whether the call has already been retried:
//! a 401 from the refresh endpoint ends the session, a 401 on a replayed call
//! is final, and a 401 on the logout endpoint means there was nothing left to
//! log out of.

use session::{LOGOUT_PATH, REFRESH_PATH};
use transport::ApiRequest;

/// Which kind of endpoint a call targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointKind {
    Refresh,
    Logout,
    Ordinary,
}

impl EndpointKind {
    /// Derive the endpoint kind from the request path (query ignored).
    pub fn of(request: &ApiRequest) -> Self {
        match request.route() {
            REFRESH_PATH => EndpointKind::Refresh,
            LOGOUT_PATH => EndpointKind::Logout,
            _ => EndpointKind::Ordinary,
        }
    }
}

/// What the pipeline does with a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Hand the response to the caller unchanged
    Propagate,
    /// Expired credential on an ordinary call: refresh, then replay
    Refresh,
    /// The refresh endpoint itself rejected us: end the session
    Terminal,
    /// Logout on an already-unauthenticated session: treat as success
    Swallow,
}

/// Classify a response by status, endpoint, and retry marker.
pub fn classify(status: u16, endpoint: EndpointKind, retried: bool) -> FailureClass {
    if status != 401 {
        return FailureClass::Propagate;
    }
    match endpoint {
        EndpointKind::Refresh => FailureClass::Terminal,
        EndpointKind::Logout => FailureClass::Swallow,
        EndpointKind::Ordinary if retried => FailureClass::Propagate,
        EndpointKind::Ordinary => FailureClass::Refresh,
    }
}
