//! Authenticated request pipeline for the Geomark backend
//!
//! Attaches the short-lived access credential to every outgoing call,
//! recognises credential expiry, and recovers from it transparently without
//! disturbing concurrent traffic. At most one refresh is ever in flight;
//! calls that fail while it runs wait for its outcome and are replayed once.
//!
//! Call flow:
//! 1. `interceptor::RequestInterceptor` attaches `Authorization: Bearer ...`
//! 2. `retry::Dispatcher` sends the call through the `Transport`
//! 3. On failure `classify::classify()` picks propagate / refresh / terminal
//! 4. `coordinator::RefreshCoordinator` runs or joins the single refresh
//! 5. Success: the dispatcher replays the call once with the new credential
//! 6. Failure: `session::SessionTerminator` clears state and signals logout

pub mod classify;
pub mod client;
pub mod coordinator;
pub mod error;
pub mod interceptor;
pub mod retry;

#[cfg(test)]
pub(crate) mod testing;

pub use classify::{EndpointKind, FailureClass, classify};
pub use client::{AuthClient, PipelineConfig};
pub use coordinator::{RefreshCoordinator, RefreshState, RefreshTicket, Role, Settlement};
pub use error::{Error, RefreshError, Result};
pub use interceptor::{CallContext, REQUEST_ID_HEADER, RequestInterceptor};
pub use retry::Dispatcher;
