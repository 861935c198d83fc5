//! Client-side session state for the Geomark backend
//!
//! Holds the short-lived access credential in memory, knows how to talk to
//! the two session endpoints (token refresh and logout), and owns the
//! logged-in/logged-out signal that UI layers subscribe to. The long-lived
//! refresh credential never passes through this crate: it rides in the
//! transport's cookie jar.
//!
//! Session lifecycle:
//! 1. Login surface hands over an access token → `SessionTerminator::activate()`
//! 2. Pipeline attaches the credential from `CredentialProvider::get()`
//! 3. Credential expires → `token::refresh_access_token()` mints a new one
//! 4. Refresh rejected or explicit logout → `SessionTerminator::terminate()`

pub mod constants;
pub mod credentials;
pub mod error;
pub mod terminator;
pub mod token;

pub use constants::*;
pub use credentials::{AccessCredential, CredentialProvider, MemoryCredentialStore};
pub use error::{Error, Result};
pub use terminator::{LogoutReason, SessionStatus, SessionTerminator};
pub use token::{TokenResponse, logout_request, refresh_access_token, refresh_request};
