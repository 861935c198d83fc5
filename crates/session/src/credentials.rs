//! In-memory access credential storage
//!
//! The access credential is the only secret the pipeline handles. It lives
//! in memory for the lifetime of the client and is replaced wholesale on
//! every refresh. Components receive the store as an injected
//! `CredentialProvider` capability rather than reaching for a global.

use std::fmt;
use std::sync::RwLock;

use common::Secret;
use tracing::debug;

/// Short-lived bearer token. Redacted in Debug/Display.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessCredential(Secret<String>);

impl AccessCredential {
    pub fn new(token: impl Into<String>) -> Self {
        Self(Secret::new(token.into()))
    }

    /// Raw token for building the Authorization header.
    pub fn expose(&self) -> &str {
        self.0.expose()
    }

    pub fn is_empty(&self) -> bool {
        self.0.expose().is_empty()
    }
}

impl fmt::Debug for AccessCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AccessCredential({:?})", self.0)
    }
}

impl fmt::Display for AccessCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Read/write capability over the current access credential.
///
/// Implementations must be cheap and synchronous: the request interceptor
/// calls `get()` on every outgoing call.
pub trait CredentialProvider: Send + Sync {
    fn get(&self) -> Option<AccessCredential>;

    /// Replace the held credential. An empty token is treated as `clear()`.
    fn set(&self, credential: AccessCredential);

    /// Remove and return the held credential.
    fn take(&self) -> Option<AccessCredential>;

    fn clear(&self) {
        self.take();
    }
}

/// Process-local credential store.
#[derive(Default)]
pub struct MemoryCredentialStore {
    current: RwLock<Option<AccessCredential>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-seeded with a credential (e.g. from a login surface).
    pub fn with_credential(credential: AccessCredential) -> Self {
        let store = Self::new();
        store.set(credential);
        store
    }
}

impl CredentialProvider for MemoryCredentialStore {
    fn get(&self) -> Option<AccessCredential> {
        self.current
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn set(&self, credential: AccessCredential) {
        let mut current = self
            .current
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if credential.is_empty() {
            debug!("empty credential supplied, clearing store");
            *current = None;
        } else {
            *current = Some(credential);
        }
    }

    fn take(&self) -> Option<AccessCredential> {
        self.current
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }
}
