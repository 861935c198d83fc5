//! Credential attachment for outgoing calls
//!
//! Runs synchronously right before a call is handed to the transport, on the
//! first attempt and on the replay alike, so a replay always picks up
//! whatever credential the store holds at that moment.

use std::sync::Arc;

use reqwest::header::{AUTHORIZATION, HeaderName, HeaderValue};
use session::{AccessCredential, CredentialProvider};
use tracing::warn;
use transport::ApiRequest;
use uuid::Uuid;

/// Correlates a replay with its original attempt in backend logs.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Per-call state carried from the first attempt to the replay.
#[derive(Debug, Clone)]
pub struct CallContext {
    id: Uuid,
    retried: bool,
    session_epoch: u64,
    observed_credential: Option<AccessCredential>,
    sent_credential: Option<AccessCredential>,
}

impl CallContext {
    pub fn new() -> Self {
        Self::in_session(0)
    }

    /// Context for a call issued while the session is at `epoch`
    /// (see `SessionTerminator::epoch`).
    pub fn in_session(epoch: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            retried: false,
            session_epoch: epoch,
            observed_credential: None,
            sent_credential: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Retry marker: set once, never cleared.
    pub fn is_retried(&self) -> bool {
        self.retried
    }

    pub fn mark_retried(&mut self) {
        self.retried = true;
    }

    pub fn session_epoch(&self) -> u64 {
        self.session_epoch
    }

    /// Store content read on the most recent attempt, whether or not it
    /// could be attached.
    pub fn observed_credential(&self) -> Option<&AccessCredential> {
        self.observed_credential.as_ref()
    }

    /// Credential attached on the most recent attempt, if any.
    pub fn sent_credential(&self) -> Option<&AccessCredential> {
        self.sent_credential.as_ref()
    }
}

impl Default for CallContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Attaches `Authorization: Bearer <credential>` from the injected store.
#[derive(Clone)]
pub struct RequestInterceptor {
    credentials: Arc<dyn CredentialProvider>,
}

impl RequestInterceptor {
    pub fn new(credentials: Arc<dyn CredentialProvider>) -> Self {
        Self { credentials }
    }

    /// Decorate `request` for sending.
    ///
    /// Any caller-supplied Authorization header is dropped: the pipeline owns
    /// it. Without a credential the call goes out unauthenticated.
    pub fn apply(&self, request: &mut ApiRequest, ctx: &mut CallContext) {
        request.headers.remove(AUTHORIZATION);
        ctx.sent_credential = None;
        ctx.observed_credential = self.credentials.get();

        if let Some(credential) = &ctx.observed_credential {
            match HeaderValue::from_str(&format!("Bearer {}", credential.expose())) {
                Ok(mut value) => {
                    value.set_sensitive(true);
                    request.headers.insert(AUTHORIZATION, value);
                    ctx.sent_credential = Some(credential.clone());
                }
                Err(e) => {
                    warn!(call_id = %ctx.id, error = %e, "credential is not a valid header value, sending unauthenticated");
                }
            }
        }

        if let Ok(value) = HeaderValue::from_str(&ctx.id.to_string()) {
            request
                .headers
                .insert(HeaderName::from_static(REQUEST_ID_HEADER), value);
        }
    }
}
