//! Session teardown and the upstream logged-out signal
//!
//! `SessionTerminator` is the only place that moves the session to
//! `LoggedOut`. It clears the credential store first and then publishes the
//! new status on a `watch` channel, so any subscriber that reacts to the
//! signal already observes an empty store.
//!
//! Transitions:
//! - Active → LoggedOut (refresh rejected, refresh timed out, explicit logout)
//! - LoggedOut → Active (login surface supplies a new credential)
//! - LoggedOut → LoggedOut is a no-op: repeated or concurrent terminations
//!   produce a single notification.
//!
//! Every termination also advances the session epoch. A refreshed credential
//! is only installed through `renew` with the epoch its refresh started in,
//! so a refresh that outlives a teardown cannot revive the session.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::credentials::{AccessCredential, CredentialProvider};

/// Why the session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogoutReason {
    /// The refresh endpoint rejected the session or could not be reached
    RefreshFailed,
    /// Explicit logout request from outside the pipeline
    UserLogout,
}

impl LogoutReason {
    /// Label for logging and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            LogoutReason::RefreshFailed => "refresh_failed",
            LogoutReason::UserLogout => "user_logout",
        }
    }
}

/// Session state as seen by UI layers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionStatus {
    Active,
    LoggedOut { reason: LogoutReason },
}

/// Clears credential state and signals logout exactly once per session.
pub struct SessionTerminator {
    credentials: Arc<dyn CredentialProvider>,
    status: watch::Sender<SessionStatus>,
    /// Held for the whole of `activate`, `renew` and `terminate`.
    epoch: Mutex<u64>,
}

impl SessionTerminator {
    pub fn new(credentials: Arc<dyn CredentialProvider>) -> Self {
        let (status, _) = watch::channel(SessionStatus::Active);
        Self {
            credentials,
            status,
            epoch: Mutex::new(0),
        }
    }

    fn lock_epoch(&self) -> MutexGuard<'_, u64> {
        self.epoch.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of terminations so far.
    pub fn epoch(&self) -> u64 {
        *self.lock_epoch()
    }

    /// Store a credential from the login surface and mark the session active.
    pub fn activate(&self, credential: AccessCredential) {
        let _epoch = self.lock_epoch();
        self.install(credential);
    }

    /// Store a refreshed credential, unless the session was terminated since
    /// `epoch`. Returns whether the credential was installed.
    pub fn renew(&self, epoch: u64, credential: AccessCredential) -> bool {
        let current = self.lock_epoch();
        if *current != epoch {
            debug!(epoch, current = *current, "session ended during refresh, dropping credential");
            return false;
        }
        self.install(credential);
        true
    }

    fn install(&self, credential: AccessCredential) {
        self.credentials.set(credential);
        let changed = self.status.send_if_modified(|status| {
            if *status == SessionStatus::Active {
                false
            } else {
                *status = SessionStatus::Active;
                true
            }
        });
        if changed {
            info!("session active");
        }
    }

    /// Tear down the session.
    ///
    /// Always clears the credential store. Returns `true` only for the call
    /// that performed the Active → LoggedOut transition.
    pub fn terminate(&self, reason: LogoutReason) -> bool {
        let mut epoch = self.lock_epoch();
        *epoch += 1;
        self.credentials.clear();

        let transitioned = self.status.send_if_modified(|status| match status {
            SessionStatus::Active => {
                *status = SessionStatus::LoggedOut { reason };
                true
            }
            SessionStatus::LoggedOut { .. } => false,
        });

        if transitioned {
            warn!(reason = reason.label(), "session terminated");
            metrics::counter!("auth_session_terminations_total", "reason" => reason.label())
                .increment(1);
        }
        transitioned
    }

    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    /// Subscribe to session status changes.
    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.status.subscribe()
    }
}
