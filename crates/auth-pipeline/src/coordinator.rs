//! Single-flight credential refresh
//!
//! The coordinator owns the IDLE/REFRESHING state and the queue of callers
//! waiting on the refresh outcome. Deciding whether a caller issues the
//! refresh or queues behind it is a check-and-set under a synchronous lock
//! that is never held across an `.await`, so two callers can never both see
//! IDLE and both start a refresh.
//!
//! Transitions:
//! - Idle → Refreshing (first 401 on an ordinary call, or `refresh_now`)
//! - Refreshing → Refreshing (further 401s join the waiter queue)
//! - Refreshing → Idle (refresh settled: store updated or session terminated,
//!   then every waiter settled)
//! - any → Idle (`reset`, waiters rejected as cancelled)
//!
//! The refresh call runs on its own task, bounded by a timeout. A drop guard
//! on that task settles the queue even if the task is torn down early, so no
//! waiter can be stranded.
//!
//! A 401 on a call dispatched before the session was terminated is settled
//! as cancelled without refreshing, and a refresh that completes after a
//! termination is discarded, so a terminated session stays terminated.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use session::{AccessCredential, CredentialProvider, LogoutReason, SessionTerminator};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use transport::Transport;
use uuid::Uuid;

use crate::error::RefreshError;
use crate::interceptor::CallContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshState {
    Idle,
    Refreshing,
}

impl RefreshState {
    pub fn label(&self) -> &'static str {
        match self {
            RefreshState::Idle => "idle",
            RefreshState::Refreshing => "refreshing",
        }
    }
}

/// Outcome delivered to every caller of one refresh cycle.
#[derive(Debug, Clone)]
pub enum Settlement {
    /// A new credential is in the store; replay the call
    Refreshed,
    /// No new credential; the session has been terminated
    Failed(RefreshError),
}

/// Whether a caller started the refresh or joined one already in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Issuer,
    Waiter,
}

/// A caller's handle on the refresh outcome.
#[derive(Debug)]
pub struct RefreshTicket {
    role: Role,
    call_id: Uuid,
    rx: oneshot::Receiver<Settlement>,
}

impl RefreshTicket {
    pub fn role(&self) -> Role {
        self.role
    }

    pub fn call_id(&self) -> Uuid {
        self.call_id
    }

    /// Suspend until the refresh cycle settles.
    ///
    /// A sender dropped without settling reads as `Cancelled`.
    pub async fn settled(self) -> Settlement {
        self.rx
            .await
            .unwrap_or(Settlement::Failed(RefreshError::Cancelled))
    }
}

/// Queued caller. Settling consumes it, so it can be settled at most once.
struct Waiter {
    call_id: Uuid,
    tx: oneshot::Sender<Settlement>,
}

impl Waiter {
    fn settle(self, settlement: Settlement) {
        let Waiter { call_id, tx } = self;
        if tx.send(settlement).is_err() {
            debug!(%call_id, "caller went away before refresh settled");
        }
    }
}

struct Queue {
    state: RefreshState,
    /// Bumped on every refresh start and every reset; a refresh task only
    /// settles the queue if its generation is still current.
    generation: u64,
    waiters: Vec<Waiter>,
}

struct Shared {
    queue: Mutex<Queue>,
    transport: Arc<dyn Transport>,
    credentials: Arc<dyn CredentialProvider>,
    terminator: Arc<SessionTerminator>,
    timeout: Duration,
}

impl Shared {
    fn queue(&self) -> MutexGuard<'_, Queue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// True when the store already holds a different credential than the
    /// one it held when the failed call was dispatched.
    fn is_stale(&self, observed: Option<&AccessCredential>) -> bool {
        match (self.credentials.get(), observed) {
            (Some(current), Some(observed)) => current != *observed,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }

    /// Apply a refresh outcome, return to Idle, and settle every waiter.
    ///
    /// `epoch` is the session epoch the refresh started in; a credential
    /// obtained after the session was terminated is dropped and the cycle
    /// settles as cancelled.
    fn complete(
        &self,
        generation: u64,
        epoch: u64,
        outcome: Result<AccessCredential, RefreshError>,
    ) {
        let (outcome, waiters) = {
            let mut queue = self.queue();
            if queue.generation != generation {
                debug!(generation, "refresh superseded by reset, discarding outcome");
                return;
            }
            let outcome = match outcome {
                Ok(credential) => {
                    if self.terminator.renew(epoch, credential) {
                        Ok(())
                    } else {
                        Err(RefreshError::Cancelled)
                    }
                }
                Err(RefreshError::Cancelled) => Err(RefreshError::Cancelled),
                Err(err) => {
                    self.terminator.terminate(LogoutReason::RefreshFailed);
                    Err(err)
                }
            };
            queue.state = RefreshState::Idle;
            (outcome, std::mem::take(&mut queue.waiters))
        };

        let settlement = match outcome {
            Ok(_) => {
                info!(waiters = waiters.len(), "access credential refreshed");
                metrics::counter!("auth_refresh_total", "outcome" => "success").increment(1);
                Settlement::Refreshed
            }
            Err(err) => {
                warn!(waiters = waiters.len(), error = %err, "credential refresh failed");
                let outcome = match err {
                    RefreshError::Timeout(_) => "timeout",
                    RefreshError::Cancelled => "cancelled",
                    _ => "failure",
                };
                metrics::counter!("auth_refresh_total", "outcome" => outcome).increment(1);
                Settlement::Failed(err)
            }
        };

        for waiter in waiters {
            waiter.settle(settlement.clone());
        }
    }
}

/// Settles the queue as cancelled if the refresh task ends without an outcome.
struct SettleOnDrop {
    shared: Arc<Shared>,
    generation: u64,
    epoch: u64,
    armed: bool,
}

impl SettleOnDrop {
    fn finish(mut self, outcome: Result<AccessCredential, RefreshError>) {
        self.armed = false;
        self.shared.complete(self.generation, self.epoch, outcome);
    }
}

impl Drop for SettleOnDrop {
    fn drop(&mut self) {
        if self.armed {
            self.shared
                .complete(self.generation, self.epoch, Err(RefreshError::Cancelled));
        }
    }
}

/// Ensures at most one refresh call is in flight per client.
#[derive(Clone)]
pub struct RefreshCoordinator {
    shared: Arc<Shared>,
}

impl RefreshCoordinator {
    pub fn new(
        transport: Arc<dyn Transport>,
        credentials: Arc<dyn CredentialProvider>,
        terminator: Arc<SessionTerminator>,
        timeout: Duration,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                queue: Mutex::new(Queue {
                    state: RefreshState::Idle,
                    generation: 0,
                    waiters: Vec::new(),
                }),
                transport,
                credentials,
                terminator,
                timeout,
            }),
        }
    }

    pub fn state(&self) -> RefreshState {
        self.shared.queue().state
    }

    /// Callers currently suspended on the in-flight refresh.
    pub fn pending_waiters(&self) -> usize {
        self.shared.queue().waiters.len()
    }

    /// Enter the refresh cycle for a call that received a 401.
    ///
    /// If the store already moved past the credential it held when the call
    /// was dispatched, the ticket resolves to `Refreshed` immediately without
    /// issuing another refresh. If the session was terminated since dispatch,
    /// it resolves to `Failed(Cancelled)`. Must be called from within a
    /// Tokio runtime.
    pub fn handle_auth_failure(&self, ctx: &CallContext) -> RefreshTicket {
        self.enqueue(ctx.id(), Some(ctx))
    }

    /// Refresh regardless of the held credential (startup bootstrap).
    pub fn refresh_now(&self) -> RefreshTicket {
        self.enqueue(Uuid::new_v4(), None)
    }

    /// Return to Idle and reject queued callers as cancelled. An in-flight
    /// refresh keeps running but its outcome is discarded.
    pub fn reset(&self) {
        let waiters = {
            let mut queue = self.shared.queue();
            queue.generation += 1;
            queue.state = RefreshState::Idle;
            std::mem::take(&mut queue.waiters)
        };
        if !waiters.is_empty() {
            debug!(waiters = waiters.len(), "coordinator reset, rejecting waiters");
        }
        for waiter in waiters {
            waiter.settle(Settlement::Failed(RefreshError::Cancelled));
        }
    }

    /// `origin` is `None` to force a refresh, or the failed call's context
    /// to apply the session and stale credential checks.
    fn enqueue(&self, call_id: Uuid, origin: Option<&CallContext>) -> RefreshTicket {
        let (tx, rx) = oneshot::channel();
        let waiter = Waiter { call_id, tx };

        let epoch = self.shared.terminator.epoch();
        if origin.is_some_and(|ctx| ctx.session_epoch() != epoch) {
            debug!(%call_id, "session ended since dispatch, not refreshing");
            waiter.settle(Settlement::Failed(RefreshError::Cancelled));
            return RefreshTicket {
                role: Role::Waiter,
                call_id,
                rx,
            };
        }

        let mut queue = self.shared.queue();
        match queue.state {
            RefreshState::Refreshing => {
                queue.waiters.push(waiter);
                debug!(%call_id, waiters = queue.waiters.len(), "refresh in flight, queued");
                metrics::counter!("auth_refresh_waiters_total").increment(1);
                RefreshTicket {
                    role: Role::Waiter,
                    call_id,
                    rx,
                }
            }
            RefreshState::Idle => {
                if origin.is_some_and(|ctx| self.shared.is_stale(ctx.observed_credential())) {
                    drop(queue);
                    debug!(%call_id, "credential changed since dispatch, replaying without refresh");
                    waiter.settle(Settlement::Refreshed);
                    return RefreshTicket {
                        role: Role::Waiter,
                        call_id,
                        rx,
                    };
                }

                queue.state = RefreshState::Refreshing;
                queue.generation += 1;
                let generation = queue.generation;
                queue.waiters.push(waiter);
                drop(queue);

                info!(%call_id, "access credential expired, refreshing");
                self.spawn_refresh(generation, epoch);
                RefreshTicket {
                    role: Role::Issuer,
                    call_id,
                    rx,
                }
            }
        }
    }

    fn spawn_refresh(&self, generation: u64, epoch: u64) {
        let shared = self.shared.clone();
        tokio::spawn(async move {
            let guard = SettleOnDrop {
                shared: shared.clone(),
                generation,
                epoch,
                armed: true,
            };
            let outcome = request_credential(&shared).await;
            guard.finish(outcome);
        });
    }
}

/// One bounded call to the refresh endpoint.
async fn request_credential(shared: &Shared) -> Result<AccessCredential, RefreshError> {
    match tokio::time::timeout(
        shared.timeout,
        session::refresh_access_token(shared.transport.as_ref()),
    )
    .await
    {
        Ok(result) => result.map_err(RefreshError::from),
        Err(_) => Err(RefreshError::Timeout(shared.timeout)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interceptor::RequestInterceptor;
    use crate::testing::{FakeBackend, RefreshMode};
    use session::{MemoryCredentialStore, SessionStatus};
    use transport::{ApiRequest, TransportError};

    struct Harness {
        backend: Arc<FakeBackend>,
        store: Arc<MemoryCredentialStore>,
        terminator: Arc<SessionTerminator>,
        coordinator: RefreshCoordinator,
    }

    fn harness(backend: FakeBackend, token: &str, timeout: Duration) -> Harness {
        let backend = Arc::new(backend);
        let store = Arc::new(MemoryCredentialStore::with_credential(AccessCredential::new(
            token,
        )));
        let terminator = Arc::new(SessionTerminator::new(store.clone()));
        let coordinator =
            RefreshCoordinator::new(backend.clone(), store.clone(), terminator.clone(), timeout);
        Harness {
            backend,
            store,
            terminator,
            coordinator,
        }
    }

    /// Context for a call sent with whatever the store currently holds.
    fn sent_ctx(store: &Arc<MemoryCredentialStore>) -> CallContext {
        let interceptor = RequestInterceptor::new(store.clone());
        let mut ctx = CallContext::new();
        interceptor.apply(&mut ApiRequest::get("/api/v1/locations"), &mut ctx);
        ctx
    }

    async fn wait_for_refresh_calls(backend: &FakeBackend, n: usize) {
        while backend.refresh_calls() < n {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn concurrent_failures_issue_one_refresh() {
        let h = harness(
            FakeBackend::new("T1")
                .with_refresh(RefreshMode::Issue("T2".into()))
                .gated(),
            "T1",
            Duration::from_secs(10),
        );

        let tickets: Vec<_> = (0..5)
            .map(|_| h.coordinator.handle_auth_failure(&sent_ctx(&h.store)))
            .collect();

        assert_eq!(tickets[0].role(), Role::Issuer);
        assert!(tickets[1..].iter().all(|t| t.role() == Role::Waiter));
        assert_eq!(h.coordinator.state(), RefreshState::Refreshing);
        assert_eq!(h.coordinator.pending_waiters(), 5);

        wait_for_refresh_calls(&h.backend, 1).await;
        h.backend.open_gate();

        for ticket in tickets {
            assert!(matches!(ticket.settled().await, Settlement::Refreshed));
        }
        assert_eq!(h.backend.refresh_calls(), 1);
        assert_eq!(h.store.get().unwrap().expose(), "T2");
        assert_eq!(h.coordinator.state(), RefreshState::Idle);
        assert_eq!(h.coordinator.pending_waiters(), 0);
    }

    #[tokio::test]
    async fn rejected_refresh_fails_every_waiter_and_terminates() {
        let h = harness(
            FakeBackend::new("T1").with_refresh(RefreshMode::Reject).gated(),
            "T1",
            Duration::from_secs(10),
        );
        let mut status = h.terminator.subscribe();

        let tickets: Vec<_> = (0..3)
            .map(|_| h.coordinator.handle_auth_failure(&sent_ctx(&h.store)))
            .collect();
        wait_for_refresh_calls(&h.backend, 1).await;
        h.backend.open_gate();

        for ticket in tickets {
            match ticket.settled().await {
                Settlement::Failed(RefreshError::Unauthorized { status: code, .. }) => {
                    assert_eq!(code, 401)
                }
                other => panic!("expected unauthorized failure, got {other:?}"),
            }
        }
        assert_eq!(h.backend.refresh_calls(), 1);
        assert!(h.store.get().is_none());
        assert!(status.has_changed().unwrap());
        assert_eq!(
            *status.borrow_and_update(),
            SessionStatus::LoggedOut {
                reason: LogoutReason::RefreshFailed
            }
        );
        assert_eq!(h.coordinator.state(), RefreshState::Idle);
    }

    /// Three queued callers against a failing refresh: all rejected, store
    /// cleared, one `LoggedOut{RefreshFailed}` published.
    async fn assert_failed_refresh_terminates(
        mode: RefreshMode,
        expected: fn(&RefreshError) -> bool,
    ) {
        let h = harness(
            FakeBackend::new("T1").with_refresh(mode).gated(),
            "T1",
            Duration::from_secs(10),
        );
        let mut status = h.terminator.subscribe();

        let tickets: Vec<_> = (0..3)
            .map(|_| h.coordinator.handle_auth_failure(&sent_ctx(&h.store)))
            .collect();
        assert_eq!(h.coordinator.pending_waiters(), 3);
        wait_for_refresh_calls(&h.backend, 1).await;
        h.backend.open_gate();

        for ticket in tickets {
            match ticket.settled().await {
                Settlement::Failed(err) => assert!(expected(&err), "unexpected error: {err:?}"),
                Settlement::Refreshed => panic!("refresh should have failed"),
            }
        }
        assert_eq!(h.backend.refresh_calls(), 1);
        assert!(h.store.get().is_none());
        assert!(status.has_changed().unwrap());
        assert_eq!(
            *status.borrow_and_update(),
            SessionStatus::LoggedOut {
                reason: LogoutReason::RefreshFailed
            }
        );
        assert_eq!(h.coordinator.state(), RefreshState::Idle);
    }

    #[tokio::test]
    async fn server_error_on_refresh_terminates_session() {
        assert_failed_refresh_terminates(RefreshMode::Fail(500), |err| {
            matches!(err, RefreshError::Status { status: 500, .. })
        })
        .await;
    }

    #[tokio::test]
    async fn transport_error_on_refresh_terminates_session() {
        assert_failed_refresh_terminates(RefreshMode::Unreachable, |err| {
            matches!(err, RefreshError::Transport(TransportError::Connect(_)))
        })
        .await;
    }

    #[tokio::test]
    async fn failure_after_termination_is_cancelled_without_refresh() {
        let h = harness(FakeBackend::new("T1"), "T1", Duration::from_secs(10));
        let ctx = sent_ctx(&h.store);
        h.terminator.terminate(LogoutReason::UserLogout);

        let ticket = h.coordinator.handle_auth_failure(&ctx);
        assert_eq!(ticket.role(), Role::Waiter);
        assert!(matches!(
            ticket.settled().await,
            Settlement::Failed(RefreshError::Cancelled)
        ));
        assert_eq!(h.backend.refresh_calls(), 0);
        assert_eq!(h.coordinator.state(), RefreshState::Idle);
        assert!(h.store.get().is_none());
    }

    #[tokio::test]
    async fn refresh_finishing_after_termination_is_discarded() {
        let h = harness(
            FakeBackend::new("T1")
                .with_refresh(RefreshMode::Issue("T2".into()))
                .gated(),
            "T1",
            Duration::from_secs(10),
        );
        let ticket = h.coordinator.handle_auth_failure(&sent_ctx(&h.store));
        wait_for_refresh_calls(&h.backend, 1).await;

        h.terminator.terminate(LogoutReason::UserLogout);
        h.backend.open_gate();

        assert!(matches!(
            ticket.settled().await,
            Settlement::Failed(RefreshError::Cancelled)
        ));
        assert!(h.store.get().is_none());
        assert_eq!(
            h.terminator.status(),
            SessionStatus::LoggedOut {
                reason: LogoutReason::UserLogout
            }
        );
        assert_eq!(h.coordinator.state(), RefreshState::Idle);
    }

    #[tokio::test]
    async fn unencodable_credential_is_not_treated_as_stale() {
        let h = harness(
            FakeBackend::new("T1").with_refresh(RefreshMode::Issue("T2".into())),
            "bad\ntoken",
            Duration::from_secs(10),
        );
        let ctx = sent_ctx(&h.store);
        assert!(ctx.sent_credential().is_none());

        let ticket = h.coordinator.handle_auth_failure(&ctx);
        assert_eq!(ticket.role(), Role::Issuer);
        assert!(matches!(ticket.settled().await, Settlement::Refreshed));
        assert_eq!(h.backend.refresh_calls(), 1);
        assert_eq!(h.store.get().unwrap().expose(), "T2");
    }

    #[tokio::test(start_paused = true)]
    async fn hung_refresh_times_out_as_failure() {
        let h = harness(
            FakeBackend::new("T1").with_refresh(RefreshMode::Hang),
            "T1",
            Duration::from_secs(10),
        );

        let issuer = h.coordinator.handle_auth_failure(&sent_ctx(&h.store));
        let waiter = h.coordinator.handle_auth_failure(&sent_ctx(&h.store));

        assert!(matches!(
            issuer.settled().await,
            Settlement::Failed(RefreshError::Timeout(_))
        ));
        assert!(matches!(
            waiter.settled().await,
            Settlement::Failed(RefreshError::Timeout(_))
        ));
        assert!(h.store.get().is_none());
        assert!(matches!(
            h.terminator.status(),
            SessionStatus::LoggedOut { .. }
        ));
    }

    #[tokio::test]
    async fn malformed_refresh_response_is_failure() {
        let h = harness(
            FakeBackend::new("T1").with_refresh(RefreshMode::Malformed),
            "T1",
            Duration::from_secs(10),
        );
        let ticket = h.coordinator.handle_auth_failure(&sent_ctx(&h.store));
        assert!(matches!(
            ticket.settled().await,
            Settlement::Failed(RefreshError::InvalidResponse(_))
        ));
        assert!(h.store.get().is_none());
    }

    #[tokio::test]
    async fn stale_credential_skips_refresh() {
        let h = harness(FakeBackend::new("T2"), "T1", Duration::from_secs(10));
        let ctx = sent_ctx(&h.store);
        h.store.set(AccessCredential::new("T2"));

        let ticket = h.coordinator.handle_auth_failure(&ctx);
        assert_eq!(ticket.role(), Role::Waiter);
        assert!(matches!(ticket.settled().await, Settlement::Refreshed));
        assert_eq!(h.backend.refresh_calls(), 0);
        assert_eq!(h.coordinator.state(), RefreshState::Idle);
    }

    #[tokio::test]
    async fn unauthenticated_call_refreshes_when_store_empty() {
        let h = harness(
            FakeBackend::new("T1").with_refresh(RefreshMode::Issue("T9".into())),
            "T1",
            Duration::from_secs(10),
        );
        h.store.clear();
        let ticket = h.coordinator.handle_auth_failure(&sent_ctx(&h.store));
        assert_eq!(ticket.role(), Role::Issuer);
        assert!(matches!(ticket.settled().await, Settlement::Refreshed));
        assert_eq!(h.store.get().unwrap().expose(), "T9");
    }

    #[tokio::test]
    async fn reset_rejects_waiters_and_discards_late_outcome() {
        let h = harness(
            FakeBackend::new("T1")
                .with_refresh(RefreshMode::Issue("T2".into()))
                .gated(),
            "T1",
            Duration::from_secs(10),
        );
        let first = h.coordinator.handle_auth_failure(&sent_ctx(&h.store));
        let second = h.coordinator.handle_auth_failure(&sent_ctx(&h.store));
        wait_for_refresh_calls(&h.backend, 1).await;

        h.coordinator.reset();
        assert_eq!(h.coordinator.state(), RefreshState::Idle);
        assert!(matches!(
            first.settled().await,
            Settlement::Failed(RefreshError::Cancelled)
        ));
        assert!(matches!(
            second.settled().await,
            Settlement::Failed(RefreshError::Cancelled)
        ));

        h.backend.open_gate();
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }
        assert_eq!(h.store.get().unwrap().expose(), "T1");
        assert_eq!(h.terminator.status(), SessionStatus::Active);
    }

    #[tokio::test]
    async fn settled_coordinator_accepts_next_cycle() {
        let h = harness(
            FakeBackend::new("T1").with_refresh(RefreshMode::Issue("T2".into())),
            "T1",
            Duration::from_secs(10),
        );
        let ticket = h.coordinator.handle_auth_failure(&sent_ctx(&h.store));
        assert!(matches!(ticket.settled().await, Settlement::Refreshed));

        let ticket = h.coordinator.refresh_now();
        assert_eq!(ticket.role(), Role::Issuer);
        assert!(matches!(ticket.settled().await, Settlement::Refreshed));
        assert_eq!(h.backend.refresh_calls(), 2);
    }
}
