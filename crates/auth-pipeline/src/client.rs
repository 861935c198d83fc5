//! Authenticated API client
//!
//! `AuthClient` wires the interceptor, classifier, coordinator, dispatcher
//! and session terminator into one `send()` path. Callers only ever see the
//! final outcome of a call: success (possibly after one transparent replay),
//! a pass-through failure, or a terminal session error raised after local
//! credential state has already been cleared.

use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use session::{
    AccessCredential, CredentialProvider, LogoutReason, SessionStatus, SessionTerminator,
};
use tokio::sync::watch;
use tracing::{debug, instrument, warn};
use transport::{ApiRequest, ApiResponse, Transport};

use crate::classify::{EndpointKind, FailureClass, classify};
use crate::coordinator::{RefreshCoordinator, RefreshState, Role, Settlement};
use crate::error::{Error, RefreshError, Result};
use crate::interceptor::{CallContext, RequestInterceptor};
use crate::retry::Dispatcher;

/// Default bound on a single refresh call.
pub const DEFAULT_REFRESH_TIMEOUT: Duration = Duration::from_secs(10);

/// Pipeline tuning.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub refresh_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            refresh_timeout: DEFAULT_REFRESH_TIMEOUT,
        }
    }
}

/// Backend client with transparent credential refresh.
///
/// Cheap to clone; clones share the credential store, coordinator and
/// session state.
#[derive(Clone)]
pub struct AuthClient {
    credentials: Arc<dyn CredentialProvider>,
    terminator: Arc<SessionTerminator>,
    coordinator: RefreshCoordinator,
    dispatcher: Dispatcher,
}

impl AuthClient {
    pub fn new(
        transport: Arc<dyn Transport>,
        credentials: Arc<dyn CredentialProvider>,
        config: PipelineConfig,
    ) -> Self {
        let terminator = Arc::new(SessionTerminator::new(credentials.clone()));
        let coordinator = RefreshCoordinator::new(
            transport.clone(),
            credentials.clone(),
            terminator.clone(),
            config.refresh_timeout,
        );
        let dispatcher = Dispatcher::new(transport, RequestInterceptor::new(credentials.clone()));
        Self {
            credentials,
            terminator,
            coordinator,
            dispatcher,
        }
    }

    /// Send a call; non-2xx responses become `Error::Status`.
    ///
    /// A call to the refresh endpoint is not sent directly: it runs (or
    /// joins) the coordinator's refresh and yields `204 No Content` once the
    /// new credential is in the store.
    #[instrument(skip_all, fields(method = %request.method, path = %request.route()))]
    pub async fn send(&self, request: ApiRequest) -> Result<ApiResponse> {
        let endpoint = EndpointKind::of(&request);
        if endpoint == EndpointKind::Refresh {
            self.restore_session().await?;
            return Ok(ApiResponse::new(StatusCode::NO_CONTENT, ""));
        }

        let mut ctx = CallContext::in_session(self.terminator.epoch());
        let response = self.dispatcher.dispatch(request.clone(), &mut ctx).await?;

        match classify(response.status.as_u16(), endpoint, ctx.is_retried()) {
            FailureClass::Propagate => into_result(response),
            FailureClass::Swallow => {
                debug!(call_id = %ctx.id(), "logout on unauthenticated session");
                Ok(response)
            }
            FailureClass::Terminal => {
                self.terminator.terminate(LogoutReason::RefreshFailed);
                Err(Error::RefreshFailed(RefreshError::Unauthorized {
                    status: response.status.as_u16(),
                    body: response.text(),
                }))
            }
            FailureClass::Refresh => self.recover(request, ctx, response).await,
        }
    }

    /// `GET path` and decode the JSON body.
    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self.send(ApiRequest::get(path)).await?;
        response
            .json()
            .map_err(|e| Error::Decode(format!("{path}: {e}")))
    }

    /// Refresh cycle for a call that received a 401: wait for (or run) the
    /// single refresh, then replay the call once.
    async fn recover(
        &self,
        request: ApiRequest,
        mut ctx: CallContext,
        original: ApiResponse,
    ) -> Result<ApiResponse> {
        let ticket = self.coordinator.handle_auth_failure(&ctx);
        let role = ticket.role();

        match ticket.settled().await {
            Settlement::Refreshed => {
                let endpoint = EndpointKind::of(&request);
                let response = self.dispatcher.replay(request, &mut ctx).await?;
                if classify(response.status.as_u16(), endpoint, ctx.is_retried())
                    != FailureClass::Propagate
                {
                    warn!(call_id = %ctx.id(), "unexpected classification for replayed call");
                }
                into_result(response)
            }
            Settlement::Failed(err) => match role {
                Role::Issuer => Err(Error::RefreshFailed(err)),
                Role::Waiter => {
                    debug!(call_id = %ctx.id(), error = %err, "refresh failed, rejecting queued call");
                    into_result(original)
                }
            },
        }
    }

    /// Hand over a credential from the login surface and mark the session
    /// active.
    pub fn login(&self, credential: AccessCredential) {
        self.terminator.activate(credential);
    }

    /// Obtain an access credential from the ambient session cookie.
    ///
    /// Joins an in-flight refresh if there is one.
    pub async fn restore_session(&self) -> Result<()> {
        match self.coordinator.refresh_now().settled().await {
            Settlement::Refreshed => Ok(()),
            Settlement::Failed(err) => Err(Error::RefreshFailed(err)),
        }
    }

    /// End the session on the backend and locally.
    ///
    /// A 401 from the logout endpoint means the session was already gone and
    /// is not an error. Local cleanup happens whatever the backend answers.
    #[instrument(skip_all)]
    pub async fn logout(&self) -> Result<()> {
        let request = session::logout_request();
        let endpoint = EndpointKind::of(&request);
        let mut ctx = CallContext::in_session(self.terminator.epoch());

        let outcome = match self.dispatcher.dispatch(request, &mut ctx).await {
            Ok(response) => match classify(response.status.as_u16(), endpoint, false) {
                FailureClass::Swallow => {
                    debug!("backend session already gone");
                    Ok(())
                }
                _ => into_result(response).map(|_| ()),
            },
            Err(e) => Err(Error::Transport(e)),
        };
        if let Err(e) = &outcome {
            warn!(error = %e, "logout request failed, clearing local session anyway");
        }

        self.coordinator.reset();
        self.terminator.terminate(LogoutReason::UserLogout);
        outcome
    }

    /// Subscribe to session status changes (logged in / logged out).
    pub fn session_events(&self) -> watch::Receiver<SessionStatus> {
        self.terminator.subscribe()
    }

    pub fn session_status(&self) -> SessionStatus {
        self.terminator.status()
    }

    pub fn refresh_state(&self) -> RefreshState {
        self.coordinator.state()
    }

    pub fn credentials(&self) -> &Arc<dyn CredentialProvider> {
        &self.credentials
    }
}

fn into_result(response: ApiResponse) -> Result<ApiResponse> {
    if response.is_success() {
        Ok(response)
    } else {
        Err(Error::Status {
            status: response.status.as_u16(),
            body: response.text(),
        })
    }
}
