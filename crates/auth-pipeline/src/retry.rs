//! Call dispatch and one-shot replay
//!
//! Every attempt, first or replay, goes through the interceptor so the
//! credential attached is the one current at send time. The replay sends the
//! exact original request (method, path, headers, body) and its outcome is
//! returned to the caller untouched.

use std::sync::Arc;

use tracing::debug;
use transport::{ApiRequest, ApiResponse, Transport};

use crate::interceptor::{CallContext, RequestInterceptor};

/// Sends calls through the interceptor and transport.
#[derive(Clone)]
pub struct Dispatcher {
    transport: Arc<dyn Transport>,
    interceptor: RequestInterceptor,
}

impl Dispatcher {
    pub fn new(transport: Arc<dyn Transport>, interceptor: RequestInterceptor) -> Self {
        Self {
            transport,
            interceptor,
        }
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Decorate and send one attempt.
    pub async fn dispatch(
        &self,
        mut request: ApiRequest,
        ctx: &mut CallContext,
    ) -> transport::Result<ApiResponse> {
        self.interceptor.apply(&mut request, ctx);
        debug!(
            call_id = %ctx.id(),
            method = %request.method,
            path = request.route(),
            authenticated = ctx.sent_credential().is_some(),
            retried = ctx.is_retried(),
            "dispatching call"
        );
        self.transport.send(request).await
    }

    /// Replay `request` after a successful refresh.
    ///
    /// Sets the retry marker before sending; a call that already carries it
    /// must never reach this point again.
    pub async fn replay(
        &self,
        request: ApiRequest,
        ctx: &mut CallContext,
    ) -> transport::Result<ApiResponse> {
        ctx.mark_retried();
        metrics::counter!("auth_retries_total").increment(1);
        debug!(call_id = %ctx.id(), "replaying call with refreshed credential");
        self.dispatch(request, ctx).await
    }
}
