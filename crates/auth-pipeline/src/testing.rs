//! Scripted in-memory backend for pipeline tests.

use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use bytes::Bytes;
use reqwest::StatusCode;
use reqwest::header::AUTHORIZATION;
use session::{LOGOUT_PATH, REFRESH_PATH};
use tokio::sync::Semaphore;
use transport::{ApiRequest, ApiResponse, Transport, TransportError};

use crate::interceptor::REQUEST_ID_HEADER;

/// How the fake refresh endpoint answers.
#[derive(Debug, Clone)]
pub(crate) enum RefreshMode {
    /// 200 with this token; ordinary calls then accept it
    Issue(String),
    /// 401 from the refresh endpoint
    Reject,
    /// Arbitrary non-2xx status
    Fail(u16),
    /// 200 with a body that is not a token response
    Malformed,
    /// Never answers
    Hang,
    /// Refresh request fails at the transport
    Unreachable,
}

#[derive(Debug, Clone)]
pub(crate) struct RecordedCall {
    pub method: String,
    pub path: String,
    pub authorization: Option<String>,
    pub request_id: Option<String>,
    pub body: Option<Bytes>,
}

/// Accepts ordinary calls only with `Bearer <valid token>`.
pub(crate) struct FakeBackend {
    valid: Mutex<String>,
    refresh_mode: Mutex<RefreshMode>,
    refresh_gate: Option<Semaphore>,
    reject_all: AtomicBool,
    transport_down: AtomicBool,
    logout_status: Mutex<u16>,
    refresh_calls: AtomicUsize,
    calls: Mutex<Vec<RecordedCall>>,
}

impl FakeBackend {
    pub fn new(valid_token: &str) -> Self {
        Self {
            valid: Mutex::new(valid_token.to_string()),
            refresh_mode: Mutex::new(RefreshMode::Issue(valid_token.to_string())),
            refresh_gate: None,
            reject_all: AtomicBool::new(false),
            transport_down: AtomicBool::new(false),
            logout_status: Mutex::new(204),
            refresh_calls: AtomicUsize::new(0),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_refresh(self, mode: RefreshMode) -> Self {
        *self.refresh_mode.lock().unwrap() = mode;
        self
    }

    /// Hold refresh responses until `open_gate()`.
    pub fn gated(mut self) -> Self {
        self.refresh_gate = Some(Semaphore::new(0));
        self
    }

    pub fn open_gate(&self) {
        if let Some(gate) = &self.refresh_gate {
            gate.add_permits(1024);
        }
    }

    pub fn reject_all(&self) {
        self.reject_all.store(true, Ordering::SeqCst);
    }

    pub fn take_transport_down(&self) {
        self.transport_down.store(true, Ordering::SeqCst);
    }

    pub fn set_logout_status(&self, status: u16) {
        *self.logout_status.lock().unwrap() = status;
    }

    pub fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Ordinary (non-session) calls received so far.
    pub fn ordinary_calls(&self) -> Vec<RecordedCall> {
        self.calls()
            .into_iter()
            .filter(|c| c.path != REFRESH_PATH && c.path != LOGOUT_PATH)
            .collect()
    }

    async fn handle(&self, request: ApiRequest) -> transport::Result<ApiResponse> {
        let authorization = request
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        self.calls.lock().unwrap().push(RecordedCall {
            method: request.method.to_string(),
            path: request.path.clone(),
            authorization: authorization.clone(),
            request_id: request
                .headers
                .get(REQUEST_ID_HEADER)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
            body: request.body.clone(),
        });

        match request.route() {
            REFRESH_PATH => self.refresh().await,
            LOGOUT_PATH => {
                let status = *self.logout_status.lock().unwrap();
                Ok(ApiResponse::new(status_of(status), ""))
            }
            _ => {
                if self.transport_down.load(Ordering::SeqCst) {
                    return Err(TransportError::Connect("connection refused".into()));
                }
                let expected = format!("Bearer {}", self.valid.lock().unwrap());
                if self.reject_all.load(Ordering::SeqCst)
                    || authorization.as_deref() != Some(expected.as_str())
                {
                    return Ok(ApiResponse::new(StatusCode::UNAUTHORIZED, "token expired"));
                }
                Ok(ApiResponse::new(
                    StatusCode::OK,
                    format!(r#"{{"path":"{}"}}"#, request.path),
                ))
            }
        }
    }

    async fn refresh(&self) -> transport::Result<ApiResponse> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.refresh_gate {
            gate.acquire().await.unwrap().forget();
        }

        let mode = self.refresh_mode.lock().unwrap().clone();
        match mode {
            RefreshMode::Issue(token) => {
                *self.valid.lock().unwrap() = token.clone();
                Ok(ApiResponse::new(
                    StatusCode::OK,
                    format!(r#"{{"accessToken":"{token}"}}"#),
                ))
            }
            RefreshMode::Reject => Ok(ApiResponse::new(
                StatusCode::UNAUTHORIZED,
                "refresh cookie revoked",
            )),
            RefreshMode::Fail(status) => Ok(ApiResponse::new(status_of(status), "unavailable")),
            RefreshMode::Malformed => Ok(ApiResponse::new(StatusCode::OK, "<html>")),
            RefreshMode::Hang => std::future::pending().await,
            RefreshMode::Unreachable => {
                Err(TransportError::Connect("connection refused".into()))
            }
        }
    }
}

impl Transport for FakeBackend {
    fn send(
        &self,
        request: ApiRequest,
    ) -> Pin<Box<dyn Future<Output = transport::Result<ApiResponse>> + Send + '_>> {
        Box::pin(self.handle(request))
    }
}

fn status_of(code: u16) -> StatusCode {
    StatusCode::from_u16(code).unwrap()
}
