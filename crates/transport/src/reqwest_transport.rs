//! Production transport backed by `reqwest`.
//!
//! The client keeps a cookie jar so the long-lived refresh cookie travels
//! with every call automatically, the same way a browser would send it.
//! The pipeline never reads or writes that cookie itself.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use common::Secret;
use reqwest::Url;
use reqwest::cookie::Jar;
use tracing::{debug, instrument};

use crate::{ApiRequest, ApiResponse, Result, Transport, TransportError};

/// Long-lived session cookie seeded into the jar at startup.
#[derive(Debug, Clone)]
pub struct RefreshCookie {
    pub name: String,
    pub value: Secret<String>,
}

/// `Transport` over a shared `reqwest::Client`.
pub struct ReqwestTransport {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl ReqwestTransport {
    /// Build a transport with its own cookie jar.
    ///
    /// `base_url` must be an absolute http(s) URL; request paths are appended
    /// to it verbatim.
    pub fn new(base_url: &str, timeout: Duration, cookie: Option<&RefreshCookie>) -> Result<Self> {
        let parsed = Url::parse(base_url)
            .map_err(|e| TransportError::InvalidUrl(format!("{base_url}: {e}")))?;

        let jar = Arc::new(Jar::default());
        if let Some(cookie) = cookie {
            jar.add_cookie_str(
                &format!("{}={}; Path=/", cookie.name, cookie.value.expose()),
                &parsed,
            );
            debug!(cookie = %cookie.name, "seeded refresh cookie");
        }

        let client = reqwest::Client::builder()
            .cookie_provider(jar)
            .build()
            .map_err(|e| TransportError::Other(format!("building http client: {e}")))?;

        Ok(Self::with_client(client, base_url, timeout))
    }

    /// Wrap an existing client (shares its connection pool and cookie jar).
    pub fn with_client(client: reqwest::Client, base_url: &str, timeout: Duration) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url_for(&self, path: &str) -> Result<Url> {
        let joined = if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        };
        Url::parse(&joined).map_err(|e| TransportError::InvalidUrl(format!("{joined}: {e}")))
    }

    #[instrument(skip_all, fields(method = %request.method, path = %request.route()))]
    async fn execute(&self, request: ApiRequest) -> Result<ApiResponse> {
        let url = self.url_for(&request.path)?;

        let mut builder = self
            .client
            .request(request.method, url)
            .headers(request.headers)
            .timeout(self.timeout);
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder.send().await.map_err(map_send_error)?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .bytes()
            .await
            .map_err(|e| TransportError::Body(format!("reading response body: {e}")))?;

        debug!(status = status.as_u16(), bytes = body.len(), "response received");
        Ok(ApiResponse {
            status,
            headers,
            body,
        })
    }
}

impl Transport for ReqwestTransport {
    fn send(
        &self,
        request: ApiRequest,
    ) -> Pin<Box<dyn Future<Output = Result<ApiResponse>> + Send + '_>> {
        Box::pin(self.execute(request))
    }
}

fn map_send_error(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout(e.to_string())
    } else if e.is_connect() {
        TransportError::Connect(e.to_string())
    } else if e.is_body() {
        TransportError::Body(e.to_string())
    } else {
        TransportError::Other(e.to_string())
    }
}
