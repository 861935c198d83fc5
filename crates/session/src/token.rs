//! Session endpoint calls
//!
//! The refresh endpoint takes no body: the backend identifies the session by
//! the long-lived cookie the transport sends automatically, and answers with
//! a fresh access credential as `{ "accessToken": "..." }`.

use serde::{Deserialize, Serialize};
use tracing::debug;
use transport::{ApiRequest, ApiResponse, Transport};

use crate::constants::{LOGOUT_PATH, REFRESH_PATH};
use crate::credentials::AccessCredential;
use crate::error::{Error, Result};

/// Successful refresh payload.
#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenResponse {
    pub access_token: String,
}

/// `POST /api/v1/auth/token/refresh` with no body.
pub fn refresh_request() -> ApiRequest {
    ApiRequest::post(REFRESH_PATH)
}

/// `POST /api/v1/auth/logout` with no body.
pub fn logout_request() -> ApiRequest {
    ApiRequest::post(LOGOUT_PATH)
}

/// Mint a new access credential from the ambient session cookie.
///
/// 401/403 means the long-lived session is gone; any other non-2xx is a
/// generic refresh failure. Both are terminal for the caller.
pub async fn refresh_access_token(transport: &dyn Transport) -> Result<AccessCredential> {
    let response = transport.send(refresh_request()).await?;
    parse_refresh_response(&response)
}

/// Interpret a refresh endpoint response.
pub fn parse_refresh_response(response: &ApiResponse) -> Result<AccessCredential> {
    let status = response.status.as_u16();
    if !response.is_success() {
        let body = response.text();
        if status == 401 || status == 403 {
            return Err(Error::Unauthorized { status, body });
        }
        return Err(Error::TokenRefresh { status, body });
    }

    let token: TokenResponse = response
        .json()
        .map_err(|e| Error::InvalidResponse(e.to_string()))?;
    if token.access_token.is_empty() {
        return Err(Error::InvalidResponse("accessToken is empty".into()));
    }

    debug!("refresh endpoint issued a new access credential");
    Ok(AccessCredential::new(token.access_token))
}
