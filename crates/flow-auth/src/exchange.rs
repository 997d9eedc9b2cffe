//! Silent session exchange (AT → ST)
//!
//! The product's session endpoint accepts the long-lived AT as the
//! `__Secure-next-auth.session-token` cookie and answers with a short-lived
//! bearer plus its RFC 3339 expiry:
//!
//! ```json
//! {"access_token": "ya29...", "expires": "2025-01-01T12:00:00.000Z", "user": {...}}
//! ```
//!
//! The product calls that bearer `access_token`; in this workspace it is the
//! session token (ST). An empty object means the AT is no longer accepted.

use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::constants::{SESSION_COOKIE, SESSION_ENDPOINT};
use crate::credential::SessionGrant;
use crate::error::{Error, Result};

/// Session endpoint response body.
#[derive(Debug, Deserialize)]
struct SessionResponse {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    expires: Option<String>,
}

/// Client for the lightweight AT → ST exchange, with bounded retry.
///
/// Transient failures (transport errors, 429, 5xx) are retried up to
/// `max_attempts` total attempts with linear backoff. Rejections are returned
/// immediately.
#[derive(Clone)]
pub struct SessionExchange {
    client: reqwest::Client,
    endpoint: String,
    max_attempts: u32,
    backoff: Duration,
}

impl SessionExchange {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            endpoint: SESSION_ENDPOINT.to_string(),
            max_attempts: 3,
            backoff: Duration::from_millis(500),
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    /// Override the retry policy. `max_attempts` is clamped to at least 1.
    pub fn with_retry(mut self, max_attempts: u32, backoff: Duration) -> Self {
        self.max_attempts = max_attempts.max(1);
        self.backoff = backoff;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Trade `access_token` for a fresh session token.
    pub async fn exchange(&self, access_token: &str) -> Result<SessionGrant> {
        let mut attempt = 1;
        loop {
            match self.exchange_once(access_token).await {
                Ok(grant) => return Ok(grant),
                Err(e) if e.is_transient() && attempt < self.max_attempts => {
                    let delay = self.backoff * attempt;
                    warn!(
                        attempt,
                        max_attempts = self.max_attempts,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %e,
                        "session exchange failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn exchange_once(&self, access_token: &str) -> Result<SessionGrant> {
        let response = self
            .client
            .get(&self.endpoint)
            .header(
                reqwest::header::COOKIE,
                format!("{SESSION_COOKIE}={access_token}"),
            )
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| Error::Http(format!("session exchange request failed: {e}")))?;

        let status = response.status();
        let rotated_access_token = rotated_session_cookie(response.headers());

        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| String::from("<no body>"));
            if status.as_u16() == 401 || status.as_u16() == 403 {
                return Err(Error::InvalidCredentials(format!(
                    "access token rejected ({status}): {body}"
                )));
            }
            return Err(Error::Upstream {
                status: status.as_u16(),
                body,
            });
        }

        let body = response
            .json::<SessionResponse>()
            .await
            .map_err(|e| Error::TokenExchange(format!("invalid session response: {e}")))?;

        let session_token = match body.access_token {
            Some(t) if !t.is_empty() => t,
            _ => {
                return Err(Error::InvalidCredentials(
                    "session endpoint returned no token".into(),
                ));
            }
        };
        let expires = body
            .expires
            .ok_or_else(|| Error::TokenExchange("session response missing expires".into()))?;
        let session_expires_at = parse_expiry_millis(&expires)?;

        debug!(
            session_expires_at,
            rotated = rotated_access_token.is_some(),
            "session exchange succeeded"
        );
        Ok(SessionGrant {
            session_token,
            session_expires_at,
            rotated_access_token,
        })
    }
}

/// Parse an RFC 3339 timestamp into unix milliseconds.
pub fn parse_expiry_millis(value: &str) -> Result<u64> {
    let parsed = chrono::DateTime::parse_from_rfc3339(value)
        .map_err(|e| Error::TokenExchange(format!("invalid expiry {value:?}: {e}")))?;
    u64::try_from(parsed.timestamp_millis())
        .map_err(|_| Error::TokenExchange(format!("expiry before epoch: {value}")))
}

/// Extract a rotated AT from `Set-Cookie` headers, if the endpoint sent one.
fn rotated_session_cookie(headers: &reqwest::header::HeaderMap) -> Option<String> {
    let prefix = format!("{SESSION_COOKIE}=");
    headers
        .get_all(reqwest::header::SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .find_map(|cookie| {
            let pair = cookie.split(';').next()?.trim();
            let value = pair.strip_prefix(&prefix)?;
            (!value.is_empty()).then(|| value.to_string())
        })
}
