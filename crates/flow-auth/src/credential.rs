//! Persisted credential record
//!
//! One record per Flow account. Expiries are absolute unix timestamps in
//! milliseconds. Everything the validator needs to classify a record is
//! persisted, so reloading a store reproduces the same classification.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A single account's authentication material and durable metadata.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    /// Stable identifier; equals the store key
    #[serde(default)]
    pub id: String,
    /// Long-lived access token (AT)
    pub access_token: String,
    /// AT expiry; `None` means valid until an upstream failure invalidates it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_expires_at: Option<u64>,
    /// Short-lived session token (ST)
    pub session_token: String,
    /// ST expiry
    pub session_expires_at: u64,
    /// Set when upstream rejected the AT or a silent exchange failed
    #[serde(default)]
    pub access_invalidated: bool,
    /// Operator or threshold disable; only an explicit enable clears it
    #[serde(default)]
    pub disabled: bool,
    /// Consecutive auth failures reported by callers
    #[serde(default)]
    pub consecutive_failures: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_refreshed_at: Option<u64>,
    /// Per-account admission limit; the pool default applies when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrency: Option<u32>,
    /// Flow project opened during browser re-authentication
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
}

/// A fresh AT/ST pair produced by a full re-authentication.
#[derive(Clone, PartialEq, Eq)]
pub struct TokenPair {
    pub access_token: String,
    pub access_expires_at: Option<u64>,
    pub session_token: String,
    pub session_expires_at: u64,
}

/// A fresh ST produced by a silent AT exchange.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionGrant {
    pub session_token: String,
    pub session_expires_at: u64,
    /// The session endpoint may rotate the AT cookie alongside the ST
    pub rotated_access_token: Option<String>,
}

impl Credential {
    pub fn new(
        id: impl Into<String>,
        access_token: impl Into<String>,
        session_token: impl Into<String>,
        session_expires_at: u64,
    ) -> Self {
        Self {
            id: id.into(),
            access_token: access_token.into(),
            access_expires_at: None,
            session_token: session_token.into(),
            session_expires_at,
            access_invalidated: false,
            disabled: false,
            consecutive_failures: 0,
            last_refreshed_at: None,
            max_concurrency: None,
            project_id: None,
        }
    }

    /// Install a silently exchanged ST.
    pub fn install_session(&mut self, grant: &SessionGrant, now: u64) {
        self.session_token = grant.session_token.clone();
        self.session_expires_at = grant.session_expires_at;
        if let Some(access) = &grant.rotated_access_token {
            self.access_token = access.clone();
        }
        self.access_invalidated = false;
        self.last_refreshed_at = Some(now);
    }

    /// Install a full AT/ST pair after browser re-authentication.
    pub fn install_pair(&mut self, pair: &TokenPair, now: u64) {
        self.access_token = pair.access_token.clone();
        self.access_expires_at = pair.access_expires_at;
        self.session_token = pair.session_token.clone();
        self.session_expires_at = pair.session_expires_at;
        self.access_invalidated = false;
        self.consecutive_failures = 0;
        self.last_refreshed_at = Some(now);
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("id", &self.id)
            .field("access_token", &"[REDACTED]")
            .field("access_expires_at", &self.access_expires_at)
            .field("session_token", &"[REDACTED]")
            .field("session_expires_at", &self.session_expires_at)
            .field("access_invalidated", &self.access_invalidated)
            .field("disabled", &self.disabled)
            .field("consecutive_failures", &self.consecutive_failures)
            .finish_non_exhaustive()
    }
}

impl fmt::Debug for TokenPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenPair")
            .field("access_expires_at", &self.access_expires_at)
            .field("session_expires_at", &self.session_expires_at)
            .finish_non_exhaustive()
    }
}

impl fmt::Debug for SessionGrant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionGrant")
            .field("session_expires_at", &self.session_expires_at)
            .field("rotated_access_token", &self.rotated_access_token.is_some())
            .finish_non_exhaustive()
    }
}
