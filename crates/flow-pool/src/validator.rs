//! Token validator
//!
//! Pure classification of a credential record against the clock. The pool
//! calls it on every selection and after every refresh; nothing here touches
//! the network.

use flow_auth::Credential;
use serde::Serialize;

/// What a credential needs before it can serve requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    Valid,
    /// ST lapsed, AT still usable: a silent exchange is enough
    SessionExpired,
    /// AT lapsed or rejected: browser re-authentication required
    AccessExpired,
    /// Missing token material
    Unknown,
}

impl Classification {
    /// Whether only a full re-authentication can repair the credential.
    pub fn needs_reauth(&self) -> bool {
        matches!(self, Classification::AccessExpired | Classification::Unknown)
    }

    /// Refresh priority; lower is cheaper to repair.
    pub(crate) fn repair_rank(&self) -> u8 {
        match self {
            Classification::Valid => 0,
            Classification::SessionExpired => 1,
            Classification::AccessExpired | Classification::Unknown => 2,
        }
    }
}

/// Classify `credential` at unix millisecond time `now`.
pub fn classify(credential: &Credential, now: u64) -> Classification {
    classify_with_margin(credential, now, 0)
}

/// Like [`classify`], but tokens expiring within `margin_ms` count as expired.
pub fn classify_with_margin(credential: &Credential, now: u64, margin_ms: u64) -> Classification {
    if credential.access_token.is_empty() || credential.session_token.is_empty() {
        return Classification::Unknown;
    }
    let horizon = now.saturating_add(margin_ms);
    if credential.access_invalidated
        || credential.access_expires_at.is_some_and(|at| at <= horizon)
    {
        return Classification::AccessExpired;
    }
    if credential.session_expires_at <= horizon {
        return Classification::SessionExpired;
    }
    Classification::Valid
}
