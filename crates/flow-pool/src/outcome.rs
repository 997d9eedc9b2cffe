//! Request outcome classification
//!
//! Callers report how a request made with an acquired credential went. Only
//! authentication rejections feed the disable threshold; rate limits and
//! server errors say nothing about the credential itself.

use serde::Serialize;

/// Result of a request made with an acquired credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    /// Upstream rejected the credential (401/403)
    AuthFailure,
    OtherFailure,
}

impl Outcome {
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::AuthFailure => "auth_failure",
            Outcome::OtherFailure => "other_failure",
        }
    }
}

/// Classify an upstream HTTP status.
///
/// 401/403 are auth failures, 2xx is success, everything else (429, 5xx,
/// other 4xx) is an unrelated failure.
pub fn classify_status(status: u16) -> Outcome {
    match status {
        401 | 403 => Outcome::AuthFailure,
        200..=299 => Outcome::Success,
        _ => Outcome::OtherFailure,
    }
}
