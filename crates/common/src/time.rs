//! Wall-clock helpers
//!
//! Token expiries are stored as absolute unix timestamps in milliseconds so
//! they survive restarts unchanged.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Current unix time in milliseconds.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Absolute unix millisecond timestamp `delta` from now.
pub fn millis_from_now(delta: Duration) -> u64 {
    now_millis().saturating_add(delta.as_millis() as u64)
}
