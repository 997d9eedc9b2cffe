//! Pool metrics
//!
//! Recorded through the `metrics` facade; the binary decides where they go.
//!
//! - `pool_acquire_total` (counter): label `result`
//! - `pool_release_total` (counter): label `outcome`
//! - `pool_refresh_total` (counter): labels `kind`, `result`
//! - `pool_refresh_duration_seconds` (histogram): label `kind`

use crate::outcome::Outcome;
use crate::refresher::RefreshKind;

/// Histogram buckets for refresh durations: exchanges take well under a
/// second, browser re-authentication can take minutes.
pub const REFRESH_DURATION_BUCKETS: &[f64] = &[
    0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0,
];

pub fn record_acquire(result: &'static str) {
    metrics::counter!("pool_acquire_total", "result" => result).increment(1);
}

pub fn record_release(outcome: Outcome) {
    metrics::counter!("pool_release_total", "outcome" => outcome.label()).increment(1);
}

pub fn record_refresh(kind: RefreshKind, success: bool, duration_secs: f64) {
    let result = if success { "success" } else { "failure" };
    metrics::counter!("pool_refresh_total", "kind" => kind.label(), "result" => result).increment(1);
    metrics::histogram!("pool_refresh_duration_seconds", "kind" => kind.label())
        .record(duration_secs);
}
