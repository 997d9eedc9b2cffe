//! Prometheus metrics exposition
//!
//! The libraries record through the `metrics` facade:
//!
//! - `pool_acquire_total` (counter): label `result`
//! - `pool_release_total` (counter): label `outcome`
//! - `pool_refresh_total` (counter): labels `kind`, `result`
//! - `pool_refresh_duration_seconds` (histogram): label `kind`
//! - `captcha_solve_total` (counter): labels `backend`, `result`
//!
//! This module installs the global recorder they write to.

use std::net::SocketAddr;

use flow_pool::metrics::REFRESH_DURATION_BUCKETS;
use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder};

/// Builder with histogram buckets set, so refresh durations render as a
/// Prometheus histogram (`_bucket` lines) rather than a summary.
fn builder() -> Result<PrometheusBuilder, BuildError> {
    PrometheusBuilder::new().set_buckets_for_metric(
        Matcher::Full("pool_refresh_duration_seconds".to_string()),
        REFRESH_DURATION_BUCKETS,
    )
}

/// Install the global Prometheus recorder.
///
/// With `listen_addr`, the exporter's HTTP listener serves `/metrics` there;
/// this must run inside the tokio runtime. Without it metrics are recorded
/// but not exposed.
pub fn install_recorder(listen_addr: Option<SocketAddr>) -> Result<(), BuildError> {
    match listen_addr {
        Some(addr) => builder()?.with_http_listener(addr).install(),
        None => builder()?.install_recorder().map(|_| ()),
    }
}
