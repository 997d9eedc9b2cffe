//! Flow credential warden
//!
//! Long-running daemon that keeps a pool of Flow accounts usable:
//! 1. Loads credentials from the store and classifies them
//! 2. Refreshes sessions before they expire, re-authenticating through a
//!    browser and captcha solver when an access token is no longer accepted
//! 3. Logs pool health periodically and exposes Prometheus metrics
//!
//! `flow-warden status` prints the stored credentials' classification and
//! exits.

mod config;
mod metrics;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use common::time::now_millis;
use flow_auth::{Credential, CredentialRecordStore, FileStore, SessionExchange};
use flow_captcha::{
    CaptchaRefresher, CaptchaSolver, DisplayCapability, DisplayProvider, InPageSolver,
    RefresherSettings, TaskApiSolver, UnavailableDisplay, WebDriverDisplay, WebDriverSettings,
};
use flow_pool::{Pool, classify, spawn_refresh_task};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{CaptchaBackend, CaptchaConfig, Config};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    // CLI: simple --config flag parsing plus an optional `status` command
    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());
    let status_only = args.iter().skip(1).any(|a| a == "status");

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    let store = Arc::new(
        FileStore::open(config.store.path.clone())
            .await
            .with_context(|| format!("failed to open credential store {}", config.store.path.display()))?,
    );

    if status_only {
        let records = store.load().await.context("failed to read credential store")?;
        let report = status_report(&records, config.browser.display.resolve(), now_millis());
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    info!("starting flow-warden");

    // Install Prometheus metrics recorder before any metrics are emitted
    metrics::install_recorder(config.metrics.listen_addr)
        .context("failed to install Prometheus recorder")?;
    if let Some(addr) = config.metrics.listen_addr {
        info!(listen_addr = %addr, "serving metrics");
    }

    let exchange_client = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.exchange.timeout_secs))
        .build()
        .context("failed to build HTTP client")?;
    let exchange = SessionExchange::new(exchange_client)
        .with_endpoint(config.exchange.endpoint.clone())
        .with_retry(
            config.exchange.max_attempts,
            Duration::from_millis(config.exchange.backoff_ms),
        );

    // Browser commands can legitimately take as long as the re-auth bound, so
    // this client has no request timeout of its own
    let browser_client = reqwest::Client::new();
    let capability = config.browser.display.resolve();
    let display: Arc<dyn DisplayProvider> = if capability == DisplayCapability::None {
        Arc::new(UnavailableDisplay::default())
    } else {
        Arc::new(WebDriverDisplay::new(
            browser_client.clone(),
            WebDriverSettings {
                endpoint: config.browser.webdriver_url.clone(),
                profile_root: config.browser.profile_root.clone(),
                browser_binary: config.browser.binary.clone(),
                challenge_wait: Duration::from_secs(config.browser.challenge_wait_secs),
            },
            capability,
        ))
    };
    let solver = build_solver(&config.captcha, browser_client)?;
    let captcha = Arc::new(CaptchaRefresher::new(
        display,
        solver.clone(),
        RefresherSettings {
            max_browser_sessions: config.captcha.max_browser_sessions,
            max_solve_attempts: config.captcha.max_solve_attempts,
            reauth_timeout: Duration::from_secs(config.captcha.reauth_timeout_secs),
            ..RefresherSettings::default()
        },
    ));

    info!(
        display = capability.label(),
        solver = solver.name(),
        store = %config.store.path.display(),
        max_concurrency = config.pool.max_concurrency,
        "configuration loaded"
    );
    if !captcha.is_available() {
        warn!("no display available; credentials whose access token expires cannot be re-authenticated");
    }

    let pool = Arc::new(Pool::new(
        store,
        Arc::new(exchange),
        captcha.clone(),
        config.pool.to_pool_config(),
    ));
    pool.load().await.context("failed to load credential pool")?;
    info!(health = %pool.health(), "pool ready");

    let refresh_handle = spawn_refresh_task(
        pool.clone(),
        Duration::from_secs(config.pool.refresh_interval_secs),
        Duration::from_secs(config.pool.refresh_threshold_secs),
    );
    let status_handle = spawn_status_task(
        pool.clone(),
        captcha,
        Duration::from_secs(config.pool.status_interval_secs),
    );

    shutdown_signal().await;

    refresh_handle.abort();
    status_handle.abort();
    info!("shutdown complete");
    Ok(())
}

fn build_solver(config: &CaptchaConfig, client: reqwest::Client) -> Result<Arc<dyn CaptchaSolver>> {
    match config.resolved_backend()? {
        CaptchaBackend::Browser => Ok(Arc::new(InPageSolver)),
        CaptchaBackend::Service(backend) => {
            let api_key = config
                .api_key
                .clone()
                .with_context(|| format!("captcha backend {} needs an API key", backend.name()))?;
            let mut solver = TaskApiSolver::new(backend, client, api_key).with_polling(
                Duration::from_secs(config.poll_interval_secs),
                config.max_polls,
            );
            if let Some(url) = &config.base_url {
                solver = solver.with_base_url(url.clone());
            }
            Ok(Arc::new(solver))
        }
    }
}

/// Log pool health and captcha statistics every `interval`.
fn spawn_status_task(
    pool: Arc<Pool>,
    captcha: Arc<CaptchaRefresher>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let health = pool.health();
            let stats = captcha.stats();
            if health["status"] == "unhealthy" {
                warn!(health = %health, "pool unhealthy");
            } else {
                info!(
                    health = %health,
                    captcha_attempts = stats.attempts,
                    captcha_success_rate = stats.success_rate,
                    "pool status"
                );
            }
        }
    })
}

/// Classification of stored credentials, as printed by `flow-warden status`.
fn status_report(records: &[Credential], display: DisplayCapability, now: u64) -> serde_json::Value {
    let credentials: Vec<serde_json::Value> = records
        .iter()
        .map(|c| {
            serde_json::json!({
                "id": c.id,
                "classification": classify(c, now),
                "disabled": c.disabled,
                "consecutive_failures": c.consecutive_failures,
                "access_invalidated": c.access_invalidated,
                "session_expires_at": c.session_expires_at,
                "last_refreshed_at": c.last_refreshed_at,
            })
        })
        .collect();

    serde_json::json!({
        "display": display.label(),
        "credentials_total": records.len(),
        "credentials": credentials,
    })
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
