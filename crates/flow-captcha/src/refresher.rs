//! Captcha-assisted refresher
//!
//! Produces a fresh AT/ST pair when the AT itself is no longer accepted.
//! Concurrent browser sessions are capped by a semaphore, solve attempts are
//! bounded, and the whole flow runs under a hard deadline.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use flow_auth::constants::project_url;
use flow_auth::{Credential, TokenPair};
use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::constants::DEFAULT_MAX_SOLVE_ATTEMPTS;
use crate::display::{
    BrowserSession, Challenge, DisplayCapability, DisplayProvider, NO_DISPLAY_GUIDANCE, SolvedToken,
};
use crate::error::{Error, Result};
use crate::solver::CaptchaSolver;

/// Tunables for the captcha-assisted flow.
#[derive(Debug, Clone)]
pub struct RefresherSettings {
    /// Browser sessions allowed to run at once
    pub max_browser_sessions: usize,
    pub max_solve_attempts: u32,
    /// Pause between failed solve attempts
    pub solve_retry_pause: Duration,
    /// Hard bound on one re-authentication, slot wait included
    pub reauth_timeout: Duration,
}

impl Default for RefresherSettings {
    fn default() -> Self {
        Self {
            max_browser_sessions: 1,
            max_solve_attempts: DEFAULT_MAX_SOLVE_ATTEMPTS,
            solve_retry_pause: Duration::from_secs(1),
            reauth_timeout: Duration::from_secs(120),
        }
    }
}

#[derive(Default)]
struct SolveStats {
    attempts: AtomicU64,
    solved: AtomicU64,
    failed: AtomicU64,
}

/// Point-in-time solve statistics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SolveStatsSnapshot {
    pub backend: String,
    pub attempts: u64,
    pub solved: u64,
    pub failed: u64,
    /// Percentage of attempts that produced a token
    pub success_rate: f64,
}

pub struct CaptchaRefresher {
    display: Arc<dyn DisplayProvider>,
    solver: Arc<dyn CaptchaSolver>,
    settings: RefresherSettings,
    slots: Semaphore,
    stats: SolveStats,
}

impl CaptchaRefresher {
    pub fn new(
        display: Arc<dyn DisplayProvider>,
        solver: Arc<dyn CaptchaSolver>,
        settings: RefresherSettings,
    ) -> Self {
        let slots = Semaphore::new(settings.max_browser_sessions.max(1));
        Self {
            display,
            solver,
            settings,
            slots,
            stats: SolveStats::default(),
        }
    }

    pub fn capability(&self) -> DisplayCapability {
        self.display.capability()
    }

    pub fn is_available(&self) -> bool {
        self.display.is_available()
    }

    pub fn settings(&self) -> &RefresherSettings {
        &self.settings
    }

    /// Re-authenticate `credential` through a browser session.
    ///
    /// Fails fast with `DisplayUnavailable` before taking a slot when the
    /// provider has no capability.
    pub async fn refresh(&self, credential: &Credential) -> Result<TokenPair> {
        if !self.display.is_available() {
            return Err(Error::DisplayUnavailable(NO_DISPLAY_GUIDANCE.into()));
        }

        let deadline = self.settings.reauth_timeout;
        match tokio::time::timeout(deadline, self.run(credential)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(credential_id = %credential.id, timeout_secs = deadline.as_secs(), "re-authentication timed out");
                Err(Error::Timeout(deadline))
            }
        }
    }

    async fn run(&self, credential: &Credential) -> Result<TokenPair> {
        let _slot = self
            .slots
            .acquire()
            .await
            .map_err(|_| Error::Browser("browser slots closed".into()))?;

        debug!(
            credential_id = %credential.id,
            capability = self.display.capability().label(),
            "opening browser session"
        );
        let mut session = self.display.open_session(&credential.id).await?;
        let result = self.drive(session.as_mut(), credential).await;
        session.close().await;

        if result.is_ok() {
            info!(credential_id = %credential.id, "re-authentication succeeded");
        }
        result
    }

    async fn drive(
        &self,
        session: &mut dyn BrowserSession,
        credential: &Credential,
    ) -> Result<TokenPair> {
        session
            .navigate(&project_url(credential.project_id.as_deref()))
            .await?;

        match session.detect_challenge().await? {
            Some(challenge) => {
                let solved = self.solve_bounded(session, &challenge).await?;
                session.submit_solution(&solved).await?;
            }
            None => debug!(credential_id = %credential.id, "no challenge on page"),
        }

        let pair = session.extract_tokens().await?;
        if pair.access_token.is_empty() || pair.session_token.is_empty() {
            return Err(Error::Browser("session holds no tokens after re-authentication".into()));
        }
        Ok(pair)
    }

    async fn solve_bounded(
        &self,
        session: &mut dyn BrowserSession,
        challenge: &Challenge,
    ) -> Result<SolvedToken> {
        let attempts = self.settings.max_solve_attempts.max(1);
        let backend = self.solver.name().to_string();

        for attempt in 1..=attempts {
            self.stats.attempts.fetch_add(1, Ordering::Relaxed);
            match self.solver.solve(session, challenge).await {
                Ok(token) => {
                    self.stats.solved.fetch_add(1, Ordering::Relaxed);
                    metrics::counter!("captcha_solve_total", "backend" => backend.clone(), "result" => "solved")
                        .increment(1);
                    debug!(backend = %backend, attempt, "captcha solved");
                    return Ok(token);
                }
                Err(e) => {
                    self.stats.failed.fetch_add(1, Ordering::Relaxed);
                    metrics::counter!("captcha_solve_total", "backend" => backend.clone(), "result" => "failed")
                        .increment(1);
                    warn!(backend = %backend, attempt, max_attempts = attempts, error = %e, "captcha solve failed");
                    if attempt < attempts {
                        tokio::time::sleep(self.settings.solve_retry_pause).await;
                    }
                }
            }
        }
        Err(Error::CaptchaUnsolved { attempts })
    }

    pub fn stats(&self) -> SolveStatsSnapshot {
        let attempts = self.stats.attempts.load(Ordering::Relaxed);
        let solved = self.stats.solved.load(Ordering::Relaxed);
        let failed = self.stats.failed.load(Ordering::Relaxed);
        let success_rate = if attempts == 0 {
            0.0
        } else {
            solved as f64 * 100.0 / attempts as f64
        };
        SolveStatsSnapshot {
            backend: self.solver.name().to_string(),
            attempts,
            solved,
            failed,
            success_rate,
        }
    }
}
