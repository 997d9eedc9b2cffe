//! Captcha solving capabilities
//!
//! Two families, selected by configuration:
//! - `InPageSolver`: first-party; executes the challenge inside the browser
//!   session that detected it
//! - `TaskApiSolver`: third-party paid services sharing the
//!   `createTask` / `getTaskResult` protocol (yescaptcha, capmonster,
//!   ezcaptcha, capsolver)
//!
//! A single `solve` call is one attempt. Retrying is the refresher's job so
//! that the attempt bound lives in one place.

use std::str::FromStr;
use std::time::Duration;

use common::Secret;
use flow_auth::BoxFuture;
use serde::Deserialize;
use tracing::debug;

use crate::display::{BrowserSession, Challenge, SolvedToken};
use crate::error::{Error, Result};

/// Turns a detected challenge into a solved token.
pub trait CaptchaSolver: Send + Sync {
    /// Backend label for logs and metrics.
    fn name(&self) -> &str;

    /// One solve attempt. `session` is the page that raised the challenge;
    /// remote solvers ignore it.
    fn solve<'a>(
        &'a self,
        session: &'a mut dyn BrowserSession,
        challenge: &'a Challenge,
    ) -> BoxFuture<'a, Result<SolvedToken>>;
}

/// Solves by running `grecaptcha.enterprise.execute` in the live page.
#[derive(Debug, Default, Clone, Copy)]
pub struct InPageSolver;

impl CaptchaSolver for InPageSolver {
    fn name(&self) -> &str {
        "browser"
    }

    fn solve<'a>(
        &'a self,
        session: &'a mut dyn BrowserSession,
        challenge: &'a Challenge,
    ) -> BoxFuture<'a, Result<SolvedToken>> {
        Box::pin(async move { session.execute_challenge(challenge).await })
    }
}

/// Third-party solving services.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolverBackend {
    YesCaptcha,
    CapMonster,
    EzCaptcha,
    CapSolver,
}

impl SolverBackend {
    pub fn name(&self) -> &'static str {
        match self {
            SolverBackend::YesCaptcha => "yescaptcha",
            SolverBackend::CapMonster => "capmonster",
            SolverBackend::EzCaptcha => "ezcaptcha",
            SolverBackend::CapSolver => "capsolver",
        }
    }

    pub fn default_base_url(&self) -> &'static str {
        match self {
            SolverBackend::YesCaptcha => "https://api.yescaptcha.com",
            SolverBackend::CapMonster => "https://api.capmonster.cloud",
            SolverBackend::EzCaptcha => "https://api.ez-captcha.com",
            SolverBackend::CapSolver => "https://api.capsolver.com",
        }
    }

    /// Task type each service uses for proxyless reCAPTCHA v3 Enterprise.
    pub fn task_type(&self) -> &'static str {
        match self {
            SolverBackend::YesCaptcha => "RecaptchaV3TaskProxylessM1",
            SolverBackend::CapMonster => "RecaptchaV3EnterpriseTask",
            SolverBackend::EzCaptcha => "ReCaptchaV3EnterpriseTaskProxyless",
            SolverBackend::CapSolver => "ReCaptchaV3EnterpriseTaskProxyLess",
        }
    }
}

impl FromStr for SolverBackend {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "yescaptcha" => Ok(SolverBackend::YesCaptcha),
            "capmonster" => Ok(SolverBackend::CapMonster),
            "ezcaptcha" => Ok(SolverBackend::EzCaptcha),
            "capsolver" => Ok(SolverBackend::CapSolver),
            other => Err(Error::Solver(format!("unknown solver backend: {other}"))),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateTaskResponse {
    #[serde(default)]
    error_id: i64,
    #[serde(default)]
    error_description: Option<String>,
    #[serde(default)]
    task_id: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TaskResultResponse {
    #[serde(default)]
    error_id: i64,
    #[serde(default)]
    error_description: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    solution: Option<TaskSolution>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TaskSolution {
    g_recaptcha_response: String,
}

/// Client for `createTask` / `getTaskResult` solving services.
///
/// Polls every `poll_interval` up to `max_polls` times; exhausting the polls
/// fails the attempt.
pub struct TaskApiSolver {
    backend: SolverBackend,
    client: reqwest::Client,
    base_url: String,
    api_key: Secret<String>,
    poll_interval: Duration,
    max_polls: u32,
}

impl TaskApiSolver {
    pub fn new(backend: SolverBackend, client: reqwest::Client, api_key: Secret<String>) -> Self {
        Self {
            backend,
            client,
            base_url: backend.default_base_url().to_string(),
            api_key,
            poll_interval: Duration::from_secs(3),
            max_polls: 40,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_polling(mut self, poll_interval: Duration, max_polls: u32) -> Self {
        self.poll_interval = poll_interval;
        self.max_polls = max_polls.max(1);
        self
    }

    async fn post<T: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> Result<T> {
        let url = format!("{}/{path}", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Solver(format!("{} {path} request failed: {e}", self.backend.name())))?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Solver(format!(
                "{} {path} returned {status}",
                self.backend.name()
            )));
        }
        response
            .json::<T>()
            .await
            .map_err(|e| Error::Solver(format!("{} {path} invalid response: {e}", self.backend.name())))
    }

    async fn create_task(&self, challenge: &Challenge) -> Result<serde_json::Value> {
        let body = serde_json::json!({
            "clientKey": self.api_key.expose(),
            "task": {
                "type": self.backend.task_type(),
                "websiteURL": challenge.page_url,
                "websiteKey": challenge.site_key,
                "pageAction": challenge.action,
            }
        });
        let created: CreateTaskResponse = self.post("createTask", body).await?;
        if created.error_id != 0 {
            return Err(Error::Solver(format!(
                "{} createTask error: {}",
                self.backend.name(),
                created.error_description.unwrap_or_default()
            )));
        }
        created
            .task_id
            .ok_or_else(|| Error::Solver(format!("{} createTask returned no taskId", self.backend.name())))
    }

    async fn poll_result(&self, task_id: &serde_json::Value) -> Result<SolvedToken> {
        for poll in 1..=self.max_polls {
            tokio::time::sleep(self.poll_interval).await;
            let body = serde_json::json!({
                "clientKey": self.api_key.expose(),
                "taskId": task_id,
            });
            let result: TaskResultResponse = self.post("getTaskResult", body).await?;
            if result.error_id != 0 {
                return Err(Error::Solver(format!(
                    "{} getTaskResult error: {}",
                    self.backend.name(),
                    result.error_description.unwrap_or_default()
                )));
            }
            match (result.status.as_deref(), result.solution) {
                (Some("ready"), Some(solution)) => {
                    debug!(backend = self.backend.name(), poll, "captcha task ready");
                    return Ok(SolvedToken(solution.g_recaptcha_response));
                }
                (Some("ready"), None) => {
                    return Err(Error::Solver(format!(
                        "{} task ready without solution",
                        self.backend.name()
                    )));
                }
                _ => continue,
            }
        }
        Err(Error::Solver(format!(
            "{} task not ready after {} polls",
            self.backend.name(),
            self.max_polls
        )))
    }
}

impl CaptchaSolver for TaskApiSolver {
    fn name(&self) -> &str {
        self.backend.name()
    }

    fn solve<'a>(
        &'a self,
        _session: &'a mut dyn BrowserSession,
        challenge: &'a Challenge,
    ) -> BoxFuture<'a, Result<SolvedToken>> {
        Box::pin(async move {
            let task_id = self.create_task(challenge).await?;
            debug!(backend = self.backend.name(), %task_id, "captcha task created");
            self.poll_result(&task_id).await
        })
    }
}
