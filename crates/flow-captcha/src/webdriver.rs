//! W3C WebDriver display provider
//!
//! Drives a headed Chrome through a WebDriver endpoint (chromedriver or a
//! Selenium node). Each credential gets its own profile directory so that
//! cookies from earlier logins survive between sessions.

use std::path::PathBuf;
use std::time::Duration;

use flow_auth::BoxFuture;
use flow_auth::constants::{SESSION_COOKIE, SESSION_ENDPOINT};
use flow_auth::exchange::parse_expiry_millis;
use flow_auth::TokenPair;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::constants::{RECAPTCHA_ACTION, RECAPTCHA_SITE_KEY};
use crate::display::{
    BrowserSession, Challenge, DisplayCapability, DisplayProvider, NO_DISPLAY_GUIDANCE, SolvedToken,
};
use crate::error::{Error, Result};

const CHALLENGE_SCRIPT: &str = r#"
const el = document.querySelector('[data-sitekey]');
const hasScript = !!document.querySelector('script[src*="recaptcha"]');
const hasField = !!document.querySelector('textarea[name="g-recaptcha-response"]');
return {
  present: !!el || hasScript || hasField,
  siteKey: el ? el.getAttribute('data-sitekey') : null,
  url: location.href,
  ready: typeof grecaptcha !== 'undefined' && !!grecaptcha.enterprise
    && typeof grecaptcha.enterprise.execute === 'function'
};
"#;

const INJECT_SCRIPT: &str = r#"
const s = document.createElement('script');
s.src = 'https://www.google.com/recaptcha/enterprise.js?render=' + arguments[0];
document.head.appendChild(s);
return null;
"#;

const EXECUTE_SCRIPT: &str = r#"
const [siteKey, action, done] = arguments;
grecaptcha.enterprise.ready(() => {
  grecaptcha.enterprise.execute(siteKey, { action })
    .then(token => done({ token }), err => done({ error: String(err) }));
});
"#;

const SUBMIT_SCRIPT: &str = r#"
const fields = document.querySelectorAll('textarea[name="g-recaptcha-response"]');
fields.forEach(t => {
  t.value = arguments[0];
  t.dispatchEvent(new Event('change', { bubbles: true }));
});
return fields.length;
"#;

const SESSION_FETCH_SCRIPT: &str = r#"
const done = arguments[arguments.length - 1];
fetch(arguments[0], { credentials: 'include' })
  .then(r => r.json())
  .then(b => done({ token: b.access_token || null, expires: b.expires || null }),
        e => done({ error: String(e) }));
"#;

#[derive(Debug, Clone)]
pub struct WebDriverSettings {
    /// WebDriver server base URL
    pub endpoint: String,
    /// Parent directory of the per-credential browser profiles
    pub profile_root: PathBuf,
    /// Browser executable; the driver's default when unset
    pub browser_binary: Option<String>,
    /// How long to wait for reCAPTCHA Enterprise to load on a page
    pub challenge_wait: Duration,
}

impl Default for WebDriverSettings {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:9515".into(),
            profile_root: PathBuf::from("browser-profiles"),
            browser_binary: None,
            challenge_wait: Duration::from_secs(15),
        }
    }
}

pub struct WebDriverDisplay {
    client: reqwest::Client,
    settings: WebDriverSettings,
    capability: DisplayCapability,
}

impl WebDriverDisplay {
    pub fn new(
        client: reqwest::Client,
        settings: WebDriverSettings,
        capability: DisplayCapability,
    ) -> Self {
        Self {
            client,
            settings,
            capability,
        }
    }

    fn profile_dir(&self, credential_id: &str) -> PathBuf {
        let safe: String = credential_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.settings.profile_root.join(safe)
    }

    fn capabilities(&self, profile: &std::path::Path) -> Value {
        let mut chrome = json!({
            "args": [
                "--disable-blink-features=AutomationControlled",
                "--no-sandbox",
                "--disable-dev-shm-usage",
                "--window-size=1280,720",
                format!("--user-data-dir={}", profile.display()),
            ],
            "excludeSwitches": ["enable-automation"],
        });
        if let Some(binary) = &self.settings.browser_binary {
            chrome["binary"] = json!(binary);
        }
        json!({
            "capabilities": {
                "alwaysMatch": {
                    "browserName": "chrome",
                    "goog:chromeOptions": chrome,
                }
            }
        })
    }
}

impl DisplayProvider for WebDriverDisplay {
    fn capability(&self) -> DisplayCapability {
        self.capability
    }

    fn open_session<'a>(
        &'a self,
        credential_id: &'a str,
    ) -> BoxFuture<'a, Result<Box<dyn BrowserSession>>> {
        Box::pin(async move {
            if !self.is_available() {
                return Err(Error::DisplayUnavailable(NO_DISPLAY_GUIDANCE.into()));
            }

            let profile = self.profile_dir(credential_id);
            tokio::fs::create_dir_all(&profile)
                .await
                .map_err(|e| Error::Browser(format!("creating profile {}: {e}", profile.display())))?;

            let endpoint = self.settings.endpoint.trim_end_matches('/');
            let response = self
                .client
                .post(format!("{endpoint}/session"))
                .json(&self.capabilities(&profile))
                .send()
                .await
                .map_err(|e| Error::Browser(format!("webdriver unreachable: {e}")))?;
            let value = unwrap_value(response).await?;
            let created: NewSession = serde_json::from_value(value)
                .map_err(|e| Error::Browser(format!("unexpected new session response: {e}")))?;

            debug!(credential_id, session_id = %created.session_id, "webdriver session created");
            Ok(Box::new(WebDriverSession {
                client: self.client.clone(),
                base: format!("{endpoint}/session/{}", created.session_id),
                challenge_wait: self.settings.challenge_wait,
                closed: false,
            }) as Box<dyn BrowserSession>)
        })
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct NewSession {
    session_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChallengeState {
    present: bool,
    site_key: Option<String>,
    url: String,
    ready: bool,
}

#[derive(Deserialize)]
struct ScriptOutcome {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    expires: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
struct Cookie {
    value: String,
    /// Seconds since the epoch
    #[serde(default)]
    expiry: Option<u64>,
}

/// Unwrap the `value` member of a WebDriver response, turning W3C error
/// payloads into `Error::Browser`.
async fn unwrap_value(response: reqwest::Response) -> Result<Value> {
    let status = response.status();
    let body: Value = response
        .json()
        .await
        .map_err(|e| Error::Browser(format!("invalid webdriver response ({status}): {e}")))?;
    let value = body.get("value").cloned().unwrap_or(Value::Null);
    if status.is_success() {
        return Ok(value);
    }
    let error = value.get("error").and_then(Value::as_str).unwrap_or("unknown error");
    let message = value.get("message").and_then(Value::as_str).unwrap_or_default();
    Err(Error::Browser(format!("webdriver {status}: {error}: {message}")))
}

struct WebDriverSession {
    client: reqwest::Client,
    /// `{endpoint}/session/{id}`
    base: String,
    challenge_wait: Duration,
    closed: bool,
}

impl WebDriverSession {
    async fn post(&self, path: &str, body: Value) -> Result<Value> {
        let response = self
            .client
            .post(format!("{}/{path}", self.base))
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Browser(format!("webdriver {path} failed: {e}")))?;
        unwrap_value(response).await
    }

    async fn execute(&self, script: &str, args: Value) -> Result<Value> {
        self.post("execute/sync", json!({ "script": script, "args": args })).await
    }

    async fn execute_async(&self, script: &str, args: Value) -> Result<ScriptOutcome> {
        let value = self
            .post("execute/async", json!({ "script": script, "args": args }))
            .await?;
        serde_json::from_value(value)
            .map_err(|e| Error::Browser(format!("unexpected script result: {e}")))
    }

    async fn challenge_state(&self) -> Result<ChallengeState> {
        let value = self.execute(CHALLENGE_SCRIPT, json!([])).await?;
        serde_json::from_value(value).map_err(|e| Error::Browser(format!("unexpected challenge state: {e}")))
    }

    async fn session_cookie(&self) -> Result<Cookie> {
        let response = self
            .client
            .get(format!("{}/cookie/{SESSION_COOKIE}", self.base))
            .send()
            .await
            .map_err(|e| Error::Browser(format!("webdriver cookie read failed: {e}")))?;
        let value = unwrap_value(response).await?;
        serde_json::from_value(value)
            .map_err(|e| Error::Browser(format!("unexpected cookie payload: {e}")))
    }
}

impl BrowserSession for WebDriverSession {
    fn navigate<'a>(&'a mut self, url: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.post("url", json!({ "url": url })).await?;
            debug!(url, "navigated");
            Ok(())
        })
    }

    fn detect_challenge(&mut self) -> BoxFuture<'_, Result<Option<Challenge>>> {
        Box::pin(async move {
            let mut challenge = self.challenge_state().await?;
            if !challenge.present {
                return Ok(None);
            }
            let site_key = challenge
                .site_key
                .clone()
                .unwrap_or_else(|| RECAPTCHA_SITE_KEY.to_string());

            if !challenge.ready {
                self.execute(INJECT_SCRIPT, json!([site_key])).await?;
                let deadline = tokio::time::Instant::now() + self.challenge_wait;
                while !challenge.ready {
                    if tokio::time::Instant::now() >= deadline {
                        return Err(Error::Browser(format!(
                            "reCAPTCHA Enterprise not ready after {:?}",
                            self.challenge_wait
                        )));
                    }
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    challenge = self.challenge_state().await?;
                }
            }

            Ok(Some(Challenge {
                site_key,
                page_url: challenge.url,
                action: RECAPTCHA_ACTION.to_string(),
            }))
        })
    }

    fn execute_challenge<'a>(
        &'a mut self,
        challenge: &'a Challenge,
    ) -> BoxFuture<'a, Result<SolvedToken>> {
        Box::pin(async move {
            let outcome = self
                .execute_async(EXECUTE_SCRIPT, json!([challenge.site_key, challenge.action]))
                .await?;
            match (outcome.token, outcome.error) {
                (Some(token), _) if !token.is_empty() => Ok(SolvedToken(token)),
                (_, Some(error)) => Err(Error::Solver(format!("grecaptcha execute: {error}"))),
                _ => Err(Error::Solver("grecaptcha execute returned no token".into())),
            }
        })
    }

    fn submit_solution<'a>(&'a mut self, solved: &'a SolvedToken) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let fields = self.execute(SUBMIT_SCRIPT, json!([solved.0])).await?;
            debug!(fields = fields.as_u64().unwrap_or(0), "captcha solution submitted");
            Ok(())
        })
    }

    fn extract_tokens(&mut self) -> BoxFuture<'_, Result<TokenPair>> {
        Box::pin(async move {
            let cookie = self.session_cookie().await?;
            if cookie.value.is_empty() {
                return Err(Error::Browser("session cookie is empty".into()));
            }

            let session = self
                .execute_async(SESSION_FETCH_SCRIPT, json!([SESSION_ENDPOINT]))
                .await?;
            if let Some(error) = session.error {
                return Err(Error::Browser(format!("session fetch failed: {error}")));
            }
            let session_token = session
                .token
                .filter(|t| !t.is_empty())
                .ok_or_else(|| Error::Browser("session endpoint returned no token".into()))?;
            let expires = session
                .expires
                .ok_or_else(|| Error::Browser("session endpoint returned no expiry".into()))?;
            let session_expires_at =
                parse_expiry_millis(&expires).map_err(|e| Error::Browser(e.to_string()))?;

            Ok(TokenPair {
                access_token: cookie.value,
                access_expires_at: cookie.expiry.map(|secs| secs.saturating_mul(1000)),
                session_token,
                session_expires_at,
            })
        })
    }

    fn close(self: Box<Self>) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            let mut this = self;
            if let Err(e) = this.client.delete(&this.base).send().await {
                warn!(error = %e, "failed to delete webdriver session");
            }
            this.closed = true;
        })
    }
}

impl Drop for WebDriverSession {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        let client = self.client.clone();
        let url = self.base.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = client.delete(&url).send().await {
                        warn!(error = %e, "failed to delete abandoned webdriver session");
                    }
                });
            }
            Err(_) => warn!(session = %url, "webdriver session leaked: no runtime to close it"),
        }
    }
}
