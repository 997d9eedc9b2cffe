//! Display capability and browser session contracts
//!
//! The refresher never inspects the environment itself. A `DisplayProvider` is
//! injected at construction and reports what it can do; `DisplayCapability::detect`
//! is a helper for building one from the process environment.

use std::ffi::OsStr;
use std::fmt;

use flow_auth::{BoxFuture, TokenPair};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// What kind of display browser sessions can use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisplayCapability {
    /// A graphical session (X11/Wayland display or macOS WindowServer)
    Real,
    /// A virtual framebuffer (Xvfb) is available
    Virtual,
    /// No display at all; headed browser automation is impossible
    None,
}

impl DisplayCapability {
    /// Inspect the current process environment.
    ///
    /// Order: macOS WindowServer, `DISPLAY`/`WAYLAND_DISPLAY`, then `xvfb-run`
    /// on `PATH`.
    pub fn detect() -> Self {
        if cfg!(target_os = "macos") && window_server_running() {
            return DisplayCapability::Real;
        }
        Self::detect_from(
            std::env::var_os("DISPLAY").as_deref(),
            std::env::var_os("WAYLAND_DISPLAY").as_deref(),
            std::env::var_os("PATH").as_deref(),
        )
    }

    /// Pure form of [`detect`](Self::detect) over explicit environment values.
    pub fn detect_from(
        display: Option<&OsStr>,
        wayland: Option<&OsStr>,
        path: Option<&OsStr>,
    ) -> Self {
        let set = |v: Option<&OsStr>| v.is_some_and(|v| !v.is_empty());
        if set(display) || set(wayland) {
            return DisplayCapability::Real;
        }
        if on_path("xvfb-run", path) {
            DisplayCapability::Virtual
        } else {
            DisplayCapability::None
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            DisplayCapability::Real => "real",
            DisplayCapability::Virtual => "virtual",
            DisplayCapability::None => "none",
        }
    }
}

fn window_server_running() -> bool {
    std::process::Command::new("pgrep")
        .args(["-x", "WindowServer"])
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Guidance surfaced with `DisplayUnavailable`.
pub const NO_DISPLAY_GUIDANCE: &str = "no display detected; start under xvfb-run or configure a third-party captcha backend";

/// A captcha challenge detected on a page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    pub site_key: String,
    pub page_url: String,
    pub action: String,
}

/// A solved challenge token.
#[derive(Clone, PartialEq, Eq)]
pub struct SolvedToken(pub String);

impl fmt::Debug for SolvedToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SolvedToken({} bytes)", self.0.len())
    }
}

/// One live browser session.
///
/// Sessions are driven sequentially by a single refresh, so methods take
/// `&mut self`. `close` consumes the session; implementations must also clean
/// up on drop because a timed-out refresh drops the session mid-flow.
pub trait BrowserSession: Send {
    fn navigate<'a>(&'a mut self, url: &'a str) -> BoxFuture<'a, Result<()>>;

    /// Look for a captcha challenge on the current page.
    fn detect_challenge(&mut self) -> BoxFuture<'_, Result<Option<Challenge>>>;

    /// Run the challenge inside the page (first-party solving).
    fn execute_challenge<'a>(
        &'a mut self,
        challenge: &'a Challenge,
    ) -> BoxFuture<'a, Result<SolvedToken>>;

    /// Hand a solved token back to the page.
    fn submit_solution<'a>(&'a mut self, solved: &'a SolvedToken) -> BoxFuture<'a, Result<()>>;

    /// Read the AT/ST pair the re-authenticated session now holds.
    fn extract_tokens(&mut self) -> BoxFuture<'_, Result<TokenPair>>;

    fn close(self: Box<Self>) -> BoxFuture<'static, ()>;
}

/// Source of browser sessions.
pub trait DisplayProvider: Send + Sync {
    fn capability(&self) -> DisplayCapability;

    fn is_available(&self) -> bool {
        self.capability() != DisplayCapability::None
    }

    /// Open a session using the browser profile of `credential_id`.
    fn open_session<'a>(
        &'a self,
        credential_id: &'a str,
    ) -> BoxFuture<'a, Result<Box<dyn BrowserSession>>>;
}

/// Provider for environments without any automation capability.
pub struct UnavailableDisplay {
    reason: String,
}

impl UnavailableDisplay {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl Default for UnavailableDisplay {
    fn default() -> Self {
        Self::new(NO_DISPLAY_GUIDANCE)
    }
}

impl DisplayProvider for UnavailableDisplay {
    fn capability(&self) -> DisplayCapability {
        DisplayCapability::None
    }

    fn open_session<'a>(
        &'a self,
        _credential_id: &'a str,
    ) -> BoxFuture<'a, Result<Box<dyn BrowserSession>>> {
        Box::pin(async move { Err(Error::DisplayUnavailable(self.reason.clone())) })
    }
}

/// Whether `binary` exists in one of the directories of a `PATH` value.
pub fn on_path(binary: &str, path: Option<&OsStr>) -> bool {
    path.map(|p| std::env::split_paths(p).any(|dir| dir.join(binary).is_file()))
        .unwrap_or(false)
}
