//! Captcha-assisted re-authentication for Flow accounts
//!
//! When a credential's AT is no longer accepted, a browser session has to walk
//! the product's re-authentication page, clear a reCAPTCHA Enterprise
//! challenge and read back a fresh AT/ST pair. This crate owns that flow and
//! the two pluggable capabilities it needs:
//!
//! - a `DisplayProvider` that opens browser sessions (real display, virtual
//!   display, or none at all)
//! - a `CaptchaSolver` that turns a challenge into a solved token, either
//!   in-page or through a paid solving service
//!
//! Absence of a display is a normal, reported condition
//! (`Error::DisplayUnavailable`), never a panic.

pub mod constants;
pub mod display;
pub mod error;
pub mod refresher;
pub mod solver;
pub mod webdriver;

pub use display::{
    BrowserSession, Challenge, DisplayCapability, DisplayProvider, SolvedToken, UnavailableDisplay,
};
pub use error::{Error, Result};
pub use refresher::{CaptchaRefresher, RefresherSettings, SolveStatsSnapshot};
pub use solver::{CaptchaSolver, InPageSolver, SolverBackend, TaskApiSolver};
pub use webdriver::{WebDriverDisplay, WebDriverSettings};
