//! Error types for captcha-assisted re-authentication

use std::time::Duration;

/// Errors from the captcha-assisted refresh flow.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No display/automation capability at all. Operator-actionable.
    #[error("display unavailable: {0}")]
    DisplayUnavailable(String),

    #[error("captcha unsolved after {attempts} attempts")]
    CaptchaUnsolved { attempts: u32 },

    #[error("browser automation failed: {0}")]
    Browser(String),

    #[error("captcha solver failed: {0}")]
    Solver(String),

    #[error("re-authentication timed out after {0:?}")]
    Timeout(Duration),
}

/// Result alias for captcha operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_unavailable_carries_guidance() {
        let err = Error::DisplayUnavailable("start under xvfb-run".into());
        assert_eq!(err.to_string(), "display unavailable: start under xvfb-run");
    }

    #[test]
    fn unsolved_reports_attempt_count() {
        let err = Error::CaptchaUnsolved { attempts: 3 };
        assert_eq!(err.to_string(), "captcha unsolved after 3 attempts");
    }
}
