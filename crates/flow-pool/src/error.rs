//! Error types for pool operations

use std::time::Duration;

use crate::refresher::RefreshError;

/// Errors from pool operations.
///
/// `acquire` only ever returns one of the first five variants; failures local
/// to a single credential are absorbed into that credential's state.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("display unavailable: {0}")]
    DisplayUnavailable(String),

    #[error("captcha unsolved after {attempts} attempts")]
    CaptchaUnsolved { attempts: u32 },

    #[error("token exchange failed: {0}")]
    TokenExchange(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("pool exhausted: {0}")]
    PoolExhausted(String),

    #[error("credential not found: {0}")]
    NotFound(String),

    #[error("credential store error: {0}")]
    Store(String),
}

impl From<RefreshError> for Error {
    fn from(e: RefreshError) -> Self {
        match e {
            RefreshError::DisplayUnavailable(msg) => Error::DisplayUnavailable(msg),
            RefreshError::CaptchaUnsolved { attempts } => Error::CaptchaUnsolved { attempts },
            RefreshError::TokenExchange(msg) => Error::TokenExchange(msg),
            RefreshError::Timeout(d) => Error::Timeout(d),
        }
    }
}

impl From<flow_auth::Error> for Error {
    fn from(e: flow_auth::Error) -> Self {
        Error::Store(e.to_string())
    }
}

/// Result alias for pool operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refresh_errors_keep_their_kind() {
        let err: Error = RefreshError::DisplayUnavailable("no display".into()).into();
        assert!(matches!(err, Error::DisplayUnavailable(_)));

        let err: Error = RefreshError::CaptchaUnsolved { attempts: 3 }.into();
        assert_eq!(err.to_string(), "captcha unsolved after 3 attempts");
    }

    #[test]
    fn store_errors_become_store() {
        let err: Error = flow_auth::Error::Io("disk full".into()).into();
        assert!(matches!(err, Error::Store(ref m) if m.contains("disk full")));
    }
}
