//! Refresher seams
//!
//! The pool only depends on these two traits. `SessionExchange` and
//! `CaptchaRefresher` implement them for production; tests inject fakes.
//! Errors are `Clone` because one refresh result is published to every
//! caller waiting on that credential.

use std::time::Duration;

use flow_auth::{BoxFuture, Credential, SessionExchange, SessionGrant, TokenPair};
use flow_captcha::CaptchaRefresher;

/// Which refresher repairs a credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshKind {
    /// Silent AT → ST exchange
    Session,
    /// Captcha-assisted browser re-authentication
    Reauth,
}

impl RefreshKind {
    pub fn label(&self) -> &'static str {
        match self {
            RefreshKind::Session => "session",
            RefreshKind::Reauth => "reauth",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RefreshError {
    #[error("display unavailable: {0}")]
    DisplayUnavailable(String),

    #[error("captcha unsolved after {attempts} attempts")]
    CaptchaUnsolved { attempts: u32 },

    #[error("token exchange failed: {0}")]
    TokenExchange(String),

    #[error("refresh timed out after {0:?}")]
    Timeout(Duration),
}

/// Trades a credential's AT for a fresh ST.
pub trait SessionRefresher: Send + Sync {
    fn exchange<'a>(
        &'a self,
        credential: &'a Credential,
    ) -> BoxFuture<'a, Result<SessionGrant, RefreshError>>;
}

/// Produces a fresh AT/ST pair through browser re-authentication.
pub trait ReauthRefresher: Send + Sync {
    fn reauthenticate<'a>(
        &'a self,
        credential: &'a Credential,
    ) -> BoxFuture<'a, Result<TokenPair, RefreshError>>;
}

impl SessionRefresher for SessionExchange {
    fn exchange<'a>(
        &'a self,
        credential: &'a Credential,
    ) -> BoxFuture<'a, Result<SessionGrant, RefreshError>> {
        Box::pin(async move {
            SessionExchange::exchange(self, &credential.access_token)
                .await
                .map_err(|e| RefreshError::TokenExchange(e.to_string()))
        })
    }
}

impl ReauthRefresher for CaptchaRefresher {
    fn reauthenticate<'a>(
        &'a self,
        credential: &'a Credential,
    ) -> BoxFuture<'a, Result<TokenPair, RefreshError>> {
        Box::pin(async move {
            self.refresh(credential).await.map_err(|e| match e {
                flow_captcha::Error::DisplayUnavailable(msg) => RefreshError::DisplayUnavailable(msg),
                flow_captcha::Error::CaptchaUnsolved { attempts } => {
                    RefreshError::CaptchaUnsolved { attempts }
                }
                flow_captcha::Error::Timeout(d) => RefreshError::Timeout(d),
                other => RefreshError::TokenExchange(format!("re-authentication failed: {other}")),
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use flow_captcha::{InPageSolver, RefresherSettings, UnavailableDisplay};

    #[test]
    fn kind_labels() {
        assert_eq!(RefreshKind::Session.label(), "session");
        assert_eq!(RefreshKind::Reauth.label(), "reauth");
    }

    #[tokio::test]
    async fn captcha_refresher_maps_display_unavailable() {
        let refresher = CaptchaRefresher::new(
            Arc::new(UnavailableDisplay::new("headless host")),
            Arc::new(InPageSolver),
            RefresherSettings::default(),
        );
        let cred = Credential::new("a", "at", "st", 0);
        let err = ReauthRefresher::reauthenticate(&refresher, &cred)
            .await
            .unwrap_err();
        assert!(matches!(err, RefreshError::DisplayUnavailable(_)), "got: {err:?}");
    }

    #[tokio::test]
    async fn session_exchange_failure_is_token_exchange() {
        let exchange = SessionExchange::new(reqwest::Client::new())
            .with_endpoint("http://127.0.0.1:9/session")
            .with_retry(1, Duration::from_millis(1));
        let cred = Credential::new("a", "at", "st", 0);
        let err = SessionRefresher::exchange(&exchange, &cred).await.unwrap_err();
        assert!(matches!(err, RefreshError::TokenExchange(_)), "got: {err:?}");
    }
}
