//! Error types for credential storage and session exchange

/// Errors from credential storage and token exchange.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("session endpoint returned {status}: {body}")]
    Upstream { status: u16, body: String },

    #[error("token exchange failed: {0}")]
    TokenExchange(String),

    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),

    #[error("credential parse error: {0}")]
    CredentialParse(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("not found: {0}")]
    NotFound(String),
}

impl Error {
    /// Whether retrying the same exchange could succeed.
    ///
    /// Transport failures, 429 and 5xx are transient. Rejected credentials
    /// and malformed responses are not.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Http(_) => true,
            Error::Upstream { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

/// Result alias for auth operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(Error::Http("connection reset".into()).is_transient());
        assert!(Error::Upstream { status: 503, body: String::new() }.is_transient());
        assert!(Error::Upstream { status: 429, body: String::new() }.is_transient());
        assert!(!Error::Upstream { status: 400, body: String::new() }.is_transient());
        assert!(!Error::InvalidCredentials("revoked".into()).is_transient());
        assert!(!Error::TokenExchange("bad json".into()).is_transient());
    }
}
