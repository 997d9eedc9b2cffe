//! Credential pool for Flow accounts
//!
//! Hands out admitted credentials to callers, keeps every credential in one
//! of four states (Valid, Refreshing, Expired, Disabled) and repairs expired
//! tokens on demand. The store is the source of truth; the pool caches its
//! records and writes every token change back.
//!
//! Credential lifecycle:
//! 1. `register` or `load` adds a credential, classified by the validator
//! 2. `acquire` admits a Valid credential below its concurrency limit; when
//!    none is left it refreshes an expired one, joining any refresh already
//!    in flight for that credential
//! 3. Only the ST expired → silent AT exchange; AT unusable → captcha-assisted
//!    re-authentication
//! 4. `release` reports the outcome; repeated auth failures disable the
//!    credential until an explicit `enable`
//! 5. A background task refreshes tokens shortly before they expire

pub mod admission;
pub mod error;
pub mod metrics;
pub mod outcome;
pub mod pool;
pub mod refresh;
pub mod refresher;
pub mod validator;

pub use admission::{AdmissionGate, AdmissionPermit};
pub use error::{Error, Result};
pub use outcome::{Outcome, classify_status};
pub use pool::{
    CredentialHandle, CredentialSnapshot, CredentialState, Pool, PoolConfig, SelectionHint,
};
pub use refresh::spawn_refresh_task;
pub use refresher::{ReauthRefresher, RefreshError, RefreshKind, SessionRefresher};
pub use validator::{Classification, classify, classify_with_margin};
