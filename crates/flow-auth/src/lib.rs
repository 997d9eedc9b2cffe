//! Flow account authentication library
//!
//! Holds the persisted credential record, the credential record store and
//! the lightweight session exchange. This crate has no knowledge of pooling
//! or browsers; it can be tested and used on its own.
//!
//! Token flow:
//! 1. A credential is registered with its AT (long-lived) and ST (short-lived)
//! 2. Records are persisted through a `CredentialRecordStore`
//! 3. When only the ST has lapsed, `SessionExchange::exchange()` trades the AT
//!    for a fresh ST against the product session endpoint
//! 4. The updated record is written back with `CredentialRecordStore::save()`

pub mod constants;
pub mod credential;
pub mod error;
pub mod exchange;
pub mod store;

pub use constants::*;
pub use credential::{Credential, SessionGrant, TokenPair};
pub use error::{Error, Result};
pub use exchange::SessionExchange;
pub use store::{BoxFuture, CredentialRecordStore, FileStore, MemoryStore};
