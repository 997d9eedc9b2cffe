//! Shared building blocks for the Flow credential pool workspace

mod error;
mod secret;
pub mod time;

pub use error::{Error, Result};
pub use secret::Secret;
