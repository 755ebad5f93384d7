//! Core Error Types
//!
//! Errors raised by manifest decoding and manifest command application.
//! Invariant violations are fatal to the archiver that observes them; callers
//! are expected to propagate them rather than recover.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("manifest corrupt: {0}")]
    Corrupt(String),

    #[error("unsupported manifest version: {0}")]
    UnsupportedVersion(u16),

    #[error("manifest invariant violated: {0}")]
    InvariantViolation(String),
}
