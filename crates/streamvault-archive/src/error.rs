//! Archiver Error Types
//!
//! ## Error Categories
//!
//! ### Manifest errors
//! - `Manifest`: command application or decoding failed. Invariant
//!   violations surface here and are fatal to the archiver.
//!
//! ### Consensus errors
//! - `Consensus`: replication rejected a command (lost leadership, stale
//!   term). The affected mutation is skipped, not retried blindly.
//!
//! ### Collaborator errors
//! - `Log`: the local log engine failed to serve segment bytes.
//! - `Remote`: an object-store interaction failed outside the classified
//!   upload/download outcome paths.
//!
//! Transient upload failures are *not* errors: the scheduler reports them in
//! its [`BatchResult`](crate::BatchResult) counters and the next tick retries
//! through normal candidate regeneration.

use thiserror::Error;

use crate::consensus::ConsensusError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("manifest error: {0}")]
    Manifest(#[from] streamvault_core::Error),

    #[error("consensus error: {0}")]
    Consensus(#[from] ConsensusError),

    #[error("log read error: {0}")]
    Log(String),

    #[error("object store error: {0}")]
    Remote(String),

    #[error("archiver is shutting down")]
    ShuttingDown,
}
