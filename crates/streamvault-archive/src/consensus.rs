//! Consensus Interface
//!
//! The archiver never mutates the manifest directly: every mutation is a
//! [`ManifestCommand`] replicated through the partition's consensus group
//! first, then applied locally at the offset consensus assigned to it. This
//! module defines that contract.
//!
//! The replicating term doubles as a leader epoch: a command submitted under
//! a term that is no longer current must be rejected, which fences archivers
//! that lost leadership mid-flight.
//!
//! [`LocalConsensus`] is a single-node implementation that sequences
//! commands in-process. Tests drive leadership churn through it; embedded
//! single-replica deployments can use it as-is.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use thiserror::Error;

use streamvault_core::{ManifestCommand, Offset, Term};

#[derive(Debug, Error)]
pub enum ConsensusError {
    #[error("replica is not the leader")]
    NotLeader,

    #[error("stale term {submitted}, current term is {current}")]
    StaleTerm { submitted: Term, current: Term },

    #[error("replication failed: {0}")]
    Replication(String),
}

/// Replication-side contract consumed by the archiver.
#[async_trait]
pub trait Consensus: Send + Sync {
    /// Current leadership term of the partition.
    fn term(&self) -> Term;

    /// True while this replica is the leader.
    fn is_leader(&self) -> bool;

    /// Replicate a batch of manifest commands under the given term.
    ///
    /// Returns the consensus offset of the committed batch; the caller uses
    /// it as the manifest's new insync offset. Rejects the batch when the
    /// term is stale or leadership was lost.
    async fn replicate(
        &self,
        term: Term,
        commands: Vec<ManifestCommand>,
    ) -> Result<Offset, ConsensusError>;
}

/// Single-node consensus: commands commit immediately, in submission order.
pub struct LocalConsensus {
    term: AtomicU64,
    leader: AtomicBool,
    log_offset: AtomicU64,
}

impl Default for LocalConsensus {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalConsensus {
    pub fn new() -> Self {
        Self {
            term: AtomicU64::new(1),
            leader: AtomicBool::new(true),
            log_offset: AtomicU64::new(0),
        }
    }

    /// Become leader in the given term.
    pub fn become_leader(&self, term: Term) {
        self.term.store(term, Ordering::SeqCst);
        self.leader.store(true, Ordering::SeqCst);
    }

    /// Lose leadership, bumping the term to the new leader's.
    pub fn step_down(&self, new_term: Term) {
        self.term.store(new_term, Ordering::SeqCst);
        self.leader.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl Consensus for LocalConsensus {
    fn term(&self) -> Term {
        self.term.load(Ordering::SeqCst)
    }

    fn is_leader(&self) -> bool {
        self.leader.load(Ordering::SeqCst)
    }

    async fn replicate(
        &self,
        term: Term,
        commands: Vec<ManifestCommand>,
    ) -> Result<Offset, ConsensusError> {
        if !self.is_leader() {
            return Err(ConsensusError::NotLeader);
        }
        let current = self.term();
        if term != current {
            return Err(ConsensusError::StaleTerm {
                submitted: term,
                current,
            });
        }
        let count = commands.len() as u64;
        Ok(self.log_offset.fetch_add(count, Ordering::SeqCst) + count)
    }
}
