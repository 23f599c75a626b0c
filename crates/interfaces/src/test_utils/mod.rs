#![allow(unreachable_pub)]

use crate::{
    consensus::{Consensus, ConsensusError},
    executor::{BlockExecutor, ExecutionError},
    p2p::peer::{PeerReporter, ReputationChangeKind},
};
use dos_primitives::{PeerId, Receipt, SealedBlock, SealedHeader, B256};
use parking_lot::Mutex;
use std::{
    collections::HashSet,
    sync::atomic::{AtomicBool, Ordering},
};

/// Generators for test chains.
pub mod generators;

pub use generators::TestChain;

/// Consensus engine implementation for testing
#[derive(Debug, Default)]
pub struct TestConsensus {
    /// Flag whether the header validation should purposefully fail
    fail_validation: AtomicBool,
}

impl TestConsensus {
    /// Get the failed validation flag.
    pub fn fail_validation(&self) -> bool {
        self.fail_validation.load(Ordering::SeqCst)
    }

    /// Update the validation flag.
    pub fn set_fail_validation(&self, val: bool) {
        self.fail_validation.store(val, Ordering::SeqCst)
    }
}

impl Consensus for TestConsensus {
    fn validate_header(
        &self,
        header: &SealedHeader,
        _parent: &SealedHeader,
    ) -> Result<(), ConsensusError> {
        if self.fail_validation() {
            Err(ConsensusError::ZeroDifficulty { number: header.number })
        } else {
            Ok(())
        }
    }
}

/// A [`BlockExecutor`] that derives receipts the same way [`TestChain`] does.
#[derive(Debug, Default)]
pub struct TestExecutor {
    fail: Mutex<HashSet<B256>>,
    executed: Mutex<Vec<u64>>,
}

impl TestExecutor {
    /// Make the execution of the given block fail.
    pub fn fail_on(&self, hash: B256) {
        self.fail.lock().insert(hash);
    }

    /// The numbers of all executed blocks in execution order.
    pub fn executed(&self) -> Vec<u64> {
        self.executed.lock().clone()
    }
}

impl BlockExecutor for TestExecutor {
    fn execute(&self, block: &SealedBlock) -> Result<Vec<Receipt>, ExecutionError> {
        if self.fail.lock().contains(&block.hash()) {
            return Err(ExecutionError::Failed {
                number: block.number(),
                reason: "test failure".to_string(),
            })
        }
        self.executed.lock().push(block.number());
        Ok(generators::receipts_for(&block.body))
    }
}

/// A [`PeerReporter`] that records every report.
#[derive(Debug, Default)]
pub struct RecordingReporter {
    reports: Mutex<Vec<(PeerId, ReputationChangeKind)>>,
}

impl RecordingReporter {
    /// All reports received so far.
    pub fn reports(&self) -> Vec<(PeerId, ReputationChangeKind)> {
        self.reports.lock().clone()
    }

    /// All reports about the given peer.
    pub fn reports_for(&self, peer_id: PeerId) -> Vec<ReputationChangeKind> {
        self.reports.lock().iter().filter(|(id, _)| *id == peer_id).map(|(_, kind)| *kind).collect()
    }
}

impl PeerReporter for RecordingReporter {
    fn report(&self, peer_id: PeerId, kind: ReputationChangeKind) {
        self.reports.lock().push((peer_id, kind));
    }
}
