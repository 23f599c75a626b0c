use dos_primitives::{BlockBody, EngineKind, SealedHeader, U256};
use std::{fmt::Debug, sync::Arc};

/// Extra data reserved for the signer vanity in proof-of-authority headers.
pub const EXTRA_VANITY: usize = 32;

/// Extra data reserved for the signer seal in proof-of-authority headers.
pub const EXTRA_SEAL: usize = 65;

/// Maximum extra data size of proof-of-work headers.
pub const MAXIMUM_EXTRA_DATA_SIZE: usize = 32;

/// Consensus is a protocol that chooses canonical chain.
///
/// The synchronisation engine only asks it about header and body validity, sealing and fork
/// choice are not its business.
pub trait Consensus: Debug + Send + Sync {
    /// Validate if header is correct and follows the consensus rules of the engine.
    ///
    /// **This should not be called for the genesis block**.
    fn validate_header(&self, header: &SealedHeader, parent: &SealedHeader)
        -> Result<(), ConsensusError>;

    /// Validate a block body against the commitments of its header.
    fn validate_block_body(&self, header: &SealedHeader, body: &BlockBody) -> Result<(), ConsensusError> {
        if !body.matches(header) {
            return Err(ConsensusError::BodyMismatch { number: header.number })
        }
        Ok(())
    }
}

impl<T: Consensus + ?Sized> Consensus for Arc<T> {
    fn validate_header(
        &self,
        header: &SealedHeader,
        parent: &SealedHeader,
    ) -> Result<(), ConsensusError> {
        (**self).validate_header(header, parent)
    }

    fn validate_block_body(&self, header: &SealedHeader, body: &BlockBody) -> Result<(), ConsensusError> {
        (**self).validate_block_body(header, body)
    }
}

/// Consensus Errors
#[allow(missing_docs)]
#[derive(thiserror::Error, Debug, PartialEq, Eq, Clone)]
pub enum ConsensusError {
    #[error("Block {number} has zero difficulty.")]
    ZeroDifficulty { number: u64 },
    #[error("Block {number} has difficulty {difficulty}, expected 1 or 2 for a signed block.")]
    InvalidSignerDifficulty { number: u64, difficulty: U256 },
    #[error("Block timestamp {timestamp} is in past in comparison with parent timestamp {parent_timestamp}.")]
    TimestampIsInPast { parent_timestamp: u64, timestamp: u64 },
    #[error("Block used gas ({gas_used}) is greater than gaslimit ({gas_limit}).")]
    HeaderGasUsedExceedsGasLimit { gas_used: u64, gas_limit: u64 },
    #[error("Extra data {len} exceeds max length of {MAXIMUM_EXTRA_DATA_SIZE}.")]
    ExtraDataExceedsMax { len: usize },
    #[error("Extra data {len} is too short to carry the signer vanity and seal.")]
    MissingSignerSeal { len: usize },
    #[error("Body of block {number} does not match the commitments of its header.")]
    BodyMismatch { number: u64 },
}

/// The consensus rules of the two supported engine families.
///
/// Only the checks that can be done on a header and its parent are implemented, the engines
/// themselves (sealing, difficulty adjustment, signer sets) live elsewhere.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineConsensus {
    kind: EngineKind,
}

impl EngineConsensus {
    /// Create the consensus rules for the given engine.
    pub const fn new(kind: EngineKind) -> Self {
        Self { kind }
    }

    /// The engine this instance validates for.
    pub const fn kind(&self) -> EngineKind {
        self.kind
    }
}

impl Consensus for EngineConsensus {
    fn validate_header(
        &self,
        header: &SealedHeader,
        parent: &SealedHeader,
    ) -> Result<(), ConsensusError> {
        if header.gas_used > header.gas_limit {
            return Err(ConsensusError::HeaderGasUsedExceedsGasLimit {
                gas_used: header.gas_used,
                gas_limit: header.gas_limit,
            })
        }

        match self.kind {
            EngineKind::ProofOfWork => {
                if header.difficulty.is_zero() {
                    return Err(ConsensusError::ZeroDifficulty { number: header.number })
                }
                if header.timestamp <= parent.timestamp {
                    return Err(ConsensusError::TimestampIsInPast {
                        parent_timestamp: parent.timestamp,
                        timestamp: header.timestamp,
                    })
                }
                if header.extra_data.len() > MAXIMUM_EXTRA_DATA_SIZE {
                    return Err(ConsensusError::ExtraDataExceedsMax { len: header.extra_data.len() })
                }
            }
            EngineKind::ProofOfAuthority => {
                // in-turn signers produce difficulty 2, out-of-turn signers difficulty 1
                if header.difficulty != U256::from(1) && header.difficulty != U256::from(2) {
                    return Err(ConsensusError::InvalidSignerDifficulty {
                        number: header.number,
                        difficulty: header.difficulty,
                    })
                }
                if header.timestamp < parent.timestamp {
                    return Err(ConsensusError::TimestampIsInPast {
                        parent_timestamp: parent.timestamp,
                        timestamp: header.timestamp,
                    })
                }
                if header.extra_data.len() < EXTRA_VANITY + EXTRA_SEAL {
                    return Err(ConsensusError::MissingSignerSeal { len: header.extra_data.len() })
                }
            }
        }
        Ok(())
    }
}
