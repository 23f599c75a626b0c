use crate::db::DatabaseError;
use dos_primitives::{BlockHash, BlockHashOrNumber, BlockNumber};

/// Provider result type.
pub type ProviderResult<T> = Result<T, ProviderError>;

/// Errors of the chain provider.
#[allow(missing_docs)]
#[derive(Debug, thiserror::Error, PartialEq, Eq, Clone)]
pub enum ProviderError {
    #[error(transparent)]
    Database(#[from] DatabaseError),
    #[error("Failed to decode stored {what}: {error}")]
    Decode { what: &'static str, error: alloy_rlp::Error },
    #[error("Header {0} does not exist in database")]
    HeaderNotFound(BlockHashOrNumber),
    #[error("Parent {parent_hash} of block {block_number} is unknown")]
    UnknownParent { block_number: BlockNumber, parent_hash: BlockHash },
    #[error("Total difficulty of block {block_number} / {block_hash} is unknown")]
    TotalDifficultyNotFound { block_number: BlockNumber, block_hash: BlockHash },
    #[error("Headers to insert are not contiguous at block {block_number}")]
    NonContiguousHeaders { block_number: BlockNumber },
    #[error("Genesis block is not initialized")]
    MissingGenesis,
}
