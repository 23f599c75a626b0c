use crate::{
    proofs::{calculate_ommers_root, calculate_transaction_root},
    BlockHash, BlockNumber, Bytes, Header, SealedHeader,
};
use alloy_rlp::{RlpDecodable, RlpEncodable};
use serde::{Deserialize, Serialize};
use std::ops::Deref;

/// Ethereum full block.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize, RlpEncodable, RlpDecodable)]
pub struct Block {
    /// Block header.
    pub header: Header,
    /// Block body.
    pub body: BlockBody,
}

impl Block {
    /// Create a [`SealedBlock`] that will calculate the header hash.
    pub fn seal_slow(self) -> SealedBlock {
        SealedBlock { header: self.header.seal_slow(), body: self.body }
    }
}

impl Deref for Block {
    type Target = Header;

    fn deref(&self) -> &Self::Target {
        &self.header
    }
}

/// A response to `GetBlockBodies`, containing bodies if any bodies were found.
///
/// Transactions are opaque payloads, executing them is left to the block executor.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize, RlpEncodable, RlpDecodable,
)]
pub struct BlockBody {
    /// Transactions in the block
    pub transactions: Vec<Bytes>,
    /// Uncle headers for the given block
    pub ommers: Vec<Header>,
}

impl BlockBody {
    /// Returns true if the body has neither transactions nor ommers.
    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty() && self.ommers.is_empty()
    }

    /// Returns true if the body's commitments match the ones announced by the header.
    pub fn matches(&self, header: &Header) -> bool {
        calculate_transaction_root(self) == header.transactions_root &&
            calculate_ommers_root(&self.ommers) == header.ommers_hash
    }

    /// Combines the body with its sealed header.
    pub fn into_block(self, header: SealedHeader) -> SealedBlock {
        SealedBlock { header, body: self }
    }
}

/// Sealed Ethereum full block.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SealedBlock {
    /// Locked block header.
    pub header: SealedHeader,
    /// Block body.
    pub body: BlockBody,
}

impl SealedBlock {
    /// Header hash.
    pub fn hash(&self) -> BlockHash {
        self.header.hash()
    }

    /// Block number.
    pub fn number(&self) -> BlockNumber {
        self.header.number
    }

    /// Splits the sealed block into underlying components
    pub fn split(self) -> (SealedHeader, BlockBody) {
        (self.header, self.body)
    }

    /// Unseal the block
    pub fn unseal(self) -> Block {
        Block { header: self.header.unseal(), body: self.body }
    }
}

impl Deref for SealedBlock {
    type Target = SealedHeader;

    fn deref(&self) -> &Self::Target {
        &self.header
    }
}
