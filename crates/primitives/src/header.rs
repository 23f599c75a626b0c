use crate::{
    keccak256,
    proofs::{EMPTY_LIST_HASH, EMPTY_ROOT},
    BlockHash, BlockNumHash, BlockNumber, Bloom, Bytes, B256, U256,
};
use alloy_rlp::{RlpDecodable, RlpEncodable};
use serde::{Deserialize, Serialize};
use std::ops::Deref;

/// Block header
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize, RlpEncodable, RlpDecodable,
)]
pub struct Header {
    /// The Keccak 256-bit hash of the parent block’s header, in its entirety.
    pub parent_hash: B256,
    /// The Keccak 256-bit hash of the ommers list portion of this block.
    pub ommers_hash: B256,
    /// The Keccak 256-bit hash of the root node of the state trie, after all transactions are
    /// executed and finalisations applied.
    pub state_root: B256,
    /// The Keccak 256-bit hash of the root node of the trie structure populated with each
    /// transaction in the transactions list portion of the block.
    pub transactions_root: B256,
    /// The Keccak 256-bit hash of the root node of the trie structure populated with the receipts
    /// of each transaction in the transactions list portion of the block.
    pub receipts_root: B256,
    /// The Bloom filter composed from indexable information (logger address and log topics)
    /// contained in each log entry from the receipt of each transaction in the transactions list.
    pub logs_bloom: Bloom,
    /// A scalar value corresponding to the difficulty level of this block.
    pub difficulty: U256,
    /// A scalar value equal to the number of ancestor blocks. The genesis block has a number of
    /// zero.
    pub number: BlockNumber,
    /// A scalar value equal to the current limit of gas expenditure per block.
    pub gas_limit: u64,
    /// A scalar value equal to the total gas used in transactions in this block.
    pub gas_used: u64,
    /// A scalar value equal to the reasonable output of Unix’s time() at this block’s inception.
    pub timestamp: u64,
    /// An arbitrary byte array containing data relevant to this block. For proof-of-authority
    /// engines this carries the vanity prefix and the signer seal.
    pub extra_data: Bytes,
}

impl Header {
    /// Heavy function that will calculate hash of data and will *not* save the change to metadata.
    /// Use [`Header::seal_slow`] and unlock if you need hash to be persistent.
    pub fn hash_slow(&self) -> B256 {
        keccak256(alloy_rlp::encode(self))
    }

    /// Calculate hash and seal the Header so that it can't be changed.
    pub fn seal_slow(self) -> SealedHeader {
        let hash = self.hash_slow();
        SealedHeader::new(self, hash)
    }

    /// Returns true if the header announces a block without transactions and ommers, so the
    /// body does not have to be fetched.
    pub fn is_empty_body(&self) -> bool {
        self.transactions_root == EMPTY_ROOT && self.ommers_hash == EMPTY_LIST_HASH
    }

    /// Returns true if the header commits to an empty receipt list.
    pub fn is_empty_receipts(&self) -> bool {
        self.receipts_root == EMPTY_ROOT
    }
}

/// A [`Header`] that is sealed at a precalculated hash, use [`SealedHeader::unseal()`] if you
/// want to modify header.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct SealedHeader {
    /// Locked Header fields.
    header: Header,
    /// Locked Header hash.
    hash: BlockHash,
}

impl SealedHeader {
    /// Creates the sealed header with the corresponding block hash.
    ///
    /// The hash is trusted, use [`Header::seal_slow`] to derive it.
    pub const fn new(header: Header, hash: BlockHash) -> Self {
        Self { header, hash }
    }

    /// Returns the sealed Header fields.
    pub const fn header(&self) -> &Header {
        &self.header
    }

    /// Returns header/block hash.
    pub const fn hash(&self) -> BlockHash {
        self.hash
    }

    /// Return the number hash tuple.
    pub fn num_hash(&self) -> BlockNumHash {
        BlockNumHash::new(self.header.number, self.hash)
    }

    /// Extract raw header that can be modified.
    pub fn unseal(self) -> Header {
        self.header
    }

    /// Returns true if `parent` is this header's direct predecessor.
    pub fn is_child_of(&self, parent: &SealedHeader) -> bool {
        self.header.parent_hash == parent.hash && self.header.number == parent.number + 1
    }
}

impl AsRef<Header> for SealedHeader {
    fn as_ref(&self) -> &Header {
        &self.header
    }
}

impl Deref for SealedHeader {
    type Target = Header;

    fn deref(&self) -> &Self::Target {
        &self.header
    }
}
