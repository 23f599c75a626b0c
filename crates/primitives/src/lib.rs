#![warn(missing_debug_implementations, missing_docs, unreachable_pub)]
#![deny(unused_must_use, rust_2018_idioms)]
#![doc(test(
    no_crate_inject,
    attr(deny(warnings, rust_2018_idioms), allow(dead_code, unused_variables))
))]

//! Commonly used types in dos.
//!
//! This crate contains the chain primitives shared by the synchronisation engine, the light
//! client and the chain indexers.

mod block;
mod header;
mod log;
mod mode;
mod peer;
mod receipt;
mod request;

/// Helper functions for calculating block commitments.
pub mod proofs;
/// Reference discovery inside state trie nodes.
pub mod trie;

pub use alloy_primitives::{
    self, b256, hex, keccak256, Address, Bloom, Bytes, B256, B512, U256,
};
pub use block::{Block, BlockBody, SealedBlock};
pub use header::{Header, SealedHeader};
pub use log::{logs_bloom, Log};
pub use mode::{EngineKind, ParseSyncModeError, SyncMode};
pub use peer::{PeerId, WithPeerId};
pub use receipt::Receipt;
pub use request::{BlockHashOrNumber, BlockNumHash, HeadersDirection, HeadersRequest};

/// A block hash.
pub type BlockHash = B256;
/// A block number.
pub type BlockNumber = u64;
