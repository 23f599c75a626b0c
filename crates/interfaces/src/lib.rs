#![warn(missing_docs, unreachable_pub)]
#![deny(unused_must_use, rust_2018_idioms)]
#![doc(test(
    no_crate_inject,
    attr(deny(warnings, rust_2018_idioms), allow(dead_code, unused_variables))
))]

//! dos interface bindings
//!
//! ## Feature Flags
//!
//! - `test-utils`: Export utilities for testing

/// Consensus traits.
pub mod consensus;

/// Key-value storage traits and the in-memory database.
pub mod db;

/// Block Execution traits.
pub mod executor;

/// P2P traits.
pub mod p2p;

/// Provider error
pub mod provider;

#[cfg(any(test, feature = "test-utils"))]
/// Common test helpers for mocking out consensus, execution, chains and peers.
pub mod test_utils;
