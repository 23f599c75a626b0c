#![warn(missing_docs, unreachable_pub)]
#![deny(unused_must_use, rust_2018_idioms)]
#![doc(test(
    no_crate_inject,
    attr(deny(warnings, rust_2018_idioms), allow(dead_code, unused_variables))
))]

//! Synchronisation of the local chain with the network.
//!
//! - [`downloader::Downloader`] runs bulk synchronisations against a master peer, spreading the
//!   header fill, body, receipt and state work over every registered peer.
//! - [`fetcher::Fetcher`] retrieves blocks announced or propagated outside of a bulk run.
//! - [`handler::SyncHandler`] routes peer messages to both and [`handler::ChainSyncer`] decides
//!   when to start a run.
//!
//! ## Feature Flags
//!
//! - `test-utils`: Export utilities for testing

/// Bulk synchronisation.
pub mod downloader;

/// Out of band block retrieval.
pub mod fetcher;

/// Peer message routing and sync scheduling.
pub mod handler;

/// Downloader and fetcher metrics.
pub mod metrics;

/// Bookkeeping of requested data.
pub mod queue;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
