#![warn(missing_docs, unreachable_pub)]
#![deny(unused_must_use, rust_2018_idioms)]
#![doc(test(
    no_crate_inject,
    attr(deny(warnings, rust_2018_idioms), allow(dead_code, unused_variables))
))]

//! Post-processing of the canonical chain in fixed size sections.
//!
//! A [`ChainIndexer`] waits until a section of the chain is buried under enough confirmations,
//! feeds its headers to a [`ChainIndexerBackend`] and remembers the hash of the last header
//! of every finished section. Reorgs roll finished sections back. Indexers can be chained so
//! that a child only ever sees sections its parent has finished.
//!
//! [`BloomIndexer`] is the backend rearranging the log blooms of a section bit by bit, so a
//! log filter can test a single bloom bit for a whole section at once.

mod bloom;
mod events;
mod indexer;
mod metrics;

pub use bloom::{BloomBitsReader, BloomIndexer, BLOOM_BIT_LENGTH};
pub use events::{ChainEvent, HeadWatcher};
pub use indexer::{ChainIndexer, ChainIndexerBackend, IndexerError, SectionsInfo};
pub use metrics::IndexerMetrics;
