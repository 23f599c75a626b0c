//! Typed access to the chain stored in a key-value database.
//!
//! The synchronisation engine, the light client and the chain indexers all read and write the
//! chain through [`ChainProvider`].

#![warn(missing_docs, unreachable_pub)]
#![deny(unused_must_use, rust_2018_idioms)]
#![doc(test(
    no_crate_inject,
    attr(deny(warnings, rust_2018_idioms), allow(dead_code, unused_variables))
))]

pub mod keys;
mod provider;

pub use dos_interfaces::provider::{ProviderError, ProviderResult};
pub use provider::{BlockHead, ChainProvider};
