#![warn(missing_docs, unreachable_pub)]
#![deny(unused_must_use, rust_2018_idioms)]
#![doc(test(
    no_crate_inject,
    attr(deny(warnings, rust_2018_idioms), allow(dead_code, unused_variables))
))]

//! Registry of the peers the node synchronises with.
//!
//! The [`PeerRegistry`] is the single source of truth for which peers are connected. It tracks
//! each peer's advertised head, per request kind idle flags and throughput estimates used to
//! size requests.

mod peer;
mod registry;

pub use peer::{Capabilities, Peer, RequestKind, INITIAL_RTT, MAX_LACKING_HASHES, MEASUREMENT_IMPACT};
pub use registry::{PeerEvent, PeerRegistry, RegistryError};
