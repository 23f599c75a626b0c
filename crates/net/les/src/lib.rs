#![warn(missing_docs, unreachable_pub)]
#![deny(unused_must_use, rust_2018_idioms)]
#![doc(test(
    no_crate_inject,
    attr(deny(warnings, rust_2018_idioms), allow(dead_code, unused_variables))
))]

//! On-demand retrieval of chain data from light servers.
//!
//! A light client keeps headers locally and asks servers for everything else when it is
//! needed. The pieces:
//!
//! - [`RequestDistributor`] hands each request to the idle server expected to answer soonest.
//! - [`RetrieveManager`] validates answers and moves on to another server when one fails.
//! - [`ServerPool`] remembers which servers served well, across restarts.
//! - [`LightOdr`] puts a local-store-first lookup API on top.

pub mod distributor;
mod metrics;
mod odr;
mod peer;
pub mod request;
pub mod retrieve;
pub mod server_pool;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use distributor::{DistRequest, DistTicket, DistributeError, DistributorConfig, RequestDistributor};
pub use metrics::LesMetrics;
pub use odr::{LightOdr, OdrError};
pub use peer::{LightPeer, Server, ServerHandle, ServerRegistry};
pub use request::{LightPayload, LightRequest, LightResponse, ValidationError};
pub use retrieve::{RetrieveConfig, RetrieveError, RetrieveManager};
pub use server_pool::{ServerPool, ServerPoolConfig, ServerPoolError};
