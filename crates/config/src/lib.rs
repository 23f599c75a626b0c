#![warn(missing_docs, unreachable_pub)]
#![deny(unused_must_use, rust_2018_idioms)]
#![doc(test(
    no_crate_inject,
    attr(deny(warnings, rust_2018_idioms), allow(dead_code, unused_variables))
))]

//! Standalone crate for the dos node configuration.

pub mod config;

pub use config::{
    Config, ConfigError, DistributorSettings, FetcherConfig, IndexerConfig, LesConfig,
    RetrieveSettings, ServerPoolSettings, SyncConfig,
};
