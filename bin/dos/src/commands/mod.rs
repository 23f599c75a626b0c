//! Commands of the `dos` binary.

pub mod config;
pub mod node;
