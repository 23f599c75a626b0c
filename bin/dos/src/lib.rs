#![warn(missing_docs, unreachable_pub)]
#![deny(unused_must_use, rust_2018_idioms)]

//! The dos node.
//!
//! Wires chain synchronisation, on-demand retrieval from light servers and the chain indexers
//! into one process. Peer transports attach through [`node::Node::sync_handler`] and
//! [`node::Node::les`].

pub mod cli;
pub mod commands;
pub mod node;
