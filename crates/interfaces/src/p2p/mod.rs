/// Shared error types.
pub mod error;

/// Header chain validation shared by the bulk downloader and the block fetcher.
pub mod headers;

/// The eth protocol messages the synchronisation engine consumes.
pub mod message;

/// Peer handles and reputation reporting.
pub mod peer;
