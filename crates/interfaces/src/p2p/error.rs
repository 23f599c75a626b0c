use crate::{consensus::ConsensusError, executor::ExecutionError, provider::ProviderError};
use dos_primitives::{BlockNumber, PeerId, B256, U256};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

/// Result alias for result of a request.
pub type RequestResult<T> = Result<T, RequestError>;

/// Error variants that can happen when sending requests to a session.
#[derive(Debug, Error, Clone, Eq, PartialEq)]
#[allow(missing_docs)]
pub enum RequestError {
    #[error("Closed channel to the peer.")]
    ChannelClosed,
    #[error("Connection to a peer dropped while handling the request.")]
    ConnectionDropped,
    #[error("Capability Message is not supported by remote peer.")]
    UnsupportedCapability,
    #[error("Request timed out while awaiting response.")]
    Timeout,
    #[error("Received bad response.")]
    BadResponse,
}

// === impl RequestError ===

impl<T> From<mpsc::error::SendError<T>> for RequestError {
    fn from(_: mpsc::error::SendError<T>) -> Self {
        RequestError::ChannelClosed
    }
}

impl From<oneshot::error::RecvError> for RequestError {
    fn from(_: oneshot::error::RecvError) -> Self {
        RequestError::ChannelClosed
    }
}

/// The download result type
pub type DownloadResult<T> = Result<T, DownloadError>;

/// The outcome of a failed synchronisation run.
///
/// Only run level outcomes are represented here, faults of individual peers that could be
/// absorbed by moving their work to other peers never surface as a [`DownloadError`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DownloadError {
    /* ==================== PROTOCOL FAULTS ==================== */
    /// Header validation failed
    #[error("Failed to validate header {number} / {hash} from {peer_id}. Details: {error}.")]
    HeaderValidation {
        /// The peer that delivered the header
        peer_id: PeerId,
        /// Number of the header failing validation
        number: BlockNumber,
        /// Hash of header failing validation
        hash: B256,
        /// The details of validation failure
        #[source]
        error: ConsensusError,
    },
    /// Error when checking that the current header has the parent's hash as the parent_hash
    /// field, and that they have sequential block numbers.
    #[error("Headers did not match, current number: {header_number} / current hash: {header_hash}, parent number: {parent_number} / parent_hash: {parent_hash}")]
    MismatchedHeaders {
        /// The peer that delivered the header
        peer_id: PeerId,
        /// The header number being evaluated
        header_number: BlockNumber,
        /// The header hash being evaluated
        header_hash: B256,
        /// The parent number being evaluated
        parent_number: BlockNumber,
        /// The parent hash being evaluated
        parent_hash: B256,
    },
    /// The skeleton delivered by the master peer is inconsistent with the filled headers.
    #[error("Skeleton header {number} from {peer_id} does not match the filled chain.")]
    InvalidSkeleton {
        /// The master peer of the run
        peer_id: PeerId,
        /// The skeleton header that could not be linked
        number: BlockNumber,
    },
    /// The peer answered the head or ancestor lookup inconsistently.
    #[error("Peer {peer_id} delivered an invalid common ancestor answer: {reason}")]
    InvalidAncestor {
        /// The master peer of the run
        peer_id: PeerId,
        /// What was wrong with the answer
        reason: &'static str,
    },
    /// The chain delivered by the peer does not reach the advertised total difficulty.
    #[error("Peer {peer_id} advertised total difficulty {advertised} but delivered {delivered}.")]
    InvalidTotalDifficulty {
        /// The master peer of the run
        peer_id: PeerId,
        /// The total difficulty advertised by the peer
        advertised: U256,
        /// The total difficulty of the delivered chain
        delivered: U256,
    },
    /// A block delivered by the peer failed execution.
    #[error("Block {number} / {hash} from {peer_id} is invalid: {error}")]
    BadBlock {
        /// The master peer of the run
        peer_id: PeerId,
        /// Number of the failing block
        number: BlockNumber,
        /// Hash of the failing block
        hash: B256,
        /// The execution failure
        #[source]
        error: ExecutionError,
    },
    /* ==================== RECOVERABLE ==================== */
    /// The master peer timed out too often.
    #[error("Peer {peer_id} timed out while serving the synchronisation.")]
    Timeout {
        /// The peer that timed out
        peer_id: PeerId,
    },
    /// Work is pending but no peer is left that can serve it.
    #[error("Synchronisation stalled: no capable peer remains.")]
    Stalled,
    /// No peers are available for the requested synchronisation.
    #[error("No peers available.")]
    NoPeers,
    /// The peer to synchronise with is not registered.
    #[error("Unknown peer {0}.")]
    UnknownPeer(PeerId),
    /// A synchronisation run is already active.
    #[error("Busy synchronising with another peer.")]
    Busy,
    /// The run was cancelled.
    #[error("Synchronisation cancelled.")]
    Cancelled,
    /// The downloader was terminated.
    #[error("Downloader terminated.")]
    Terminated,
    /* ==================== LOCAL FAULTS ==================== */
    /// Error while reading or writing the local chain.
    #[error(transparent)]
    Provider(#[from] ProviderError),
    /// Local execution failure that cannot be attributed to a peer.
    #[error(transparent)]
    Execution(ExecutionError),
}

impl DownloadError {
    /// Returns true if the error was caused by a peer violating the protocol.
    ///
    /// Such peers should be disconnected by the caller.
    pub fn is_protocol_fault(&self) -> bool {
        matches!(
            self,
            DownloadError::HeaderValidation { .. } |
                DownloadError::MismatchedHeaders { .. } |
                DownloadError::InvalidSkeleton { .. } |
                DownloadError::InvalidAncestor { .. } |
                DownloadError::InvalidTotalDifficulty { .. } |
                DownloadError::BadBlock { .. }
        )
    }

    /// The peer the error is attributed to, if any.
    pub fn peer(&self) -> Option<PeerId> {
        match self {
            DownloadError::HeaderValidation { peer_id, .. } |
            DownloadError::MismatchedHeaders { peer_id, .. } |
            DownloadError::InvalidSkeleton { peer_id, .. } |
            DownloadError::InvalidAncestor { peer_id, .. } |
            DownloadError::InvalidTotalDifficulty { peer_id, .. } |
            DownloadError::BadBlock { peer_id, .. } |
            DownloadError::Timeout { peer_id } => Some(*peer_id),
            DownloadError::UnknownPeer(peer_id) => Some(*peer_id),
            _ => None,
        }
    }

    /// Returns true if the run ended because it was cancelled or the downloader terminated.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, DownloadError::Cancelled | DownloadError::Terminated)
    }

    /// Returns true if the error is caused by the local node and must not be retried.
    pub fn is_fatal(&self) -> bool {
        matches!(self, DownloadError::Provider(_) | DownloadError::Execution(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        let peer_id = PeerId::repeat_byte(1);
        let err = DownloadError::MismatchedHeaders {
            peer_id,
            header_number: 2,
            header_hash: B256::ZERO,
            parent_number: 1,
            parent_hash: B256::ZERO,
        };
        assert!(err.is_protocol_fault());
        assert_eq!(err.peer(), Some(peer_id));
        assert!(!err.is_cancelled());

        assert!(!DownloadError::Timeout { peer_id }.is_protocol_fault());
        assert!(DownloadError::Cancelled.is_cancelled());
        assert!(DownloadError::Terminated.is_cancelled());
        assert!(DownloadError::Provider(ProviderError::MissingGenesis).is_fatal());
        assert_eq!(DownloadError::Stalled.peer(), None);
    }
}
