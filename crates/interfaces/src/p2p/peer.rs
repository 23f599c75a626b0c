use crate::p2p::error::RequestResult;
use dos_primitives::{HeadersRequest, PeerId, B256};
use std::{fmt::Debug, sync::Arc};

/// A handle to a connected full peer speaking the eth protocol.
///
/// Requests are fire-and-forget: the answer arrives later as an
/// [`EthMessage`](crate::p2p::message::EthMessage) on the peer's session and is delivered to the
/// component that asked for it. Only a failure to hand the request to the session is reported
/// here.
pub trait EthPeer: Debug + Send + Sync {
    /// The id of the remote peer.
    fn id(&self) -> PeerId;

    /// Send a `GetBlockHeaders` request.
    fn request_headers(&self, request: HeadersRequest) -> RequestResult<()>;

    /// Send a `GetBlockBodies` request.
    fn request_bodies(&self, hashes: Vec<B256>) -> RequestResult<()>;

    /// Send a `GetReceipts` request.
    fn request_receipts(&self, hashes: Vec<B256>) -> RequestResult<()>;

    /// Send a `GetNodeData` request.
    fn request_node_data(&self, hashes: Vec<B256>) -> RequestResult<()>;
}

impl<T: EthPeer + ?Sized> EthPeer for Arc<T> {
    fn id(&self) -> PeerId {
        (**self).id()
    }

    fn request_headers(&self, request: HeadersRequest) -> RequestResult<()> {
        (**self).request_headers(request)
    }

    fn request_bodies(&self, hashes: Vec<B256>) -> RequestResult<()> {
        (**self).request_bodies(hashes)
    }

    fn request_receipts(&self, hashes: Vec<B256>) -> RequestResult<()> {
        (**self).request_receipts(hashes)
    }

    fn request_node_data(&self, hashes: Vec<B256>) -> RequestResult<()> {
        (**self).request_node_data(hashes)
    }
}

/// Various kinds of reputation changes.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ReputationChangeKind {
    /// Received an unspecific bad message from the peer
    BadMessage,
    /// Peer sent a bad block.
    BadBlock,
    /// Peer sent a bad announcement message.
    BadAnnouncement,
    /// Peer failed to respond in time.
    Timeout,
    /// Peer does not adhere to network protocol rules.
    BadProtocol,
    /// Connection dropped by peer.
    Dropped,
}

impl ReputationChangeKind {
    /// Returns true if the peer should be disconnected right away.
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::BadProtocol | Self::BadBlock)
    }
}

/// Reports peer misbehaviour to whoever manages the connections.
pub trait PeerReporter: Debug + Send + Sync {
    /// Report the peer.
    fn report(&self, peer_id: PeerId, kind: ReputationChangeKind);
}

impl<T: PeerReporter + ?Sized> PeerReporter for Arc<T> {
    fn report(&self, peer_id: PeerId, kind: ReputationChangeKind) {
        (**self).report(peer_id, kind)
    }
}

/// A [`PeerReporter`] that ignores every report.
#[derive(Debug, Default, Clone, Copy)]
#[non_exhaustive]
pub struct NoopReporter;

impl PeerReporter for NoopReporter {
    fn report(&self, _peer_id: PeerId, _kind: ReputationChangeKind) {}
}
