use crate::request::LightRequest;
use dos_interfaces::p2p::error::RequestResult;
use dos_peers::{Peer, PeerRegistry};
use dos_primitives::{BlockNumber, PeerId};
use std::{fmt::Debug, sync::Arc};

/// A handle to a connected light server.
///
/// Like [`EthPeer`](dos_interfaces::p2p::peer::EthPeer) requests are fire-and-forget, the
/// answer is handed to [`RetrieveManager::deliver`](crate::RetrieveManager::deliver) by the
/// session once it arrives.
pub trait LightPeer: Debug + Send + Sync {
    /// The id of the remote peer.
    fn id(&self) -> PeerId;

    /// Send the request tagged with `request_id`.
    fn request(&self, request_id: u64, request: &LightRequest) -> RequestResult<()>;

    /// Highest block the server announced, requests above it are not sent to it.
    fn head_number(&self) -> BlockNumber;

    /// Returns true if the server can be expected to answer the request.
    fn can_serve(&self, request: &LightRequest) -> bool {
        request.block_number().map_or(true, |number| number <= self.head_number())
    }
}

impl<T: LightPeer + ?Sized> LightPeer for Arc<T> {
    fn id(&self) -> PeerId {
        (**self).id()
    }

    fn request(&self, request_id: u64, request: &LightRequest) -> RequestResult<()> {
        (**self).request(request_id, request)
    }

    fn head_number(&self) -> BlockNumber {
        (**self).head_number()
    }

    fn can_serve(&self, request: &LightRequest) -> bool {
        (**self).can_serve(request)
    }
}

/// Transport handle stored in the [`ServerRegistry`].
pub type ServerHandle = Arc<dyn LightPeer>;

/// The registry of connected light servers.
pub type ServerRegistry = PeerRegistry<ServerHandle>;

/// A registered light server.
pub type Server = Arc<Peer<ServerHandle>>;
