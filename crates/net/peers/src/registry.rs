use crate::peer::{Capabilities, Peer, RequestKind};
use dos_primitives::{PeerId, B256, U256};
use parking_lot::{Mutex, RwLock};
use std::{collections::HashMap, fmt, sync::Arc};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::{debug, trace};

/// Events emitted by the [`PeerRegistry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerEvent {
    /// A peer was registered.
    Registered(PeerId),
    /// A peer was unregistered, all of its outstanding work must be requeued.
    Unregistered(PeerId),
    /// A peer became idle for a request kind.
    Idle(PeerId, RequestKind),
}

/// Errors of registry operations.
#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum RegistryError {
    /// The peer is already registered.
    #[error("peer {0} is already registered")]
    AlreadyRegistered(PeerId),
    /// The peer is not registered.
    #[error("peer {0} is not registered")]
    NotRegistered(PeerId),
    /// The registry has been closed.
    #[error("peer registry is closed")]
    Closed,
}

/// Subscribers to [`PeerEvent`]s.
#[derive(Debug, Default)]
pub(crate) struct Listeners {
    senders: Mutex<Vec<UnboundedSender<PeerEvent>>>,
}

impl Listeners {
    pub(crate) fn notify(&self, event: PeerEvent) {
        self.senders.lock().retain(|tx| tx.send(event).is_ok());
    }

    fn subscribe(&self) -> UnboundedReceiver<PeerEvent> {
        let (tx, rx) = unbounded_channel();
        self.senders.lock().push(tx);
        rx
    }

    fn clear(&self) {
        self.senders.lock().clear();
    }
}

struct RegistryInner<H> {
    peers: HashMap<PeerId, Arc<Peer<H>>>,
    next_seq: u64,
    closed: bool,
}

/// The set of connected peers the synchronisation engine may use.
///
/// Registration and removal are linearised through one lock: once [`PeerRegistry::unregister`]
/// returns, the peer is no longer returned by any lookup and subscribers have been told to
/// requeue its work.
pub struct PeerRegistry<H> {
    inner: RwLock<RegistryInner<H>>,
    listeners: Arc<Listeners>,
}

impl<H> fmt::Debug for PeerRegistry<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("PeerRegistry")
            .field("peers", &inner.peers.len())
            .field("closed", &inner.closed)
            .finish()
    }
}

impl<H> Default for PeerRegistry<H> {
    fn default() -> Self {
        Self {
            inner: RwLock::new(RegistryInner { peers: HashMap::new(), next_seq: 0, closed: false }),
            listeners: Arc::default(),
        }
    }
}

impl<H> PeerRegistry<H> {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new peer.
    pub fn register(
        &self,
        id: PeerId,
        handle: H,
        capabilities: Capabilities,
        head: B256,
        td: U256,
    ) -> Result<Arc<Peer<H>>, RegistryError> {
        let peer = {
            let mut inner = self.inner.write();
            if inner.closed {
                return Err(RegistryError::Closed)
            }
            if inner.peers.contains_key(&id) {
                return Err(RegistryError::AlreadyRegistered(id))
            }
            let seq = inner.next_seq;
            inner.next_seq += 1;
            let peer = Arc::new(Peer::new(
                id,
                handle,
                capabilities,
                head,
                td,
                seq,
                Arc::clone(&self.listeners),
            ));
            inner.peers.insert(id, Arc::clone(&peer));
            // notify while holding the lock so events are ordered like the registrations
            self.listeners.notify(PeerEvent::Registered(id));
            peer
        };
        debug!(target: "sync::peers", peer_id = %id, %td, "Registered peer");
        Ok(peer)
    }

    /// Removes a peer.
    pub fn unregister(&self, id: &PeerId) -> Result<Arc<Peer<H>>, RegistryError> {
        let peer = {
            let mut inner = self.inner.write();
            let peer = inner.peers.remove(id).ok_or(RegistryError::NotRegistered(*id))?;
            self.listeners.notify(PeerEvent::Unregistered(*id));
            peer
        };
        debug!(target: "sync::peers", peer_id = %id, "Unregistered peer");
        Ok(peer)
    }

    /// Looks up a peer.
    pub fn get(&self, id: &PeerId) -> Option<Arc<Peer<H>>> {
        self.inner.read().peers.get(id).cloned()
    }

    /// Returns true if the peer is registered.
    pub fn contains(&self, id: &PeerId) -> bool {
        self.inner.read().peers.contains_key(id)
    }

    /// Number of registered peers.
    pub fn len(&self) -> usize {
        self.inner.read().peers.len()
    }

    /// Returns true if no peer is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All peers in registration order.
    pub fn peers(&self) -> Vec<Arc<Peer<H>>> {
        let mut peers: Vec<_> = self.inner.read().peers.values().cloned().collect();
        peers.sort_by_key(|peer| peer.seq());
        peers
    }

    /// Peers that serve the kind and are idle for it, fastest first.
    ///
    /// Peers with equal throughput keep their registration order.
    pub fn idle_peers(&self, kind: RequestKind) -> Vec<Arc<Peer<H>>> {
        let mut peers: Vec<_> = self
            .peers()
            .into_iter()
            .filter(|peer| peer.supports(kind) && peer.is_idle(kind))
            .collect();
        peers.sort_by(|a, b| b.throughput(kind).total_cmp(&a.throughput(kind)));
        trace!(target: "sync::peers", %kind, idle = peers.len(), "Collected idle peers");
        peers
    }

    /// The peer advertising the highest total difficulty, earliest registered on ties.
    pub fn best_peer(&self) -> Option<Arc<Peer<H>>> {
        let mut best: Option<Arc<Peer<H>>> = None;
        for peer in self.peers() {
            if best.as_ref().map_or(true, |b| peer.td() > b.td()) {
                best = Some(peer);
            }
        }
        best
    }

    /// Subscribes to registry events.
    pub fn subscribe(&self) -> UnboundedReceiver<PeerEvent> {
        self.listeners.subscribe()
    }

    /// Closes the registry: all peers are removed and further registrations fail.
    pub fn close(&self) {
        let mut inner = self.inner.write();
        inner.closed = true;
        for id in inner.peers.keys() {
            self.listeners.notify(PeerEvent::Unregistered(*id));
        }
        inner.peers.clear();
        self.listeners.clear();
    }
}
