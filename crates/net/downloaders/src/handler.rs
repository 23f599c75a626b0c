//! Glue between the peer connections and the synchronisation components.

use crate::{
    downloader::{Downloader, SyncOutcome, SyncPeer, SyncRegistry},
    fetcher::FetcherHandle,
};
use dos_interfaces::p2p::{
    error::DownloadError,
    message::EthMessage,
    peer::{PeerReporter, ReputationChangeKind},
};
use dos_peers::{Capabilities, PeerEvent, RegistryError};
use dos_primitives::{PeerId, SyncMode, B256, U256};
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::{mpsc::UnboundedReceiver, Notify},
    time::{interval, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Routes the messages of connected peers to the fetcher and the downloader.
///
/// Responses pass the fetcher's filters first, whatever it did not request goes to the
/// downloader's active run.
#[derive(Debug, Clone)]
pub struct SyncHandler {
    registry: Arc<SyncRegistry>,
    downloader: Arc<Downloader>,
    fetcher: FetcherHandle,
    wake: Arc<Notify>,
}

impl SyncHandler {
    /// Creates a handler over the downloader's peer registry.
    pub fn new(downloader: Arc<Downloader>, fetcher: FetcherHandle) -> Self {
        Self {
            registry: Arc::clone(downloader.registry()),
            downloader,
            fetcher,
            wake: Arc::new(Notify::new()),
        }
    }

    /// Signalled whenever a peer advertises a heavier chain.
    pub fn wake(&self) -> Arc<Notify> {
        Arc::clone(&self.wake)
    }

    /// Registers a newly connected peer with the head it advertised in its handshake.
    pub fn register_peer(
        &self,
        peer_id: PeerId,
        handle: SyncPeer,
        capabilities: Capabilities,
        head: B256,
        td: U256,
    ) -> Result<(), RegistryError> {
        self.registry.register(peer_id, handle, capabilities, head, td)?;
        Ok(())
    }

    /// Removes a disconnected peer, its outstanding requests are reassigned.
    pub fn unregister_peer(&self, peer_id: &PeerId) {
        if let Err(err) = self.registry.unregister(peer_id) {
            trace!(target: "sync::handler", %peer_id, %err, "Peer was not registered");
        }
    }

    /// Handles one message received from the peer.
    pub async fn on_message(&self, peer_id: PeerId, message: EthMessage) {
        let now = Instant::now();
        match message {
            EthMessage::NewBlockHashes(announces) => {
                for announce in announces {
                    self.fetcher.notify(peer_id, announce.hash, announce.number, now);
                }
            }
            EthMessage::NewBlock { block, td } => {
                let block = block.seal_slow();
                // the sender has the parent, the block itself may still be unverified
                let head_td = td.saturating_sub(block.difficulty);
                if let Some(peer) = self.registry.get(&peer_id) {
                    if head_td > peer.td() {
                        peer.set_head(block.parent_hash, head_td);
                        self.wake.notify_one();
                    }
                }
                self.fetcher.enqueue(peer_id, block);
            }
            EthMessage::BlockHeaders(headers) => {
                // single headers are the only kind of answer the fetcher asks for
                let filter = headers.len() == 1;
                let headers = if filter {
                    self.fetcher.filter_headers(peer_id, headers, now).await
                } else {
                    headers
                };
                if !headers.is_empty() || !filter {
                    self.downloader.deliver_headers(peer_id, headers);
                }
            }
            EthMessage::BlockBodies(bodies) => {
                let filter = !bodies.is_empty();
                let bodies = if filter {
                    self.fetcher.filter_bodies(peer_id, bodies, now).await
                } else {
                    bodies
                };
                if !bodies.is_empty() || !filter {
                    self.downloader.deliver_bodies(peer_id, bodies);
                }
            }
            EthMessage::Receipts(receipts) => {
                self.downloader.deliver_receipts(peer_id, receipts);
            }
            EthMessage::NodeData(nodes) => {
                self.downloader.deliver_node_data(peer_id, nodes);
            }
            request => {
                trace!(target: "sync::handler", %peer_id, ?request, "Ignoring request, serving is handled elsewhere");
            }
        }
    }
}

/// Tuning of the [`ChainSyncer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainSyncerConfig {
    /// Mode of the first synchronisation, fast sync falls back to full sync once it succeeded.
    pub mode: SyncMode,
    /// Interval after which a synchronisation is attempted even with few peers.
    pub force_sync_interval: Duration,
    /// Number of connected peers that triggers a synchronisation.
    pub min_sync_peers: usize,
}

impl Default for ChainSyncerConfig {
    fn default() -> Self {
        Self { mode: SyncMode::Fast, force_sync_interval: Duration::from_secs(10), min_sync_peers: 5 }
    }
}

/// Decides when to synchronise and with whom.
#[must_use = "ChainSyncer does nothing unless run"]
#[derive(Debug)]
pub struct ChainSyncer {
    config: ChainSyncerConfig,
    downloader: Arc<Downloader>,
    registry: Arc<SyncRegistry>,
    reporter: Arc<dyn PeerReporter>,
    events: UnboundedReceiver<PeerEvent>,
    wake: Arc<Notify>,
}

impl ChainSyncer {
    /// Creates the syncer, `wake` triggers an attempt outside of the regular schedule.
    pub fn new(
        config: ChainSyncerConfig,
        downloader: Arc<Downloader>,
        reporter: Arc<dyn PeerReporter>,
        wake: Arc<Notify>,
    ) -> Self {
        let registry = Arc::clone(downloader.registry());
        Self { config, events: registry.subscribe(), downloader, registry, reporter, wake }
    }

    /// The mode of the next synchronisation.
    pub const fn mode(&self) -> SyncMode {
        self.config.mode
    }

    /// Attempts synchronisations until cancelled.
    pub async fn run(mut self, cancel: CancellationToken) {
        let mut force = interval(self.config.force_sync_interval);
        force.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes right away
        force.tick().await;
        loop {
            let forced = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                Some(event) = self.events.recv() => match event {
                    PeerEvent::Registered(_) => false,
                    _ => continue,
                },
                _ = self.wake.notified() => false,
                _ = force.tick() => true,
            };
            self.try_sync(forced).await;
        }
        debug!(target: "sync::handler", "Chain syncer stopped");
    }

    async fn try_sync(&mut self, forced: bool) {
        if self.downloader.synchronising() {
            return
        }
        if !forced && self.registry.len() < self.config.min_sync_peers {
            return
        }
        let Some(peer) = self.registry.best_peer() else { return };
        let (head, td) = peer.head();
        match self.downloader.local_td(self.config.mode) {
            Ok((_, local_td)) if td <= local_td => return,
            Ok(_) => {}
            Err(err) => {
                warn!(target: "sync::handler", %err, "Failed to read local total difficulty");
                return
            }
        }

        let mode = self.config.mode;
        match self.downloader.synchronise(peer.id(), head, td, mode).await {
            Ok(SyncOutcome::Synced { .. }) => {
                if mode == SyncMode::Fast {
                    info!(target: "sync::handler", "Fast sync complete, switching to full sync");
                    self.config.mode = SyncMode::Full;
                }
            }
            Ok(SyncOutcome::NoImprovement) => {}
            Err(err) => self.on_sync_error(err),
        }
    }

    fn on_sync_error(&self, err: DownloadError) {
        if !err.is_protocol_fault() {
            return
        }
        let Some(peer_id) = err.peer() else { return };
        let kind = match err {
            DownloadError::BadBlock { .. } => ReputationChangeKind::BadBlock,
            _ => ReputationChangeKind::BadProtocol,
        };
        warn!(target: "sync::handler", %peer_id, %err, "Dropping peer for protocol violation");
        self.reporter.report(peer_id, kind);
        if let Err(err) = self.registry.unregister(&peer_id) {
            trace!(target: "sync::handler", %peer_id, %err, "Peer already gone");
        }
    }
}
