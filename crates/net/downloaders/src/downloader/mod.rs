//! The bulk synchronisation engine.

use crate::metrics::DownloaderMetrics;
use dos_interfaces::{
    consensus::Consensus,
    executor::BlockExecutor,
    p2p::{
        error::{DownloadError, DownloadResult},
        peer::{EthPeer, PeerReporter},
    },
    provider::ProviderError,
};
use dos_metrics::SharedMetrics;
use dos_peers::{Peer, PeerRegistry, RequestKind};
use dos_primitives::{
    BlockBody, BlockNumHash, BlockNumber, Bytes, Header, PeerId, Receipt, SyncMode, B256, U256,
};
use dos_provider::ChainProvider;
use parking_lot::Mutex;
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

mod run;
mod state;

use run::SyncRun;

/// The transport handle the downloader sends requests through.
pub type SyncPeer = Arc<dyn EthPeer>;

/// The registry of peers the downloader draws from.
pub type SyncRegistry = PeerRegistry<SyncPeer>;

pub(crate) type RunPeer = Arc<Peer<SyncPeer>>;

/// Tuning of the [`Downloader`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloaderConfig {
    /// Number of skeleton headers requested from the master peer at once.
    pub skeleton_size: u64,
    /// Distance between skeleton headers, equal to the size of one fill request.
    pub fill_batch: u64,
    /// Upper bound of bodies in one request.
    pub max_block_fetch: usize,
    /// Upper bound of receipt lists in one request.
    pub max_receipt_fetch: usize,
    /// Upper bound of state nodes in one request.
    pub max_state_fetch: usize,
    /// Round trip time requests are sized for.
    pub request_ttl: Duration,
    /// Time after which an unanswered request expires.
    pub request_timeout: Duration,
    /// Number of expired requests after which a peer is dropped from the run.
    pub peer_timeout_limit: usize,
    /// Upper bound of downloaded blocks waiting to be committed.
    pub max_buffered_blocks: usize,
    /// Distance of the fast sync pivot block from the head.
    pub pivot_distance: u64,
    /// Maximum depth of the common ancestor below the local head.
    pub max_fork_ancestry: u64,
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        Self {
            skeleton_size: 128,
            fill_batch: 192,
            max_block_fetch: RequestKind::Bodies.max_fetch(),
            max_receipt_fetch: RequestKind::Receipts.max_fetch(),
            max_state_fetch: RequestKind::NodeData.max_fetch(),
            request_ttl: Duration::from_secs(3),
            request_timeout: Duration::from_secs(10),
            peer_timeout_limit: 3,
            max_buffered_blocks: 8192,
            pivot_distance: 64,
            max_fork_ancestry: 90_000,
        }
    }
}

/// A successful synchronisation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// The local chain was extended.
    Synced {
        /// The common ancestor the run started from.
        origin: BlockNumber,
        /// The new local head.
        head: BlockNumHash,
    },
    /// The local chain is already at least as heavy as the peer's.
    NoImprovement,
}

/// Progress of the current or last synchronisation run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncProgress {
    /// Block the run started at.
    pub starting: BlockNumber,
    /// Block the run has reached.
    pub current: BlockNumber,
    /// Highest block advertised by the master peer.
    pub highest: BlockNumber,
    /// State nodes downloaded.
    pub pulled_states: u64,
    /// State nodes known to be needed.
    pub known_states: u64,
}

/// A response handed to the active run.
#[derive(Debug)]
pub(crate) enum Delivery {
    Headers(PeerId, Vec<Header>),
    Bodies(PeerId, Vec<BlockBody>),
    Receipts(PeerId, Vec<Vec<Receipt>>),
    NodeData(PeerId, Vec<Bytes>),
}

impl Delivery {
    const fn kind(&self) -> RequestKind {
        match self {
            Delivery::Headers(..) => RequestKind::Headers,
            Delivery::Bodies(..) => RequestKind::Bodies,
            Delivery::Receipts(..) => RequestKind::Receipts,
            Delivery::NodeData(..) => RequestKind::NodeData,
        }
    }

    fn len(&self) -> usize {
        match self {
            Delivery::Headers(_, items) => items.len(),
            Delivery::Bodies(_, items) => items.len(),
            Delivery::Receipts(_, items) => items.len(),
            Delivery::NodeData(_, items) => items.len(),
        }
    }
}

#[derive(Debug)]
struct ActiveRun {
    cancel: CancellationToken,
    deliveries: UnboundedSender<Delivery>,
}

/// Synchronises the local chain with the network.
///
/// At most one run is active at a time. Responses of peers are handed to the active run through
/// the `deliver_*` methods; responses arriving while no run is active are dropped.
pub struct Downloader {
    pub(crate) config: DownloaderConfig,
    pub(crate) provider: ChainProvider,
    pub(crate) registry: Arc<SyncRegistry>,
    pub(crate) consensus: Arc<dyn Consensus>,
    pub(crate) executor: Arc<dyn BlockExecutor>,
    pub(crate) reporter: Arc<dyn PeerReporter>,
    pub(crate) metrics: DownloaderMetrics,
    cancel: CancellationToken,
    busy: AtomicBool,
    active: Mutex<Option<ActiveRun>>,
    pub(crate) progress: Mutex<SyncProgress>,
}

impl std::fmt::Debug for Downloader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Downloader")
            .field("config", &self.config)
            .field("synchronising", &self.synchronising())
            .field("progress", &*self.progress.lock())
            .finish_non_exhaustive()
    }
}

/// Resets the busy flag when a run ends, even if its future is dropped.
struct RunGuard<'a>(&'a Downloader);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.active.lock().take();
        for peer in self.0.registry.peers() {
            peer.reset();
        }
        self.0.busy.store(false, Ordering::SeqCst);
    }
}

impl Downloader {
    /// Creates a new downloader.
    ///
    /// `cancel` is the parent of every run's cancellation token, cancelling it terminates the
    /// downloader.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: DownloaderConfig,
        provider: ChainProvider,
        registry: Arc<SyncRegistry>,
        consensus: Arc<dyn Consensus>,
        executor: Arc<dyn BlockExecutor>,
        reporter: Arc<dyn PeerReporter>,
        metrics: SharedMetrics,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            provider,
            registry,
            consensus,
            executor,
            reporter,
            metrics: DownloaderMetrics::new(metrics),
            cancel,
            busy: AtomicBool::new(false),
            active: Mutex::new(None),
            progress: Mutex::new(SyncProgress::default()),
        }
    }

    /// The configuration of the downloader.
    pub fn config(&self) -> &DownloaderConfig {
        &self.config
    }

    /// The peer registry the downloader draws from.
    pub fn registry(&self) -> &Arc<SyncRegistry> {
        &self.registry
    }

    /// Returns true while a run is active.
    pub fn synchronising(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    /// Progress of the current or last run.
    pub fn progress(&self) -> SyncProgress {
        *self.progress.lock()
    }

    /// Aborts the active run, if any. The run reports [`DownloadError::Cancelled`].
    pub fn cancel(&self) {
        if let Some(run) = self.active.lock().as_ref() {
            debug!(target: "sync::downloader", "Cancelling synchronisation");
            run.cancel.cancel();
        }
    }

    /// Aborts the active run and rejects all future runs.
    pub fn terminate(&self) {
        debug!(target: "sync::downloader", "Terminating downloader");
        self.cancel.cancel();
    }

    /// Total difficulty of the local head relevant to the mode.
    pub(crate) fn local_td(&self, mode: SyncMode) -> DownloadResult<(BlockNumHash, U256)> {
        let head = match mode {
            SyncMode::Full => self.provider.head_block()?,
            SyncMode::Fast => self.provider.head_fast_block()?,
            SyncMode::Light | SyncMode::LightOnly => self.provider.head_header()?,
        };
        let td = self.provider.td(head.number, head.hash())?.ok_or(
            ProviderError::TotalDifficultyNotFound {
                block_number: head.number,
                block_hash: head.hash(),
            },
        )?;
        Ok((head.num_hash(), td))
    }

    /// Synchronises with the peer, which advertised `head_hash` with total difficulty
    /// `head_td`.
    ///
    /// Fails with [`DownloadError::Busy`] right away if another run is active.
    pub async fn synchronise(
        &self,
        peer_id: PeerId,
        head_hash: B256,
        head_td: U256,
        mode: SyncMode,
    ) -> DownloadResult<SyncOutcome> {
        if self.cancel.is_cancelled() {
            return Err(DownloadError::Terminated)
        }
        if self.busy.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_err() {
            return Err(DownloadError::Busy)
        }
        let _guard = RunGuard(self);

        let result = self.start_run(peer_id, head_hash, head_td, mode).await;
        match &result {
            Ok(SyncOutcome::Synced { origin, head }) => {
                info!(target: "sync::downloader", %peer_id, %mode, origin, number = head.number, hash = %head.hash, "Synchronisation completed");
            }
            Ok(SyncOutcome::NoImprovement) => {
                debug!(target: "sync::downloader", %peer_id, "Local chain is at least as heavy");
            }
            Err(err) => {
                self.metrics.increment_errors(err);
                warn!(target: "sync::downloader", %peer_id, %mode, %err, "Synchronisation failed");
            }
        }
        match result {
            Err(err) if err.is_cancelled() && self.cancel.is_cancelled() => {
                Err(DownloadError::Terminated)
            }
            result => result,
        }
    }

    async fn start_run(
        &self,
        peer_id: PeerId,
        head_hash: B256,
        head_td: U256,
        mode: SyncMode,
    ) -> DownloadResult<SyncOutcome> {
        if self.registry.is_empty() {
            return Err(DownloadError::NoPeers)
        }
        let master = self.registry.get(&peer_id).ok_or(DownloadError::UnknownPeer(peer_id))?;

        let (local, local_td) = self.local_td(mode)?;
        if head_td <= local_td {
            return Ok(SyncOutcome::NoImprovement)
        }
        debug!(target: "sync::downloader", %peer_id, %head_hash, %head_td, local = local.number, %local_td, %mode, "Synchronising with peer");

        let cancel = self.cancel.child_token();
        let (tx, rx) = unbounded_channel();
        *self.active.lock() = Some(ActiveRun { cancel: cancel.clone(), deliveries: tx });
        for peer in self.registry.peers() {
            peer.reset();
        }
        *self.progress.lock() = SyncProgress { starting: local.number, ..Default::default() };

        SyncRun::new(self, mode, master, head_hash, head_td, cancel, rx).run().await
    }

    fn deliver(&self, delivery: Delivery) -> bool {
        let (kind, len) = (delivery.kind(), delivery.len());
        let accepted = match self.active.lock().as_ref() {
            Some(run) => run.deliveries.send(delivery).is_ok(),
            None => false,
        };
        if !accepted {
            self.metrics.dropped(kind, len);
        }
        accepted
    }

    /// Hands headers received from a peer to the active run.
    ///
    /// Returns false if no run is active.
    pub fn deliver_headers(&self, peer_id: PeerId, headers: Vec<Header>) -> bool {
        self.deliver(Delivery::Headers(peer_id, headers))
    }

    /// Hands block bodies received from a peer to the active run.
    pub fn deliver_bodies(&self, peer_id: PeerId, bodies: Vec<BlockBody>) -> bool {
        self.deliver(Delivery::Bodies(peer_id, bodies))
    }

    /// Hands receipts received from a peer to the active run.
    pub fn deliver_receipts(&self, peer_id: PeerId, receipts: Vec<Vec<Receipt>>) -> bool {
        self.deliver(Delivery::Receipts(peer_id, receipts))
    }

    /// Hands state trie nodes received from a peer to the active run.
    pub fn deliver_node_data(&self, peer_id: PeerId, nodes: Vec<Bytes>) -> bool {
        self.deliver(Delivery::NodeData(peer_id, nodes))
    }
}

#[cfg(test)]
mod tests;
