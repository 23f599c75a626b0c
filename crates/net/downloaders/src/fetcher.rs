//! Retrieval of blocks that arrive out of band, through announcements and propagation.
//!
//! The [`Fetcher`] runs as a single task owning all of its state. Everything else talks to it
//! through a cloneable [`FetcherHandle`]:
//!
//! - an announced hash is gathered for `arrive_timeout`, giving the block a chance to be
//!   propagated in full, then its header is requested from the earliest announcer
//! - a header with a non-empty body is followed by a body request to the same peer
//! - complete blocks are queued and imported in number order once their parent is known
//! - responses of peers first pass the `filter_*` calls, which claim what the fetcher asked
//!   for and hand everything else back to the caller

use crate::{downloader::SyncRegistry, metrics::FetcherMetrics};
use dos_interfaces::{
    consensus::{Consensus, ConsensusError},
    executor::{BlockExecutor, ExecutionError},
    p2p::peer::{EthPeer, PeerReporter, ReputationChangeKind},
    provider::ProviderError,
};
use dos_metrics::SharedMetrics;
use dos_peers::PeerEvent;
use dos_primitives::{
    BlockBody, BlockNumber, Header, HeadersRequest, PeerId, SealedBlock, SealedHeader, B256,
};
use dos_provider::{BlockHead, ChainProvider};
use futures::StreamExt;
use std::{
    collections::{BTreeSet, HashMap},
    fmt::Debug,
    sync::Arc,
    time::Duration,
};
use tokio::{
    sync::{
        mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
        oneshot,
    },
    time::{interval, Instant, MissedTickBehavior},
};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Tuning of the [`Fetcher`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetcherConfig {
    /// Time allowed for a propagated block to arrive after its announcement.
    pub arrive_timeout: Duration,
    /// Interval used to collate almost-expired announces with fetches.
    pub gather_slack: Duration,
    /// Time allowed for a header or body request to be answered.
    pub fetch_timeout: Duration,
    /// Maximum depth of a block below the local head to still be imported.
    pub max_uncle_dist: u64,
    /// Maximum height of a block above the local head to be queued.
    pub max_queue_dist: u64,
    /// Maximum number of unfetched announcements per peer.
    pub hash_limit: usize,
    /// Maximum number of queued blocks per peer.
    pub block_limit: usize,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            arrive_timeout: Duration::from_millis(500),
            gather_slack: Duration::from_millis(100),
            fetch_timeout: Duration::from_secs(5),
            max_uncle_dist: 7,
            max_queue_dist: 32,
            hash_limit: 256,
            block_limit: 64,
        }
    }
}

/// Failure to import a block retrieved by the fetcher.
#[derive(Debug, thiserror::Error)]
pub enum ImportError {
    /// The parent of the block is not stored.
    #[error("unknown parent {0}")]
    UnknownParent(B256),
    /// The header breaks the consensus rules.
    #[error(transparent)]
    Consensus(#[from] ConsensusError),
    /// Executing the block failed.
    #[error(transparent)]
    Execution(#[from] ExecutionError),
    /// Local storage failed.
    #[error(transparent)]
    Provider(#[from] ProviderError),
}

impl ImportError {
    /// Returns true if the peer that delivered the block is to blame.
    pub const fn is_bad_block(&self) -> bool {
        matches!(self, Self::Consensus(_) | Self::Execution(_))
    }
}

/// The local chain as seen by the [`Fetcher`].
pub trait FetcherChain: Debug + Send + Sync {
    /// Returns true if the block is stored locally.
    fn has_block(&self, hash: B256) -> bool;

    /// Number of the local head block.
    fn chain_height(&self) -> BlockNumber;

    /// Validates a header against its stored parent.
    fn verify_header(&self, header: &SealedHeader) -> Result<(), ImportError>;

    /// Executes and stores the block.
    fn insert_block(&self, block: &SealedBlock) -> Result<(), ImportError>;

    /// Relays the block to other peers, in full if `propagate` is set, by hash otherwise.
    fn broadcast_block(&self, block: &SealedBlock, propagate: bool);
}

impl<T: FetcherChain + ?Sized> FetcherChain for Arc<T> {
    fn has_block(&self, hash: B256) -> bool {
        (**self).has_block(hash)
    }

    fn chain_height(&self) -> BlockNumber {
        (**self).chain_height()
    }

    fn verify_header(&self, header: &SealedHeader) -> Result<(), ImportError> {
        (**self).verify_header(header)
    }

    fn insert_block(&self, block: &SealedBlock) -> Result<(), ImportError> {
        (**self).insert_block(block)
    }

    fn broadcast_block(&self, block: &SealedBlock, propagate: bool) {
        (**self).broadcast_block(block, propagate)
    }
}

/// A [`FetcherChain`] backed by the local database.
///
/// Blocks are executed before they are written, a block becomes the head only if it makes the
/// chain heavier. Relaying is left to the transport, which may listen on a relay channel.
#[derive(Debug, Clone)]
pub struct StoredChain {
    provider: ChainProvider,
    consensus: Arc<dyn Consensus>,
    executor: Arc<dyn BlockExecutor>,
    relay: Option<UnboundedSender<(SealedBlock, bool)>>,
}

impl StoredChain {
    /// Creates a chain over the provider.
    pub fn new(
        provider: ChainProvider,
        consensus: Arc<dyn Consensus>,
        executor: Arc<dyn BlockExecutor>,
    ) -> Self {
        Self { provider, consensus, executor, relay: None }
    }

    /// Sends every relayed block to the given channel.
    pub fn with_relay(mut self, relay: UnboundedSender<(SealedBlock, bool)>) -> Self {
        self.relay = Some(relay);
        self
    }
}

impl FetcherChain for StoredChain {
    fn has_block(&self, hash: B256) -> bool {
        match self.provider.block_number(hash) {
            Ok(Some(number)) => self.provider.has_block(number, hash).unwrap_or_default(),
            _ => false,
        }
    }

    fn chain_height(&self) -> BlockNumber {
        self.provider.head_block().map(|head| head.number).unwrap_or_default()
    }

    fn verify_header(&self, header: &SealedHeader) -> Result<(), ImportError> {
        let parent = self
            .provider
            .header_by_hash(header.parent_hash)?
            .ok_or(ImportError::UnknownParent(header.parent_hash))?;
        Ok(self.consensus.validate_header(header, &parent)?)
    }

    fn insert_block(&self, block: &SealedBlock) -> Result<(), ImportError> {
        let parent = block.number().saturating_sub(1);
        if !self.provider.has_block(parent, block.parent_hash)? {
            return Err(ImportError::UnknownParent(block.parent_hash))
        }
        self.consensus.validate_block_body(&block.header, &block.body)?;
        let receipts = self.executor.execute(block)?;

        // side chain blocks are stored without moving the head
        let local = self.provider.head_block()?;
        let local_td = self.provider.td(local.number, local.hash())?.unwrap_or_default();
        let parent_td = self.provider.td(parent, block.parent_hash)?.ok_or(
            ProviderError::TotalDifficultyNotFound { block_number: parent, block_hash: block.parent_hash },
        )?;
        let head =
            if parent_td + block.difficulty > local_td { BlockHead::Full } else { BlockHead::None };
        self.provider.insert_blocks(
            std::slice::from_ref(block),
            Some(std::slice::from_ref(&receipts)),
            head,
        )?;
        Ok(())
    }

    fn broadcast_block(&self, block: &SealedBlock, propagate: bool) {
        trace!(target: "sync::fetcher", number = block.number(), hash = %block.hash(), propagate, "Relaying block");
        if let Some(relay) = &self.relay {
            let _ = relay.send((block.clone(), propagate));
        }
    }
}

/// Commands sent from the [`FetcherHandle`] to the [`Fetcher`].
#[derive(Debug)]
enum FetcherCommand {
    Notify { peer_id: PeerId, hash: B256, number: BlockNumber, time: Instant },
    Enqueue { peer_id: PeerId, block: SealedBlock },
    FilterHeaders {
        peer_id: PeerId,
        headers: Vec<Header>,
        time: Instant,
        response: oneshot::Sender<Vec<Header>>,
    },
    FilterBodies {
        peer_id: PeerId,
        bodies: Vec<BlockBody>,
        time: Instant,
        response: oneshot::Sender<Vec<BlockBody>>,
    },
}

/// Front-end of the [`Fetcher`] task.
#[derive(Debug, Clone)]
pub struct FetcherHandle {
    commands: UnboundedSender<FetcherCommand>,
}

impl FetcherHandle {
    /// Announces that the peer has the block with the given hash and number.
    ///
    /// Returns false if the fetcher has shut down.
    pub fn notify(&self, peer_id: PeerId, hash: B256, number: BlockNumber, time: Instant) -> bool {
        self.commands.send(FetcherCommand::Notify { peer_id, hash, number, time }).is_ok()
    }

    /// Queues a block propagated in full by the peer for import.
    pub fn enqueue(&self, peer_id: PeerId, block: SealedBlock) -> bool {
        self.commands.send(FetcherCommand::Enqueue { peer_id, block }).is_ok()
    }

    /// Claims the headers the fetcher requested and returns the others.
    ///
    /// If the fetcher has shut down nothing is claimed.
    pub async fn filter_headers(
        &self,
        peer_id: PeerId,
        headers: Vec<Header>,
        time: Instant,
    ) -> Vec<Header> {
        let (tx, rx) = oneshot::channel();
        let command = FetcherCommand::FilterHeaders { peer_id, headers, time, response: tx };
        match self.commands.send(command) {
            Ok(()) => rx.await.unwrap_or_default(),
            Err(err) => match err.0 {
                FetcherCommand::FilterHeaders { headers, .. } => headers,
                _ => Vec::new(),
            },
        }
    }

    /// Claims the bodies the fetcher requested and returns the others.
    pub async fn filter_bodies(
        &self,
        peer_id: PeerId,
        bodies: Vec<BlockBody>,
        time: Instant,
    ) -> Vec<BlockBody> {
        let (tx, rx) = oneshot::channel();
        let command = FetcherCommand::FilterBodies { peer_id, bodies, time, response: tx };
        match self.commands.send(command) {
            Ok(()) => rx.await.unwrap_or_default(),
            Err(err) => match err.0 {
                FetcherCommand::FilterBodies { bodies, .. } => bodies,
                _ => Vec::new(),
            },
        }
    }
}

/// A peer's claim to have a block.
#[derive(Debug, Clone)]
struct Announce {
    hash: B256,
    number: BlockNumber,
    origin: PeerId,
    /// Arrival of the announcement, later of the header.
    time: Instant,
    /// When the pending header or body request was sent.
    requested: Option<Instant>,
    header: Option<SealedHeader>,
}

/// A complete block waiting for import.
#[derive(Debug)]
struct Inject {
    origin: PeerId,
    block: SealedBlock,
}

/// Retrieves and imports announced and propagated blocks.
///
/// Per hash an announce moves through `announced` (gathering), `fetching` (header requested),
/// `fetched` (header arrived, body pending) and `completing` (body requested). Announces of other
/// peers for a hash already being fetched are kept as `alternates` and take over if the chosen
/// announcer fails to answer.
#[must_use = "Fetcher does nothing unless run"]
pub struct Fetcher {
    config: FetcherConfig,
    chain: Arc<dyn FetcherChain>,
    registry: Arc<SyncRegistry>,
    reporter: Arc<dyn PeerReporter>,
    metrics: FetcherMetrics,
    commands: UnboundedReceiverStream<FetcherCommand>,
    events: UnboundedReceiver<PeerEvent>,

    /// Unforgotten announces per peer.
    announces: HashMap<PeerId, usize>,
    announced: HashMap<B256, Vec<Announce>>,
    alternates: HashMap<B256, Vec<Announce>>,
    fetching: HashMap<B256, Announce>,
    fetched: HashMap<B256, Announce>,
    completing: HashMap<B256, Announce>,

    /// Queued blocks per peer.
    queues: HashMap<PeerId, usize>,
    queue: BTreeSet<(BlockNumber, B256)>,
    queued: HashMap<B256, Inject>,
}

impl Debug for Fetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fetcher")
            .field("config", &self.config)
            .field("announced", &self.announced.len())
            .field("fetching", &self.fetching.len())
            .field("fetched", &self.fetched.len())
            .field("completing", &self.completing.len())
            .field("queued", &self.queued.len())
            .finish_non_exhaustive()
    }
}

impl Fetcher {
    /// Creates the fetcher and the handle to talk to it.
    pub fn new(
        config: FetcherConfig,
        chain: Arc<dyn FetcherChain>,
        registry: Arc<SyncRegistry>,
        reporter: Arc<dyn PeerReporter>,
        metrics: SharedMetrics,
    ) -> (Self, FetcherHandle) {
        let (tx, rx) = unbounded_channel();
        let fetcher = Self {
            config,
            chain,
            events: registry.subscribe(),
            registry,
            reporter,
            metrics: FetcherMetrics::new(metrics),
            commands: UnboundedReceiverStream::new(rx),
            announces: HashMap::new(),
            announced: HashMap::new(),
            alternates: HashMap::new(),
            fetching: HashMap::new(),
            fetched: HashMap::new(),
            completing: HashMap::new(),
            queues: HashMap::new(),
            queue: BTreeSet::new(),
            queued: HashMap::new(),
        };
        (fetcher, FetcherHandle { commands: tx })
    }

    /// Processes commands until cancelled or every handle is dropped.
    pub async fn run(mut self, cancel: CancellationToken) {
        let mut ticker = interval(self.config.gather_slack);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                command = self.commands.next() => match command {
                    Some(command) => self.on_command(command),
                    None => break,
                },
                Some(event) = self.events.recv() => self.on_peer_event(event),
                _ = ticker.tick() => self.on_tick(Instant::now()),
            }
            self.import_queued();
        }
        debug!(target: "sync::fetcher", "Block fetcher stopped");
    }

    fn on_command(&mut self, command: FetcherCommand) {
        match command {
            FetcherCommand::Notify { peer_id, hash, number, time } => {
                self.on_announce(peer_id, hash, number, time)
            }
            FetcherCommand::Enqueue { peer_id, block } => {
                self.metrics.broadcast_in();
                self.enqueue_block(peer_id, block);
            }
            FetcherCommand::FilterHeaders { peer_id, headers, time, response } => {
                let unknown = self.filter_headers(peer_id, headers, time);
                let _ = response.send(unknown);
            }
            FetcherCommand::FilterBodies { peer_id, bodies, time, response } => {
                let unknown = self.filter_bodies(peer_id, bodies, time);
                let _ = response.send(unknown);
            }
        }
    }

    fn on_peer_event(&mut self, event: PeerEvent) {
        if let PeerEvent::Unregistered(peer_id) = event {
            self.forget_peer(peer_id);
        }
    }

    /// Distance of the block from the local head is acceptable.
    fn within_distance(&self, number: BlockNumber) -> bool {
        let height = self.chain.chain_height();
        number.saturating_add(self.config.max_uncle_dist) >= height &&
            number <= height.saturating_add(self.config.max_queue_dist)
    }

    fn is_in_progress(&self, hash: &B256) -> bool {
        self.fetching.contains_key(hash) ||
            self.fetched.contains_key(hash) ||
            self.completing.contains_key(hash) ||
            self.queued.contains_key(hash)
    }

    // === announcements ===

    fn on_announce(&mut self, peer_id: PeerId, hash: B256, number: BlockNumber, time: Instant) {
        self.metrics.announce_in();

        let count = self.announces.get(&peer_id).copied().unwrap_or_default() + 1;
        if count > self.config.hash_limit {
            debug!(target: "sync::fetcher", %peer_id, limit = self.config.hash_limit, "Peer exceeded outstanding announces");
            self.metrics.announce_dos();
            return
        }
        if number > 0 && !self.within_distance(number) {
            debug!(target: "sync::fetcher", %peer_id, number, %hash, "Peer discarded announcement");
            self.metrics.announce_drop();
            return
        }
        if self.chain.has_block(hash) {
            trace!(target: "sync::fetcher", %peer_id, number, %hash, "Announced block already known");
            return
        }

        let announce = Announce { hash, number, origin: peer_id, time, requested: None, header: None };
        let list = if self.is_in_progress(&hash) {
            if self.queued.contains_key(&hash) {
                return
            }
            self.alternates.entry(hash).or_default()
        } else {
            self.announced.entry(hash).or_default()
        };
        if list.iter().any(|existing| existing.origin == peer_id) {
            return
        }
        list.push(announce);
        self.announces.insert(peer_id, count);
        trace!(target: "sync::fetcher", %peer_id, number, %hash, "Scheduled announced block");
    }

    fn on_tick(&mut self, now: Instant) {
        self.expire(now);
        self.request_headers(now);
        self.request_bodies(now);
    }

    /// Requests the headers of announces older than the arrival window.
    fn request_headers(&mut self, now: Instant) {
        let wait = self.config.arrive_timeout.saturating_sub(self.config.gather_slack);
        let due: Vec<B256> = self
            .announced
            .iter()
            .filter(|(_, list)| {
                list.iter().map(|announce| announce.time).min().map_or(false, |t| t + wait <= now)
            })
            .map(|(hash, _)| *hash)
            .collect();

        let mut requests: HashMap<PeerId, Vec<B256>> = HashMap::new();
        for hash in due {
            let Some(mut list) = self.announced.remove(&hash) else { continue };
            if self.chain.has_block(hash) {
                for announce in list {
                    self.release_announce(&announce);
                }
                continue
            }
            list.sort_by_key(|announce| announce.time);
            let mut announce = list.remove(0);
            if !list.is_empty() {
                self.alternates.entry(hash).or_default().extend(list);
            }
            announce.requested = Some(now);
            requests.entry(announce.origin).or_default().push(hash);
            self.fetching.insert(hash, announce);
        }

        for (peer_id, hashes) in requests {
            trace!(target: "sync::fetcher", %peer_id, count = hashes.len(), "Fetching scheduled headers");
            for hash in hashes {
                self.metrics.header_fetch();
                let sent = self
                    .registry
                    .get(&peer_id)
                    .map(|peer| peer.handle().request_headers(HeadersRequest::rising(hash, 1)));
                if !matches!(sent, Some(Ok(()))) {
                    self.fail_fetch(hash, now);
                }
            }
        }
    }

    /// Requests the bodies of headers that gathered for long enough.
    fn request_bodies(&mut self, now: Instant) {
        let due: Vec<B256> = self
            .fetched
            .iter()
            .filter(|(_, announce)| announce.time + self.config.gather_slack <= now)
            .map(|(hash, _)| *hash)
            .collect();

        let mut requests: HashMap<PeerId, Vec<B256>> = HashMap::new();
        for hash in due {
            let Some(mut announce) = self.fetched.remove(&hash) else { continue };
            if self.chain.has_block(hash) {
                self.forget_hash(hash);
                self.release_announce(&announce);
                continue
            }
            announce.requested = Some(now);
            requests.entry(announce.origin).or_default().push(hash);
            self.completing.insert(hash, announce);
        }

        for (peer_id, hashes) in requests {
            trace!(target: "sync::fetcher", %peer_id, count = hashes.len(), "Fetching scheduled bodies");
            self.metrics.body_fetch();
            let sent = self
                .registry
                .get(&peer_id)
                .map(|peer| peer.handle().request_bodies(hashes.clone()));
            if !matches!(sent, Some(Ok(()))) {
                for hash in hashes {
                    self.fail_fetch(hash, now);
                }
            }
        }
    }

    /// Fails header and body requests that were not answered in time.
    fn expire(&mut self, now: Instant) {
        let timeout = self.config.fetch_timeout;
        let expired = |announce: &Announce| announce.requested.map_or(false, |t| t + timeout <= now);
        let hashes: Vec<B256> = self
            .fetching
            .iter()
            .chain(self.completing.iter())
            .filter(|(_, announce)| expired(announce))
            .map(|(hash, _)| *hash)
            .collect();
        for hash in hashes {
            if let Some(announce) = self.fetching.get(&hash).or_else(|| self.completing.get(&hash)) {
                debug!(target: "sync::fetcher", peer_id = %announce.origin, %hash, "Block fetch timed out");
                self.reporter.report(announce.origin, ReputationChangeKind::Timeout);
            }
            self.fail_fetch(hash, now);
        }
    }

    /// Abandons the current fetch of the hash and hands it to the next-earliest announcer.
    fn fail_fetch(&mut self, hash: B256, now: Instant) {
        let Some(announce) = self.fetching.remove(&hash).or_else(|| self.completing.remove(&hash))
        else {
            return
        };
        self.release_announce(&announce);
        let Some(mut alternates) = self.alternates.remove(&hash) else { return };
        alternates.sort_by_key(|announce| announce.time);
        let mut next = alternates.remove(0);
        if !alternates.is_empty() {
            self.alternates.insert(hash, alternates);
        }
        trace!(target: "sync::fetcher", peer_id = %next.origin, %hash, "Falling back to next announcer");
        // already waited out the arrival window
        next.time = now.checked_sub(self.config.arrive_timeout).unwrap_or(next.time);
        self.announced.entry(hash).or_default().push(next);
    }

    // === filters ===

    fn filter_headers(&mut self, peer_id: PeerId, headers: Vec<Header>, time: Instant) -> Vec<Header> {
        let received = headers.len();
        let mut unknown = Vec::new();
        let mut complete = Vec::new();
        for header in headers {
            let hash = header.hash_slow();
            let claimed = self.fetching.get(&hash).map_or(false, |announce| {
                announce.origin == peer_id && !self.queued.contains_key(&hash)
            });
            if !claimed {
                unknown.push(header);
                continue
            }
            let Some(mut announce) = self.fetching.remove(&hash) else { continue };
            if announce.number > 0 && header.number != announce.number {
                warn!(target: "sync::fetcher", %peer_id, %hash, announced = announce.number, provided = header.number, "Invalid block number fetched");
                self.reporter.report(peer_id, ReputationChangeKind::BadAnnouncement);
                self.release_announce(&announce);
                self.fail_fetch_alternates(hash, time);
                continue
            }
            if self.chain.has_block(hash) {
                self.release_announce(&announce);
                self.forget_hash(hash);
                continue
            }
            let header = SealedHeader::new(header, hash);
            if header.is_empty_body() {
                trace!(target: "sync::fetcher", %peer_id, number = header.number, %hash, "Block empty, skipping body retrieval");
                self.release_announce(&announce);
                self.forget_hash(hash);
                complete.push(BlockBody::default().into_block(header));
            } else {
                announce.header = Some(header);
                announce.time = time;
                announce.requested = None;
                self.fetched.insert(hash, announce);
            }
        }
        self.metrics.filter_headers(received, unknown.len());
        for block in complete {
            self.enqueue_block(peer_id, block);
        }
        unknown
    }

    /// Restarts a hash whose announcer delivered garbage with the remaining announcers.
    fn fail_fetch_alternates(&mut self, hash: B256, now: Instant) {
        let Some(mut alternates) = self.alternates.remove(&hash) else { return };
        for announce in alternates.iter_mut() {
            announce.time = now.checked_sub(self.config.arrive_timeout).unwrap_or(announce.time);
        }
        self.announced.entry(hash).or_default().extend(alternates);
    }

    fn filter_bodies(
        &mut self,
        peer_id: PeerId,
        bodies: Vec<BlockBody>,
        _time: Instant,
    ) -> Vec<BlockBody> {
        let received = bodies.len();
        let mut unknown = Vec::new();
        let mut blocks = Vec::new();
        for body in bodies {
            let matched = self
                .completing
                .iter()
                .find(|(hash, announce)| {
                    announce.origin == peer_id &&
                        !self.queued.contains_key(*hash) &&
                        announce.header.as_ref().map_or(false, |header| body.matches(header))
                })
                .map(|(hash, _)| *hash);
            let Some(announce) = matched.and_then(|hash| self.completing.remove(&hash)) else {
                unknown.push(body);
                continue
            };
            self.release_announce(&announce);
            self.forget_hash(announce.hash);
            if let Some(header) = announce.header {
                blocks.push(body.into_block(header));
            }
        }
        self.metrics.filter_bodies(received, unknown.len());
        for block in blocks {
            self.enqueue_block(peer_id, block);
        }
        unknown
    }

    // === import ===

    fn enqueue_block(&mut self, peer_id: PeerId, block: SealedBlock) {
        let hash = block.hash();
        let count = self.queues.get(&peer_id).copied().unwrap_or_default() + 1;
        if count > self.config.block_limit {
            debug!(target: "sync::fetcher", %peer_id, number = block.number(), %hash, limit = self.config.block_limit, "Discarded propagated block, exceeded allowance");
            self.metrics.broadcast_dos();
            self.forget_hash(hash);
            return
        }
        if !self.within_distance(block.number()) {
            debug!(target: "sync::fetcher", %peer_id, number = block.number(), %hash, "Discarded propagated block, too far away");
            self.metrics.broadcast_drop();
            self.forget_hash(hash);
            return
        }
        if self.queued.contains_key(&hash) {
            return
        }
        self.forget_hash(hash);
        self.queues.insert(peer_id, count);
        self.queue.insert((block.number(), hash));
        trace!(target: "sync::fetcher", %peer_id, number = block.number(), %hash, queued = self.queue.len(), "Queued propagated block");
        self.queued.insert(hash, Inject { origin: peer_id, block });
    }

    /// Imports queued blocks in number order while they connect to the local chain.
    fn import_queued(&mut self) {
        let mut height = self.chain.chain_height();
        while let Some(&(number, hash)) = self.queue.first() {
            if number > height.saturating_add(1) {
                break
            }
            self.queue.pop_first();
            let Some(inject) = self.forget_block(hash) else { continue };
            if number.saturating_add(self.config.max_uncle_dist) < height || self.chain.has_block(hash) {
                continue
            }
            self.insert(inject);
            height = self.chain.chain_height();
        }
    }

    fn insert(&mut self, Inject { origin, block }: Inject) {
        let hash = block.hash();
        trace!(target: "sync::fetcher", peer_id = %origin, number = block.number(), %hash, "Importing propagated block");
        match self.chain.verify_header(&block.header) {
            Ok(()) => {}
            Err(ImportError::UnknownParent(parent)) => {
                debug!(target: "sync::fetcher", peer_id = %origin, number = block.number(), %hash, %parent, "Unknown parent of propagated block");
                return
            }
            Err(err) => {
                warn!(target: "sync::fetcher", peer_id = %origin, number = block.number(), %hash, %err, "Propagated block verification failed");
                self.reporter.report(origin, ReputationChangeKind::BadBlock);
                return
            }
        }

        // relay in full before the import, it may take a while
        self.metrics.broadcast_out();
        self.chain.broadcast_block(&block, true);

        match self.chain.insert_block(&block) {
            Ok(()) => {
                self.metrics.announce_out();
                self.chain.broadcast_block(&block, false);
            }
            Err(err) if err.is_bad_block() => {
                warn!(target: "sync::fetcher", peer_id = %origin, number = block.number(), %hash, %err, "Propagated block import failed");
                self.reporter.report(origin, ReputationChangeKind::BadBlock);
            }
            Err(err) => {
                debug!(target: "sync::fetcher", peer_id = %origin, number = block.number(), %hash, %err, "Propagated block not imported");
            }
        }
    }

    // === bookkeeping ===

    fn release_announce(&mut self, announce: &Announce) {
        if let Some(count) = self.announces.get_mut(&announce.origin) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.announces.remove(&announce.origin);
            }
        }
    }

    /// Removes every trace of an announced hash.
    fn forget_hash(&mut self, hash: B256) {
        let mut released: Vec<Announce> = Vec::new();
        released.extend(self.announced.remove(&hash).unwrap_or_default());
        released.extend(self.alternates.remove(&hash).unwrap_or_default());
        released.extend(self.fetching.remove(&hash));
        released.extend(self.fetched.remove(&hash));
        released.extend(self.completing.remove(&hash));
        for announce in &released {
            self.release_announce(announce);
        }
    }

    /// Removes a queued block, returning it.
    fn forget_block(&mut self, hash: B256) -> Option<Inject> {
        let inject = self.queued.remove(&hash)?;
        if let Some(count) = self.queues.get_mut(&inject.origin) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.queues.remove(&inject.origin);
            }
        }
        Some(inject)
    }

    /// Drops the announces of a departed peer and moves its fetches to other announcers.
    fn forget_peer(&mut self, peer_id: PeerId) {
        for list in self.announced.values_mut().chain(self.alternates.values_mut()) {
            list.retain(|announce| announce.origin != peer_id);
        }
        self.announced.retain(|_, list| !list.is_empty());
        self.alternates.retain(|_, list| !list.is_empty());

        let now = Instant::now();
        let orphaned: Vec<B256> = self
            .fetching
            .iter()
            .chain(self.completing.iter())
            .filter(|(_, announce)| announce.origin == peer_id)
            .map(|(hash, _)| *hash)
            .collect();
        for hash in orphaned {
            self.fail_fetch(hash, now);
        }
        let fetched: Vec<B256> = self
            .fetched
            .iter()
            .filter(|(_, announce)| announce.origin == peer_id)
            .map(|(hash, _)| *hash)
            .collect();
        for hash in fetched {
            self.fetched.remove(&hash);
            self.fail_fetch_alternates(hash, now);
        }
        self.announces.remove(&peer_id);
    }
}
