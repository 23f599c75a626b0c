//! A single synchronisation run.

use super::{state::StateSync, Delivery, Downloader, RunPeer, SyncOutcome, SyncPeer};
use crate::queue::{Delivered, FetchQueue, QueueError};
use dos_interfaces::{
    executor::ExecutionError,
    p2p::{
        error::{DownloadError, DownloadResult, RequestResult},
        headers::{ensure_parent, validate_header_download},
        peer::ReputationChangeKind,
    },
    provider::ProviderError,
};
use dos_peers::{PeerEvent, RequestKind};
use dos_primitives::{
    proofs::calculate_receipt_root, BlockBody, BlockNumber, Bytes, Header, HeadersRequest,
    PeerId, Receipt, SealedBlock, SealedHeader, SyncMode, B256, U256,
};
use dos_provider::BlockHead;
use std::{
    collections::{BTreeMap, HashMap, HashSet},
    time::Duration,
};
use tokio::{
    sync::mpsc::UnboundedReceiver,
    time::{interval, sleep, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

/// Upper bound of headers in the span request of the ancestor search.
const MAX_SPAN_HEADERS: u64 = 16;

/// Interval of request expiry checks.
const TICK: Duration = Duration::from_millis(100);

/// Upper bound of blocks written in one batch.
const COMMIT_BATCH: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MasterRequestKind {
    Skeleton,
    Tail,
}

#[derive(Debug)]
struct MasterRequest {
    kind: MasterRequestKind,
    request: HeadersRequest,
    deadline: Instant,
}

/// A block whose header is verified, waiting for its body and receipts.
#[derive(Debug)]
struct FetchResult {
    header: SealedHeader,
    body: Option<BlockBody>,
    receipts: Option<Vec<Receipt>>,
    needs_receipts: bool,
}

impl FetchResult {
    fn new(header: SealedHeader, needs_receipts: bool) -> Self {
        let body = header.is_empty_body().then(BlockBody::default);
        let receipts = (needs_receipts && header.is_empty_receipts()).then(Vec::new);
        Self { header, body, receipts, needs_receipts }
    }

    fn is_complete(&self) -> bool {
        self.body.is_some() && (!self.needs_receipts || self.receipts.is_some())
    }

    fn into_parts(self) -> (SealedBlock, Vec<Receipt>) {
        let block = SealedBlock { header: self.header, body: self.body.unwrap_or_default() };
        (block, self.receipts.unwrap_or_default())
    }
}

/// State of one run against a master peer.
///
/// The master serves the head, the ancestor search and the header skeleton. Every registered
/// peer that is not dropped from the run may fill skeleton gaps, bodies, receipts and state.
pub(super) struct SyncRun<'a> {
    dl: &'a Downloader,
    mode: SyncMode,
    cancel: CancellationToken,
    deliveries: UnboundedReceiver<Delivery>,
    events: UnboundedReceiver<PeerEvent>,
    master: RunPeer,
    target_hash: B256,
    target_td: U256,
    remote_height: BlockNumber,
    /// Peers excluded from this run.
    dropped: HashSet<PeerId>,
    strikes: HashMap<PeerId, usize>,
    /// Expired requests whose answer may still arrive, the peer's slot stays reserved until then.
    late: HashMap<(PeerId, RequestKind), Instant>,

    tip: SealedHeader,
    tip_td: U256,
    master_request: Option<MasterRequest>,
    /// Skeleton headers keyed by the first number of the gap they close.
    skeleton: BTreeMap<BlockNumber, SealedHeader>,
    fills: FetchQueue<BlockNumber, (PeerId, Vec<SealedHeader>)>,
    skeleton_exhausted: bool,
    poll_at: Option<Instant>,
    headers_done: bool,

    bodies: FetchQueue<B256, BlockBody>,
    receipts: FetchQueue<B256, Vec<Receipt>>,
    results: BTreeMap<BlockNumber, FetchResult>,
    numbers: HashMap<B256, BlockNumber>,
    committed: SealedHeader,

    pivot: Option<BlockNumber>,
    state: Option<StateSync>,
    pulled_before: u64,
}

impl<'a> SyncRun<'a> {
    pub(super) fn new(
        dl: &'a Downloader,
        mode: SyncMode,
        master: RunPeer,
        target_hash: B256,
        target_td: U256,
        cancel: CancellationToken,
        deliveries: UnboundedReceiver<Delivery>,
    ) -> Self {
        Self {
            dl,
            mode,
            cancel,
            deliveries,
            events: dl.registry.subscribe(),
            master,
            target_hash,
            target_td,
            remote_height: 0,
            dropped: HashSet::new(),
            strikes: HashMap::new(),
            late: HashMap::new(),
            tip: SealedHeader::default(),
            tip_td: U256::ZERO,
            master_request: None,
            skeleton: BTreeMap::new(),
            fills: FetchQueue::new(RequestKind::Headers),
            skeleton_exhausted: false,
            poll_at: None,
            headers_done: false,
            bodies: FetchQueue::new(RequestKind::Bodies),
            receipts: FetchQueue::new(RequestKind::Receipts),
            results: BTreeMap::new(),
            numbers: HashMap::new(),
            committed: SealedHeader::default(),
            pivot: None,
            state: None,
            pulled_before: 0,
        }
    }

    pub(super) async fn run(mut self) -> DownloadResult<SyncOutcome> {
        let head = self.fetch_head().await?;
        self.remote_height = head.number;
        let ancestor = self.find_ancestor(&head).await?;
        let origin = ancestor.number;
        self.prepare(ancestor)?;
        debug!(target: "sync::downloader", origin, remote = self.remote_height, pivot = ?self.pivot, mode = %self.mode, "Found common ancestor");

        self.drive().await?;

        let head =
            if self.mode.is_header_only() { self.tip.num_hash() } else { self.committed.num_hash() };
        Ok(SyncOutcome::Synced { origin, head })
    }

    // === head and ancestor ===

    /// Sends a header request to the master and waits for its answer.
    ///
    /// Expired requests are retried until the master reaches the timeout limit.
    async fn request_master(
        &mut self,
        request: HeadersRequest,
    ) -> DownloadResult<Vec<SealedHeader>> {
        let master_id = self.master.id();
        let mut timeouts = 0;
        loop {
            self.master.try_reserve(RequestKind::Headers);
            trace!(target: "sync::downloader", peer_id = %master_id, ?request, "Requesting headers from master");
            self.master
                .handle()
                .request_headers(request.clone())
                .map_err(|_| DownloadError::UnknownPeer(master_id))?;

            let deadline = sleep(self.dl.config.request_timeout);
            tokio::pin!(deadline);
            loop {
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => return Err(DownloadError::Cancelled),
                    Some(event) = self.events.recv() => {
                        if event == PeerEvent::Unregistered(master_id) {
                            return Err(DownloadError::UnknownPeer(master_id))
                        }
                    }
                    Some(delivery) = self.deliveries.recv() => match delivery {
                        Delivery::Headers(peer_id, headers) if peer_id == master_id => {
                            self.master.release(RequestKind::Headers, headers.len());
                            self.dl.metrics.delivered(RequestKind::Headers, headers.len());
                            return Ok(headers.into_iter().map(Header::seal_slow).collect())
                        }
                        other => self.dl.metrics.dropped(other.kind(), other.len()),
                    },
                    _ = &mut deadline => break,
                }
            }

            self.master.release(RequestKind::Headers, 0);
            self.dl.metrics.timed_out(RequestKind::Headers);
            timeouts += 1;
            debug!(target: "sync::downloader", peer_id = %master_id, timeouts, "Master request timed out");
            if timeouts >= self.dl.config.peer_timeout_limit {
                return Err(DownloadError::Timeout { peer_id: master_id })
            }
        }
    }

    async fn fetch_head(&mut self) -> DownloadResult<SealedHeader> {
        let mut headers =
            self.request_master(HeadersRequest::rising(self.target_hash, 1)).await?;
        match headers.pop() {
            Some(head) if headers.is_empty() && head.hash() == self.target_hash => Ok(head),
            _ => Err(DownloadError::InvalidAncestor {
                peer_id: self.master.id(),
                reason: "head header does not match the advertised head",
            }),
        }
    }

    fn is_known(&self, header: &SealedHeader) -> DownloadResult<bool> {
        let (number, hash) = (header.number, header.hash());
        let provider = &self.dl.provider;
        Ok(match self.mode {
            SyncMode::Full => provider.has_block(number, hash)?,
            SyncMode::Fast => provider.has_receipts(number, hash)?,
            SyncMode::Light | SyncMode::LightOnly => provider.has_header(number, hash)?,
        })
    }

    /// Single header lookup during the binary search.
    async fn request_single(&mut self, number: BlockNumber) -> DownloadResult<SealedHeader> {
        let mut headers = self.request_master(HeadersRequest::rising(number, 1)).await?;
        match headers.pop() {
            Some(header) if headers.is_empty() && header.number == number => Ok(header),
            _ => Err(DownloadError::InvalidAncestor {
                peer_id: self.master.id(),
                reason: "single header lookup returned the wrong header",
            }),
        }
    }

    /// Finds the highest block shared by the local chain and the master's chain.
    ///
    /// A sparse span of headers locates the region first, a binary search narrows it down.
    async fn find_ancestor(&mut self, remote: &SealedHeader) -> DownloadResult<SealedHeader> {
        let (local, _) = self.dl.local_td(self.mode)?;
        let floor = local.number.saturating_sub(self.dl.config.max_fork_ancestry);
        if remote.number < floor {
            return Err(DownloadError::InvalidAncestor {
                peer_id: self.master.id(),
                reason: "remote head is below the allowed fork depth",
            })
        }
        let top = local.number.min(remote.number);

        let count = (top - floor + 1).min(MAX_SPAN_HEADERS);
        let step = if count > 1 { ((top - floor) / (count - 1)).max(1) } else { 1 };
        let start = top - (count - 1) * step;
        let request = HeadersRequest::skipping(start, count, step - 1);
        let expected = request.expected_numbers().unwrap_or_default();
        let span = self.request_master(request).await?;
        if span.is_empty() ||
            span.len() > expected.len() ||
            span.iter().zip(&expected).any(|(header, number)| header.number != *number)
        {
            return Err(DownloadError::InvalidAncestor {
                peer_id: self.master.id(),
                reason: "span answer does not match the request",
            })
        }

        // the highest known span header, and the lowest unknown one above it
        let mut known = None;
        let mut above = top + 1;
        for header in span.iter().rev() {
            if self.is_known(header)? {
                known = Some(header.clone());
                break
            }
            above = header.number;
        }
        let mut ancestor = match known {
            Some(header) => header,
            None => {
                let header = self.request_single(floor).await?;
                if start == floor || !self.is_known(&header)? {
                    return Err(DownloadError::InvalidAncestor {
                        peer_id: self.master.id(),
                        reason: "no common ancestor within the allowed fork depth",
                    })
                }
                header
            }
        };

        while ancestor.number + 1 < above {
            let middle = (ancestor.number + above) / 2;
            let header = self.request_single(middle).await?;
            if self.is_known(&header)? {
                ancestor = header;
            } else {
                above = middle;
            }
        }
        trace!(target: "sync::downloader", number = ancestor.number, hash = %ancestor.hash(), "Located common ancestor");
        Ok(ancestor)
    }

    fn prepare(&mut self, ancestor: SealedHeader) -> DownloadResult<()> {
        self.tip_td = self.dl.provider.td(ancestor.number, ancestor.hash())?.ok_or(
            ProviderError::TotalDifficultyNotFound {
                block_number: ancestor.number,
                block_hash: ancestor.hash(),
            },
        )?;
        if self.mode.fetches_state() {
            let pivot = self.remote_height.saturating_sub(self.dl.config.pivot_distance);
            if pivot > ancestor.number {
                self.pivot = Some(pivot);
            }
        }
        self.committed = ancestor.clone();
        self.tip = ancestor;
        self.update_progress();
        Ok(())
    }

    // === event loop ===

    async fn drive(&mut self) -> DownloadResult<()> {
        let mut ticker = interval(TICK);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            self.schedule_headers()?;
            self.assign();
            self.commit()?;
            if self.is_finished() {
                return Ok(())
            }
            if self.is_stalled() {
                return Err(DownloadError::Stalled)
            }

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(DownloadError::Cancelled),
                Some(event) = self.events.recv() => self.on_peer_event(event),
                Some(delivery) = self.deliveries.recv() => self.on_delivery(delivery)?,
                _ = ticker.tick() => self.on_tick(),
            }
        }
    }

    fn is_finished(&self) -> bool {
        self.headers_done &&
            self.master_request.is_none() &&
            self.skeleton.is_empty() &&
            self.fills.is_idle() &&
            self.bodies.is_idle() &&
            self.receipts.is_idle() &&
            self.results.is_empty() &&
            self.state_complete()
    }

    /// Work is left but nothing is outstanding and no peer could take it.
    fn is_stalled(&self) -> bool {
        let state = self.state.as_ref().map(StateSync::queue);
        let in_flight = self.master_request.is_some() ||
            !self.late.is_empty() ||
            self.fills.in_flight_len() > 0 ||
            self.bodies.in_flight_len() > 0 ||
            self.receipts.in_flight_len() > 0 ||
            state.map_or(false, |queue| queue.in_flight_len() > 0);
        if in_flight || self.poll_at.is_some() {
            return false
        }
        self.fills.pending_len() > 0 ||
            self.bodies.pending_len() > 0 ||
            self.receipts.pending_len() > 0 ||
            state.map_or(false, |queue| queue.pending_len() > 0)
    }

    fn state_complete(&self) -> bool {
        self.state.as_ref().map_or(self.pivot.is_none(), StateSync::is_complete)
    }

    fn update_progress(&self) {
        let current =
            if self.mode.is_header_only() { self.tip.number } else { self.committed.number };
        let mut progress = self.dl.progress.lock();
        progress.current = current;
        progress.highest = self.remote_height;
        if let Some(state) = &self.state {
            progress.pulled_states = self.pulled_before + state.pulled();
            progress.known_states = state.known();
        }
        self.dl.metrics.set_progress(current, self.remote_height);
    }

    // === peers ===

    /// Makes sure the master is usable, electing the heaviest remaining peer otherwise.
    fn ensure_master(&mut self) -> DownloadResult<()> {
        let current = self.master.id();
        if !self.dropped.contains(&current) && self.dl.registry.contains(&current) {
            return Ok(())
        }
        let candidate = self
            .dl
            .registry
            .peers()
            .into_iter()
            .filter(|peer| !self.dropped.contains(&peer.id()) && peer.supports(RequestKind::Headers))
            .max_by(|a, b| a.td().cmp(&b.td()).then(b.seq().cmp(&a.seq())));
        match candidate {
            Some(peer) => {
                debug!(target: "sync::downloader", old = %current, new = %peer.id(), "Elected new master peer");
                self.master = peer;
                Ok(())
            }
            None => Err(DownloadError::Stalled),
        }
    }

    fn eligible(&self, kind: RequestKind) -> Vec<RunPeer> {
        self.dl
            .registry
            .idle_peers(kind)
            .into_iter()
            .filter(|peer| {
                !self.dropped.contains(&peer.id()) && !self.late.contains_key(&(peer.id(), kind))
            })
            .collect()
    }

    fn revoke(&mut self, kind: RequestKind, peer_id: &PeerId) -> usize {
        match kind {
            RequestKind::Headers => self.fills.revoke(peer_id).len(),
            RequestKind::Bodies => self.bodies.revoke(peer_id).len(),
            RequestKind::Receipts => self.receipts.revoke(peer_id).len(),
            RequestKind::NodeData => {
                self.state.as_mut().map_or(0, |state| state.queue_mut().revoke(peer_id).len())
            }
        }
    }

    /// Returns all outstanding work of the peer to pending.
    fn revoke_all(&mut self, peer_id: &PeerId) {
        let requeued: usize = RequestKind::ALL.iter().map(|kind| self.revoke(*kind, peer_id)).sum();
        if self.master.id() == *peer_id {
            self.master_request = None;
        }
        self.late.retain(|(id, _), _| id != peer_id);
        trace!(target: "sync::downloader", %peer_id, requeued, "Revoked outstanding requests");
    }

    /// Excludes the peer from the rest of the run and reports it.
    fn drop_peer(&mut self, peer_id: PeerId, reason: ReputationChangeKind) {
        if !self.dropped.insert(peer_id) {
            return
        }
        debug!(target: "sync::downloader", %peer_id, ?reason, "Dropping peer from synchronisation");
        self.revoke_all(&peer_id);
        if let Some(peer) = self.dl.registry.get(&peer_id) {
            peer.reset();
        }
        self.dl.reporter.report(peer_id, reason);
    }

    fn on_peer_event(&mut self, event: PeerEvent) {
        if let PeerEvent::Unregistered(peer_id) = event {
            if peer_id == self.master.id() {
                debug!(target: "sync::downloader", %peer_id, "Master peer disconnected");
            }
            self.revoke_all(&peer_id);
        }
    }

    fn on_timeout(&mut self, peer_id: PeerId, kind: RequestKind) {
        self.dl.metrics.timed_out(kind);
        let strikes = {
            let strikes = self.strikes.entry(peer_id).or_default();
            *strikes += 1;
            *strikes
        };
        debug!(target: "sync::downloader", %peer_id, %kind, strikes, "Request timed out");
        if strikes >= self.dl.config.peer_timeout_limit {
            self.drop_peer(peer_id, ReputationChangeKind::Timeout);
        } else {
            self.late.insert((peer_id, kind), Instant::now() + self.dl.config.request_timeout);
        }
    }

    fn on_tick(&mut self) {
        let now = Instant::now();
        let mut expired: Vec<(PeerId, RequestKind)> = Vec::new();
        expired.extend(self.fills.expire(now).into_iter().map(|r| (r.peer_id, RequestKind::Headers)));
        expired.extend(self.bodies.expire(now).into_iter().map(|r| (r.peer_id, RequestKind::Bodies)));
        expired
            .extend(self.receipts.expire(now).into_iter().map(|r| (r.peer_id, RequestKind::Receipts)));
        if let Some(state) = self.state.as_mut() {
            expired.extend(
                state.queue_mut().expire(now).into_iter().map(|r| (r.peer_id, RequestKind::NodeData)),
            );
        }
        if self.master_request.as_ref().map_or(false, |request| request.deadline <= now) {
            self.master_request = None;
            expired.push((self.master.id(), RequestKind::Headers));
        }
        for (peer_id, kind) in expired {
            self.on_timeout(peer_id, kind);
        }

        let overdue: Vec<(PeerId, RequestKind)> =
            self.late.iter().filter(|(_, at)| **at <= now).map(|(key, _)| *key).collect();
        for (peer_id, kind) in overdue {
            self.late.remove(&(peer_id, kind));
            if let Some(peer) = self.dl.registry.get(&peer_id) {
                peer.release(kind, 0);
            }
        }
    }

    // === requests ===

    fn schedule_headers(&mut self) -> DownloadResult<()> {
        if self.headers_done || self.master_request.is_some() || !self.skeleton.is_empty() {
            return Ok(())
        }
        if self.results.len() >= self.dl.config.max_buffered_blocks {
            return Ok(())
        }
        if let Some(at) = self.poll_at {
            if Instant::now() < at {
                return Ok(())
            }
            self.poll_at = None;
        }
        self.ensure_master()?;
        if !self.master.try_reserve(RequestKind::Headers) {
            return Ok(())
        }

        let fill = self.dl.config.fill_batch.max(1);
        let from = self.tip.number + 1;
        let (kind, request) =
            if !self.skeleton_exhausted && self.tip.number + fill <= self.remote_height {
                let request =
                    HeadersRequest::skipping(from + fill - 1, self.dl.config.skeleton_size, fill - 1);
                (MasterRequestKind::Skeleton, request)
            } else {
                (MasterRequestKind::Tail, HeadersRequest::rising(from, fill))
            };
        let peer_id = self.master.id();
        trace!(target: "sync::downloader", %peer_id, ?kind, ?request, "Requesting headers from master");
        if let Err(err) = self.master.handle().request_headers(request.clone()) {
            debug!(target: "sync::downloader", %peer_id, %err, "Failed to request headers");
            self.master.cancel(RequestKind::Headers);
            self.drop_peer(peer_id, ReputationChangeKind::Dropped);
            return Ok(())
        }
        let deadline = Instant::now() + self.dl.config.request_timeout;
        self.master_request = Some(MasterRequest { kind, request, deadline });
        Ok(())
    }

    /// Marks the peer busy and sends the request, dropping the peer if that fails.
    fn dispatch(
        &mut self,
        peer: &RunPeer,
        kind: RequestKind,
        send: impl FnOnce(&SyncPeer) -> RequestResult<()>,
    ) {
        let peer_id = peer.id();
        if !peer.try_reserve(kind) {
            self.revoke(kind, &peer_id);
            return
        }
        if let Err(err) = send(peer.handle()) {
            debug!(target: "sync::downloader", %peer_id, %kind, %err, "Failed to send request");
            peer.cancel(kind);
            self.drop_peer(peer_id, ReputationChangeKind::Dropped);
        }
    }

    /// Hands pending work to idle peers, sized to their throughput.
    fn assign(&mut self) {
        let ttl = self.dl.config.request_timeout;
        let rtt = self.dl.config.request_ttl;

        if self.fills.pending_len() > 0 {
            let fill = self.dl.config.fill_batch.max(1);
            for peer in self.eligible(RequestKind::Headers) {
                let Some(request) = self.fills.reserve(peer.id(), 1, ttl) else { break };
                let start = request.keys[0];
                self.dispatch(&peer, RequestKind::Headers, |handle| {
                    handle.request_headers(HeadersRequest::rising(start, fill))
                });
            }
        }

        if self.bodies.pending_len() > 0 {
            for peer in self.eligible(RequestKind::Bodies) {
                let max =
                    peer.capacity(RequestKind::Bodies, rtt).min(self.dl.config.max_block_fetch);
                let Some(request) =
                    self.bodies.reserve_where(peer.id(), max, ttl, |hash| !peer.lacks(hash))
                else {
                    continue
                };
                self.dispatch(&peer, RequestKind::Bodies, |handle| {
                    handle.request_bodies(request.keys)
                });
            }
        }

        if self.receipts.pending_len() > 0 {
            for peer in self.eligible(RequestKind::Receipts) {
                let max =
                    peer.capacity(RequestKind::Receipts, rtt).min(self.dl.config.max_receipt_fetch);
                let Some(request) =
                    self.receipts.reserve_where(peer.id(), max, ttl, |hash| !peer.lacks(hash))
                else {
                    continue
                };
                self.dispatch(&peer, RequestKind::Receipts, |handle| {
                    handle.request_receipts(request.keys)
                });
            }
        }

        if self.state.as_ref().map_or(false, |state| state.queue().pending_len() > 0) {
            for peer in self.eligible(RequestKind::NodeData) {
                let max =
                    peer.capacity(RequestKind::NodeData, rtt).min(self.dl.config.max_state_fetch);
                let Some(state) = self.state.as_mut() else { break };
                let Some(request) =
                    state.queue_mut().reserve_where(peer.id(), max, ttl, |hash| !peer.lacks(hash))
                else {
                    continue
                };
                self.dispatch(&peer, RequestKind::NodeData, |handle| {
                    handle.request_node_data(request.keys)
                });
            }
        }
    }

    // === deliveries ===

    fn on_delivery(&mut self, delivery: Delivery) -> DownloadResult<()> {
        let (kind, count) = (delivery.kind(), delivery.len());
        let peer_id = match &delivery {
            Delivery::Headers(peer_id, _) |
            Delivery::Bodies(peer_id, _) |
            Delivery::Receipts(peer_id, _) |
            Delivery::NodeData(peer_id, _) => *peer_id,
        };
        if self.dropped.contains(&peer_id) || !self.dl.registry.contains(&peer_id) {
            trace!(target: "sync::downloader", %peer_id, %kind, count, "Discarded delivery of dropped peer");
            self.dl.metrics.dropped(kind, count);
            return Ok(())
        }
        match delivery {
            Delivery::Headers(peer_id, headers) => self.on_headers(peer_id, headers),
            Delivery::Bodies(peer_id, bodies) => {
                self.on_bodies(peer_id, bodies);
                Ok(())
            }
            Delivery::Receipts(peer_id, receipts) => {
                self.on_receipts(peer_id, receipts);
                Ok(())
            }
            Delivery::NodeData(peer_id, nodes) => self.on_node_data(peer_id, nodes),
        }
    }

    /// A delivery without a matching request, possibly the answer to an expired one.
    fn on_unsolicited(&mut self, peer_id: PeerId, kind: RequestKind, count: usize) {
        self.dl.metrics.dropped(kind, count);
        if self.late.remove(&(peer_id, kind)).is_some() {
            if let Some(peer) = self.dl.registry.get(&peer_id) {
                peer.release(kind, count);
            }
        }
        trace!(target: "sync::downloader", %peer_id, %kind, count, "Discarded unsolicited delivery");
    }

    /// Settles the peer after a delivery was matched against its request.
    fn settle(
        &mut self,
        peer_id: PeerId,
        kind: RequestKind,
        count: usize,
        outcome: Result<Delivered<B256>, QueueError>,
    ) {
        let peer = self.dl.registry.get(&peer_id);
        match outcome {
            Ok(delivered) => {
                if let Some(peer) = &peer {
                    peer.release(kind, delivered.accepted);
                    for hash in &delivered.missing {
                        peer.mark_lacking(*hash);
                    }
                }
                self.dl.metrics.delivered(kind, delivered.accepted);
                trace!(target: "sync::downloader", %peer_id, %kind, accepted = delivered.accepted, missing = delivered.missing.len(), "Accepted delivery");
            }
            Err(QueueError::InvalidDelivery) => {
                if let Some(peer) = &peer {
                    peer.release(kind, 0);
                }
                self.dl.metrics.dropped(kind, count);
                self.drop_peer(peer_id, ReputationChangeKind::BadMessage);
            }
            Err(QueueError::NoFetchesPending) => self.on_unsolicited(peer_id, kind, count),
        }
    }

    fn on_headers(&mut self, peer_id: PeerId, headers: Vec<Header>) -> DownloadResult<()> {
        let headers: Vec<SealedHeader> = headers.into_iter().map(Header::seal_slow).collect();
        if peer_id == self.master.id() && self.master_request.is_some() {
            return self.on_master_headers(headers)
        }
        let Some(start) = self.fills.request(&peer_id).map(|request| request.keys[0]) else {
            self.on_unsolicited(peer_id, RequestKind::Headers, headers.len());
            return Ok(())
        };

        // a broken chain is a protocol violation, anything else only disqualifies the filler
        for pair in headers.windows(2) {
            ensure_parent(peer_id, &pair[1], &pair[0])?;
        }
        let expected = self.skeleton.get(&start).map(SealedHeader::hash);
        let count = headers.len();
        let valid = count as u64 == self.dl.config.fill_batch.max(1) &&
            headers.first().map(|header| header.number) == Some(start) &&
            headers.last().map(SealedHeader::hash) == expected;
        if !valid {
            debug!(target: "sync::downloader", %peer_id, start, count, "Invalid skeleton fill");
            if let Some(peer) = self.dl.registry.get(&peer_id) {
                peer.release(RequestKind::Headers, 0);
            }
            self.dl.metrics.dropped(RequestKind::Headers, count);
            self.drop_peer(peer_id, ReputationChangeKind::BadMessage);
            return Ok(())
        }

        if let Err(err) = self.fills.deliver_ordered(peer_id, vec![(peer_id, headers)], |_, _| true)
        {
            trace!(target: "sync::downloader", %peer_id, %err, "Skeleton fill not accepted");
            return Ok(())
        }
        if let Some(peer) = self.dl.registry.get(&peer_id) {
            peer.release(RequestKind::Headers, count);
        }
        self.dl.metrics.delivered(RequestKind::Headers, count);
        self.process_fills()
    }

    fn on_master_headers(&mut self, headers: Vec<SealedHeader>) -> DownloadResult<()> {
        let Some(request) = self.master_request.take() else { return Ok(()) };
        let master_id = self.master.id();
        self.master.release(RequestKind::Headers, headers.len());
        self.dl.metrics.delivered(RequestKind::Headers, headers.len());

        match request.kind {
            MasterRequestKind::Skeleton => {
                let expected = request.request.expected_numbers().unwrap_or_default();
                if headers.len() > expected.len() {
                    return Err(DownloadError::InvalidSkeleton {
                        peer_id: master_id,
                        number: headers[expected.len()].number,
                    })
                }
                if let Some((header, _)) =
                    headers.iter().zip(&expected).find(|(header, number)| header.number != **number)
                {
                    return Err(DownloadError::InvalidSkeleton {
                        peer_id: master_id,
                        number: header.number,
                    })
                }
                if headers.is_empty() {
                    self.skeleton_exhausted = true;
                    return Ok(())
                }
                let fill = self.dl.config.fill_batch.max(1);
                debug!(target: "sync::downloader", count = headers.len(), from = headers[0].number, "Received header skeleton");
                for header in headers {
                    self.skeleton.insert(header.number + 1 - fill, header);
                }
                self.fills.schedule(self.skeleton.keys().copied());
                Ok(())
            }
            MasterRequestKind::Tail => {
                self.skeleton_exhausted = false;
                if headers.is_empty() {
                    return self.on_headers_exhausted()
                }
                self.process_headers(master_id, headers)
            }
        }
    }

    /// The master has no headers beyond the tip.
    fn on_headers_exhausted(&mut self) -> DownloadResult<()> {
        if self.tip_td < self.target_td {
            return Err(DownloadError::InvalidTotalDifficulty {
                peer_id: self.master.id(),
                advertised: self.target_td,
                delivered: self.tip_td,
            })
        }
        if self.pivot.is_some() && !self.state_complete() {
            // keep following the master's head until the pivot state is complete
            self.poll_at = Some(Instant::now() + self.dl.config.request_ttl);
            return Ok(())
        }
        debug!(target: "sync::downloader", number = self.tip.number, td = %self.tip_td, "Header download completed");
        self.headers_done = true;
        Ok(())
    }

    /// Processes filled skeleton gaps in ascending order.
    fn process_fills(&mut self) -> DownloadResult<()> {
        while let Some((&start, skeleton)) = self.skeleton.first_key_value() {
            let number = skeleton.number;
            let Some((filler, headers)) = self.fills.take_arrived(&start) else { break };
            self.skeleton.remove(&start);
            if !headers.first().map_or(false, |first| first.is_child_of(&self.tip)) {
                return Err(DownloadError::InvalidSkeleton { peer_id: self.master.id(), number })
            }
            self.process_headers(filler, headers)?;
        }
        Ok(())
    }

    /// Verifies headers against the tip and hands them to the block pipeline.
    fn process_headers(&mut self, peer_id: PeerId, headers: Vec<SealedHeader>) -> DownloadResult<()> {
        let mut insert = Vec::new();
        for header in headers {
            validate_header_download(&*self.dl.consensus, peer_id, &header, &self.tip)?;
            self.tip_td += header.difficulty;
            if Some(header.number) == self.pivot && self.state.is_none() {
                self.start_state(&header)?;
            }
            if self.mode.fetches_bodies() {
                self.queue_block(header.clone());
            }
            if self.mode != SyncMode::Full {
                insert.push(header.clone());
            }
            self.tip = header;
        }
        if !insert.is_empty() {
            self.dl.provider.insert_headers(&insert)?;
        }
        self.remote_height = self.remote_height.max(self.tip.number);
        self.check_pivot()?;
        self.update_progress();
        Ok(())
    }

    fn queue_block(&mut self, header: SealedHeader) {
        let needs_receipts = self.mode.fetches_receipts() &&
            self.pivot.map_or(false, |pivot| header.number <= pivot);
        let (number, hash) = (header.number, header.hash());
        let result = FetchResult::new(header, needs_receipts);
        if result.body.is_none() {
            self.bodies.schedule([hash]);
        }
        if result.needs_receipts && result.receipts.is_none() {
            self.receipts.schedule([hash]);
        }
        self.numbers.insert(hash, number);
        self.results.insert(number, result);
    }

    fn on_bodies(&mut self, peer_id: PeerId, bodies: Vec<BlockBody>) {
        let count = bodies.len();
        let (numbers, results) = (&self.numbers, &self.results);
        let outcome = self.bodies.deliver_ordered(peer_id, bodies, |hash, body| {
            numbers
                .get(hash)
                .and_then(|number| results.get(number))
                .map_or(false, |result| body.matches(&result.header))
        });
        self.settle(peer_id, RequestKind::Bodies, count, outcome);
        for (hash, body) in self.bodies.drain_arrived() {
            if let Some(result) = self.numbers.get(&hash).and_then(|n| self.results.get_mut(n)) {
                result.body = Some(body);
            }
        }
    }

    fn on_receipts(&mut self, peer_id: PeerId, receipts: Vec<Vec<Receipt>>) {
        let count = receipts.len();
        let (numbers, results) = (&self.numbers, &self.results);
        let outcome = self.receipts.deliver_ordered(peer_id, receipts, |hash, receipts| {
            numbers
                .get(hash)
                .and_then(|number| results.get(number))
                .map_or(false, |result| {
                    calculate_receipt_root(receipts) == result.header.receipts_root
                })
        });
        self.settle(peer_id, RequestKind::Receipts, count, outcome);
        for (hash, receipts) in self.receipts.drain_arrived() {
            if let Some(result) = self.numbers.get(&hash).and_then(|n| self.results.get_mut(n)) {
                result.receipts = Some(receipts);
            }
        }
    }

    fn on_node_data(&mut self, peer_id: PeerId, nodes: Vec<Bytes>) -> DownloadResult<()> {
        let count = nodes.len();
        let Some(state) = self.state.as_mut() else {
            self.on_unsolicited(peer_id, RequestKind::NodeData, count);
            return Ok(())
        };
        let outcome = state.deliver(peer_id, nodes);
        self.settle(peer_id, RequestKind::NodeData, count, outcome);
        if let Some(state) = self.state.as_mut() {
            state.process(&self.dl.provider)?;
            if state.is_complete() {
                debug!(target: "sync::downloader", root = %state.root(), pulled = state.pulled(), "State download completed");
            }
        }
        self.update_progress();
        Ok(())
    }

    // === pivot ===

    fn start_state(&mut self, header: &SealedHeader) -> DownloadResult<()> {
        let state = StateSync::new(header.state_root, &self.dl.provider)?;
        debug!(target: "sync::downloader", number = header.number, root = %header.state_root, complete = state.is_complete(), "Starting state download");
        self.state = Some(state);
        Ok(())
    }

    fn header_at(&self, number: BlockNumber) -> DownloadResult<SealedHeader> {
        if let Some(result) = self.results.get(&number) {
            return Ok(result.header.clone())
        }
        Ok(self
            .dl
            .provider
            .header_by_number(number)?
            .ok_or(ProviderError::HeaderNotFound(number.into()))?)
    }

    /// Moves the pivot if the chain outgrew it before its state was complete.
    ///
    /// The state download restarts at the new pivot, nodes already stored are kept.
    fn check_pivot(&mut self) -> DownloadResult<()> {
        let Some(pivot) = self.pivot else { return Ok(()) };
        if self.state.as_ref().map_or(true, StateSync::is_complete) {
            return Ok(())
        }
        let distance = self.dl.config.pivot_distance;
        if self.tip.number <= pivot + 2 * distance {
            return Ok(())
        }
        let new_pivot = self.tip.number - distance;
        let header = self.header_at(new_pivot)?;

        if let Some(mut old) = self.state.take() {
            self.pulled_before += old.pulled();
            for peer_id in old.queue_mut().reset() {
                if let Some(peer) = self.dl.registry.get(&peer_id) {
                    peer.cancel(RequestKind::NodeData);
                }
            }
        }
        if self.mode.fetches_receipts() {
            for result in self.results.range_mut(pivot + 1..=new_pivot).map(|(_, result)| result) {
                if result.needs_receipts {
                    continue
                }
                result.needs_receipts = true;
                if result.header.is_empty_receipts() {
                    result.receipts = Some(Vec::new());
                } else {
                    self.receipts.schedule([result.header.hash()]);
                }
            }
        }
        info!(target: "sync::downloader", old = pivot, new = new_pivot, "Pivot moved, restarting state download");
        self.pivot = Some(new_pivot);
        self.start_state(&header)
    }

    // === commit ===

    /// Writes completed blocks in ascending order.
    fn commit(&mut self) -> DownloadResult<()> {
        if !self.mode.fetches_bodies() {
            return Ok(())
        }
        loop {
            let mut ready = Vec::new();
            let mut number = self.committed.number + 1;
            while ready.len() < COMMIT_BATCH {
                let Some(result) = self.results.get(&number) else { break };
                if !result.is_complete() {
                    break
                }
                if self.mode == SyncMode::Fast &&
                    Some(number) == self.pivot &&
                    !self.state_complete()
                {
                    break
                }
                ready.push(number);
                number += 1;
            }
            if ready.is_empty() {
                return Ok(())
            }
            let results: Vec<FetchResult> =
                ready.iter().filter_map(|number| self.results.remove(number)).collect();
            for result in &results {
                self.numbers.remove(&result.header.hash());
            }
            self.import(results)?;
        }
    }

    fn import(&mut self, results: Vec<FetchResult>) -> DownloadResult<()> {
        let count = results.len();
        match (self.mode, self.pivot) {
            (SyncMode::Fast, Some(pivot)) => {
                let (below, rest): (Vec<_>, Vec<_>) =
                    results.into_iter().partition(|result| result.header.number < pivot);
                let (at, above): (Vec<_>, Vec<_>) =
                    rest.into_iter().partition(|result| result.header.number == pivot);
                self.import_receipts(below, BlockHead::Fast)?;
                self.import_receipts(at, BlockHead::Full)?;
                self.import_executed(above)?;
            }
            _ => self.import_executed(results)?,
        }
        self.dl.metrics.committed(count);
        self.update_progress();
        Ok(())
    }

    /// Writes blocks with downloaded receipts.
    fn import_receipts(&mut self, results: Vec<FetchResult>, head: BlockHead) -> DownloadResult<()> {
        let Some(last) = results.last().map(|result| result.header.clone()) else { return Ok(()) };
        let (blocks, receipts): (Vec<SealedBlock>, Vec<Vec<Receipt>>) =
            results.into_iter().map(FetchResult::into_parts).unzip();
        self.dl.provider.insert_blocks(&blocks, Some(&receipts), head)?;
        trace!(target: "sync::downloader", first = blocks[0].number(), last = last.number, ?head, "Imported blocks with receipts");
        self.committed = last;
        Ok(())
    }

    /// Executes blocks and writes them with the produced receipts.
    fn import_executed(&mut self, results: Vec<FetchResult>) -> DownloadResult<()> {
        let mut blocks = Vec::with_capacity(results.len());
        let mut receipts = Vec::with_capacity(results.len());
        let mut failure = None;
        for result in results {
            let (block, _) = result.into_parts();
            let outcome = self.dl.executor.execute(&block).and_then(|output| {
                let got = calculate_receipt_root(&output);
                if got == block.header.receipts_root {
                    Ok(output)
                } else {
                    Err(ExecutionError::ReceiptRootDiff { got, expected: block.header.receipts_root })
                }
            });
            match outcome {
                Ok(output) => {
                    blocks.push(block);
                    receipts.push(output);
                }
                Err(error) => {
                    failure = Some(DownloadError::BadBlock {
                        peer_id: self.master.id(),
                        number: block.number(),
                        hash: block.hash(),
                        error,
                    });
                    break
                }
            }
        }
        if let Some(last) = blocks.last().map(|block| block.header.clone()) {
            self.dl.provider.insert_blocks(&blocks, Some(&receipts), BlockHead::Full)?;
            self.committed = last;
        }
        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
