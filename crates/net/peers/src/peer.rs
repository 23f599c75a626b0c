use crate::registry::Listeners;
use dos_primitives::{PeerId, B256, U256};
use parking_lot::Mutex;
use std::{collections::HashSet, fmt, sync::Arc, time::Duration};
use tokio::time::Instant;

/// Weight of a new measurement in the throughput and round trip estimates.
pub const MEASUREMENT_IMPACT: f64 = 0.1;

/// Round trip time assumed for a peer that has not delivered anything yet.
pub const INITIAL_RTT: Duration = Duration::from_secs(5);

/// Maximum number of hashes remembered as unavailable at a peer.
pub const MAX_LACKING_HASHES: usize = 4096;

/// The kinds of data a peer is asked for during bulk synchronisation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RequestKind {
    /// Block headers.
    Headers,
    /// Block bodies.
    Bodies,
    /// Block receipts.
    Receipts,
    /// State trie nodes.
    NodeData,
}

impl RequestKind {
    /// All kinds, in a fixed order.
    pub const ALL: [RequestKind; 4] =
        [RequestKind::Headers, RequestKind::Bodies, RequestKind::Receipts, RequestKind::NodeData];

    /// Upper bound of items in one request of this kind.
    pub const fn max_fetch(&self) -> usize {
        match self {
            RequestKind::Headers => 192,
            RequestKind::Bodies => 128,
            RequestKind::Receipts => 256,
            RequestKind::NodeData => 384,
        }
    }

    const fn index(&self) -> usize {
        match self {
            RequestKind::Headers => 0,
            RequestKind::Bodies => 1,
            RequestKind::Receipts => 2,
            RequestKind::NodeData => 3,
        }
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestKind::Headers => f.write_str("headers"),
            RequestKind::Bodies => f.write_str("bodies"),
            RequestKind::Receipts => f.write_str("receipts"),
            RequestKind::NodeData => f.write_str("node data"),
        }
    }
}

/// The request kinds a peer is able to serve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    kinds: [bool; 4],
}

impl Capabilities {
    /// A peer serving every kind.
    pub const fn full() -> Self {
        Self { kinds: [true; 4] }
    }

    /// A peer serving nothing.
    pub const fn none() -> Self {
        Self { kinds: [false; 4] }
    }

    /// Adds the kind to the set.
    pub const fn with(mut self, kind: RequestKind) -> Self {
        self.kinds[kind.index()] = true;
        self
    }

    /// Removes the kind from the set.
    pub const fn without(mut self, kind: RequestKind) -> Self {
        self.kinds[kind.index()] = false;
        self
    }

    /// Returns true if the kind is in the set.
    pub const fn supports(&self, kind: RequestKind) -> bool {
        self.kinds[kind.index()]
    }
}

impl Default for Capabilities {
    fn default() -> Self {
        Self::full()
    }
}

#[derive(Debug, Clone, Copy)]
struct KindState {
    idle: bool,
    started: Option<Instant>,
    /// Items per second.
    throughput: f64,
    rtt: Duration,
}

impl Default for KindState {
    fn default() -> Self {
        Self { idle: true, started: None, throughput: 0.0, rtt: INITIAL_RTT }
    }
}

#[derive(Debug)]
struct PeerState {
    head: B256,
    td: U256,
    kinds: [KindState; 4],
    lacking: HashSet<B256>,
}

/// A connected peer as seen by the synchronisation engine.
///
/// The handle `H` is the transport through which requests reach the peer. All mutable state is
/// kept behind an internal lock, peers are shared as `Arc<Peer<H>>`.
pub struct Peer<H> {
    id: PeerId,
    handle: H,
    capabilities: Capabilities,
    seq: u64,
    state: Mutex<PeerState>,
    listeners: Arc<Listeners>,
}

impl<H> fmt::Debug for Peer<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id)
            .field("capabilities", &self.capabilities)
            .field("seq", &self.seq)
            .finish_non_exhaustive()
    }
}

impl<H> Peer<H> {
    pub(crate) fn new(
        id: PeerId,
        handle: H,
        capabilities: Capabilities,
        head: B256,
        td: U256,
        seq: u64,
        listeners: Arc<Listeners>,
    ) -> Self {
        let state = PeerState {
            head,
            td,
            kinds: [KindState::default(); 4],
            lacking: HashSet::new(),
        };
        Self { id, handle, capabilities, seq, state: Mutex::new(state), listeners }
    }

    /// The id of the peer.
    pub fn id(&self) -> PeerId {
        self.id
    }

    /// The transport handle of the peer.
    pub fn handle(&self) -> &H {
        &self.handle
    }

    /// Registration order of the peer, lower registered earlier.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Returns true if the peer serves the request kind.
    pub fn supports(&self, kind: RequestKind) -> bool {
        self.capabilities.supports(kind)
    }

    /// The request kinds the peer serves.
    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    /// Updates the advertised head of the peer.
    pub fn set_head(&self, head: B256, td: U256) {
        let mut state = self.state.lock();
        state.head = head;
        state.td = td;
    }

    /// The advertised head hash and total difficulty.
    pub fn head(&self) -> (B256, U256) {
        let state = self.state.lock();
        (state.head, state.td)
    }

    /// The advertised total difficulty.
    pub fn td(&self) -> U256 {
        self.state.lock().td
    }

    /// Returns true if the peer has no outstanding request of the kind.
    pub fn is_idle(&self, kind: RequestKind) -> bool {
        self.state.lock().kinds[kind.index()].idle
    }

    /// Marks the peer busy for the kind.
    ///
    /// Returns false if the peer does not serve the kind or already has a request of that kind
    /// outstanding.
    pub fn try_reserve(&self, kind: RequestKind) -> bool {
        if !self.supports(kind) {
            return false
        }
        let mut state = self.state.lock();
        let kind_state = &mut state.kinds[kind.index()];
        if !kind_state.idle {
            return false
        }
        kind_state.idle = false;
        kind_state.started = Some(Instant::now());
        true
    }

    /// Marks the peer idle again after a request of the kind completed with `delivered` items.
    ///
    /// Updates the throughput and round trip estimates. A request that delivered nothing (a
    /// timeout or an empty answer) resets the throughput to zero so the peer gets the minimum
    /// allotment next time.
    pub fn release(&self, kind: RequestKind, delivered: usize) {
        {
            let mut state = self.state.lock();
            let kind_state = &mut state.kinds[kind.index()];
            if kind_state.idle {
                return
            }
            kind_state.idle = true;
            let elapsed = kind_state.started.take().map(|s| s.elapsed()).unwrap_or_default();
            if delivered == 0 {
                kind_state.throughput = 0.0;
            } else {
                let secs = elapsed.as_secs_f64().max(0.001);
                let measured = delivered as f64 / secs;
                kind_state.throughput = (1.0 - MEASUREMENT_IMPACT) * kind_state.throughput +
                    MEASUREMENT_IMPACT * measured;
                kind_state.rtt = kind_state.rtt.mul_f64(1.0 - MEASUREMENT_IMPACT) +
                    elapsed.mul_f64(MEASUREMENT_IMPACT);
            }
        }
        self.listeners.notify(crate::PeerEvent::Idle(self.id, kind));
    }

    /// Abandons an outstanding request of the kind without measuring it.
    pub fn cancel(&self, kind: RequestKind) {
        {
            let mut state = self.state.lock();
            let kind_state = &mut state.kinds[kind.index()];
            if kind_state.idle {
                return
            }
            kind_state.idle = true;
            kind_state.started = None;
        }
        self.listeners.notify(crate::PeerEvent::Idle(self.id, kind));
    }

    /// Makes the peer idle for every kind without touching the estimates.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        for kind_state in state.kinds.iter_mut() {
            kind_state.idle = true;
            kind_state.started = None;
        }
        state.lacking.clear();
    }

    /// Estimated items per second for the kind.
    pub fn throughput(&self, kind: RequestKind) -> f64 {
        self.state.lock().kinds[kind.index()].throughput
    }

    /// Estimated round trip time for the kind.
    pub fn rtt(&self, kind: RequestKind) -> Duration {
        self.state.lock().kinds[kind.index()].rtt
    }

    /// Number of items the peer is expected to deliver within `target_rtt`.
    ///
    /// Always at least one and at most [`RequestKind::max_fetch`].
    pub fn capacity(&self, kind: RequestKind, target_rtt: Duration) -> usize {
        let throughput = self.throughput(kind);
        let estimate = 1.0 + (throughput * target_rtt.as_secs_f64()).max(1.0);
        (estimate as usize).clamp(1, kind.max_fetch())
    }

    /// Estimated time the peer needs to serve `amount` items of the kind.
    pub fn estimated_service_time(&self, kind: RequestKind, amount: usize) -> Duration {
        let state = self.state.lock();
        let kind_state = &state.kinds[kind.index()];
        if kind_state.throughput <= f64::EPSILON {
            return kind_state.rtt.saturating_mul(2)
        }
        kind_state.rtt + Duration::from_secs_f64(amount as f64 / kind_state.throughput)
    }

    /// Remembers that the peer does not have the item.
    pub fn mark_lacking(&self, hash: B256) {
        let mut state = self.state.lock();
        if state.lacking.len() >= MAX_LACKING_HASHES {
            // forget an arbitrary entry
            if let Some(evict) = state.lacking.iter().next().copied() {
                state.lacking.remove(&evict);
            }
        }
        state.lacking.insert(hash);
    }

    /// Returns true if the peer is known to not have the item.
    pub fn lacks(&self, hash: &B256) -> bool {
        self.state.lock().lacking.contains(hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> Peer<()> {
        Peer::new(
            PeerId::repeat_byte(1),
            (),
            Capabilities::full().without(RequestKind::NodeData),
            B256::ZERO,
            U256::from(10),
            0,
            Arc::default(),
        )
    }

    #[test]
    fn reserve_and_release() {
        let peer = peer();
        assert!(!peer.try_reserve(RequestKind::NodeData));
        assert!(peer.try_reserve(RequestKind::Bodies));
        assert!(!peer.try_reserve(RequestKind::Bodies));
        assert!(peer.is_idle(RequestKind::Headers));

        peer.release(RequestKind::Bodies, 64);
        assert!(peer.is_idle(RequestKind::Bodies));
        assert!(peer.throughput(RequestKind::Bodies) > 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn release_measures_round_trip() {
        let peer = peer();
        assert!(peer.try_reserve(RequestKind::Headers));
        tokio::time::advance(Duration::from_secs(2)).await;
        peer.release(RequestKind::Headers, 100);

        // one measurement of 2s and 50 items per second folded into the initial estimates
        let rtt = peer.rtt(RequestKind::Headers).as_secs_f64();
        assert!((rtt - 4.7).abs() < 1e-6);
        assert!((peer.throughput(RequestKind::Headers) - 5.0).abs() < 1e-6);
    }

    #[test]
    fn capacity_is_clamped() {
        let peer = peer();
        assert_eq!(peer.capacity(RequestKind::Headers, Duration::from_secs(3)), 2);
        {
            let mut state = peer.state.lock();
            state.kinds[RequestKind::Bodies.index()].throughput = 1_000_000.0;
        }
        assert_eq!(
            peer.capacity(RequestKind::Bodies, Duration::from_secs(3)),
            RequestKind::Bodies.max_fetch()
        );
    }

    #[test]
    fn timeout_resets_throughput() {
        let peer = peer();
        assert!(peer.try_reserve(RequestKind::Receipts));
        peer.release(RequestKind::Receipts, 10);
        assert!(peer.try_reserve(RequestKind::Receipts));
        peer.release(RequestKind::Receipts, 0);
        assert_eq!(peer.throughput(RequestKind::Receipts), 0.0);
    }

    #[test]
    fn lacking_is_bounded() {
        let peer = peer();
        for i in 0..MAX_LACKING_HASHES + 10 {
            peer.mark_lacking(B256::left_padding_from(&(i as u64).to_be_bytes()));
        }
        assert_eq!(peer.state.lock().lacking.len(), MAX_LACKING_HASHES);
    }
}
