//! Pending, in-flight and arrived bookkeeping of one kind of data.

use dos_peers::RequestKind;
use dos_primitives::PeerId;
use std::{
    collections::{HashMap, HashSet, VecDeque},
    hash::Hash,
    time::Duration,
};
use tokio::time::Instant;
use tracing::trace;

/// Errors of [`FetchQueue`] deliveries.
#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    /// The peer has no outstanding request in this queue.
    #[error("no fetches pending")]
    NoFetchesPending,
    /// The delivery does not fit the request, everything was requeued.
    #[error("invalid delivery")]
    InvalidDelivery,
}

/// An outstanding request of a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest<K> {
    /// The peer serving the request.
    pub peer_id: PeerId,
    /// The requested items, in request order.
    pub keys: Vec<K>,
    /// When the request was issued.
    pub issued: Instant,
    /// When the request expires.
    pub deadline: Instant,
}

/// Result of a successful delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivered<K> {
    /// Number of items moved to arrived.
    pub accepted: usize,
    /// Requested items the peer did not deliver, returned to pending.
    pub missing: Vec<K>,
}

/// The bookkeeping of one data kind during a synchronisation run.
///
/// Every tracked key is in exactly one of three disjoint states: pending (not requested yet),
/// in flight (part of exactly one peer's outstanding request) or arrived (delivered and
/// verified, waiting to be taken by the importer). Keys move pending → in flight → arrived, or
/// back to pending when a request fails.
#[derive(Debug)]
pub struct FetchQueue<K, V> {
    kind: RequestKind,
    pending: VecDeque<K>,
    in_flight: HashMap<PeerId, FetchRequest<K>>,
    in_flight_keys: HashSet<K>,
    arrived: HashMap<K, V>,
}

impl<K, V> FetchQueue<K, V>
where
    K: Clone + Eq + Hash + std::fmt::Debug,
{
    /// Creates an empty queue for the kind.
    pub fn new(kind: RequestKind) -> Self {
        Self {
            kind,
            pending: VecDeque::new(),
            in_flight: HashMap::new(),
            in_flight_keys: HashSet::new(),
            arrived: HashMap::new(),
        }
    }

    /// The kind of data tracked by the queue.
    pub const fn kind(&self) -> RequestKind {
        self.kind
    }

    /// Returns true if the key is tracked in any state.
    pub fn contains(&self, key: &K) -> bool {
        self.in_flight_keys.contains(key) ||
            self.arrived.contains_key(key) ||
            self.pending.contains(key)
    }

    /// Adds keys to the pending set, skipping keys that are already tracked.
    ///
    /// Returns the number of keys added.
    pub fn schedule(&mut self, keys: impl IntoIterator<Item = K>) -> usize {
        let mut added = 0;
        for key in keys {
            if !self.contains(&key) {
                self.pending.push_back(key);
                added += 1;
            }
        }
        if added > 0 {
            trace!(target: "sync::queue", kind = %self.kind, added, pending = self.pending.len(), "Scheduled fetches");
        }
        added
    }

    /// Reserves up to `max` pending keys for the peer.
    ///
    /// Returns `None` if the peer already has a request outstanding or nothing is pending.
    pub fn reserve(&mut self, peer_id: PeerId, max: usize, ttl: Duration) -> Option<FetchRequest<K>> {
        self.reserve_where(peer_id, max, ttl, |_| true)
    }

    /// Like [`FetchQueue::reserve`], but only reserves keys accepted by the filter.
    ///
    /// Rejected keys keep their position in the pending queue.
    pub fn reserve_where(
        &mut self,
        peer_id: PeerId,
        max: usize,
        ttl: Duration,
        mut accept: impl FnMut(&K) -> bool,
    ) -> Option<FetchRequest<K>> {
        if self.in_flight.contains_key(&peer_id) || self.pending.is_empty() || max == 0 {
            return None
        }
        let mut keys = Vec::new();
        let mut skipped = VecDeque::new();
        while keys.len() < max {
            let Some(key) = self.pending.pop_front() else { break };
            if accept(&key) {
                keys.push(key);
            } else {
                skipped.push_back(key);
            }
        }
        // put back what the peer cannot serve, in order
        while let Some(key) = skipped.pop_back() {
            self.pending.push_front(key);
        }
        if keys.is_empty() {
            return None
        }
        let now = Instant::now();
        let request = FetchRequest { peer_id, keys, issued: now, deadline: now + ttl };
        self.in_flight_keys.extend(request.keys.iter().cloned());
        self.in_flight.insert(peer_id, request.clone());
        Some(request)
    }

    /// The outstanding request of the peer.
    pub fn request(&self, peer_id: &PeerId) -> Option<&FetchRequest<K>> {
        self.in_flight.get(peer_id)
    }

    fn requeue(&mut self, keys: Vec<K>) {
        for key in keys.into_iter().rev() {
            self.in_flight_keys.remove(&key);
            self.pending.push_front(key);
        }
    }

    fn take_request(&mut self, peer_id: &PeerId) -> Result<FetchRequest<K>, QueueError> {
        self.in_flight.remove(peer_id).ok_or(QueueError::NoFetchesPending)
    }

    /// Delivers values matched by position to the keys of the peer's request.
    ///
    /// The delivery is rejected as a whole if it is longer than the request or any value fails
    /// validation. Keys beyond the end of a short delivery are returned to pending.
    pub fn deliver_ordered(
        &mut self,
        peer_id: PeerId,
        values: Vec<V>,
        mut validate: impl FnMut(&K, &V) -> bool,
    ) -> Result<Delivered<K>, QueueError> {
        let request = self.take_request(&peer_id)?;
        let valid = values.len() <= request.keys.len() &&
            request.keys.iter().zip(values.iter()).all(|(key, value)| validate(key, value));
        if !valid {
            trace!(target: "sync::queue", kind = %self.kind, %peer_id, "Rejected delivery");
            self.requeue(request.keys);
            return Err(QueueError::InvalidDelivery)
        }

        let accepted = values.len();
        let mut keys = request.keys.into_iter();
        for value in values {
            // length checked above
            let Some(key) = keys.next() else { break };
            self.in_flight_keys.remove(&key);
            self.arrived.insert(key, value);
        }
        let missing: Vec<K> = keys.collect();
        self.requeue(missing.clone());
        Ok(Delivered { accepted, missing })
    }

    /// Delivers values carrying their own keys.
    ///
    /// Values for keys outside the peer's request are ignored, requested keys without a value
    /// are returned to pending. A non-empty delivery that matches none of the requested keys is
    /// an answer to an earlier request and leaves the current one in flight.
    pub fn deliver_keyed(
        &mut self,
        peer_id: PeerId,
        values: impl IntoIterator<Item = (K, V)>,
    ) -> Result<Delivered<K>, QueueError> {
        let values: Vec<(K, V)> = values.into_iter().collect();
        let stale = self.in_flight.get(&peer_id).map_or(false, |request| {
            !values.is_empty() && values.iter().all(|(key, _)| !request.keys.contains(key))
        });
        if stale {
            return Err(QueueError::NoFetchesPending)
        }
        let request = self.take_request(&peer_id)?;
        let mut requested: HashSet<K> = request.keys.iter().cloned().collect();
        let mut accepted = 0;
        for (key, value) in values {
            if requested.remove(&key) {
                self.in_flight_keys.remove(&key);
                self.arrived.insert(key, value);
                accepted += 1;
            }
        }
        let missing: Vec<K> =
            request.keys.into_iter().filter(|key| requested.contains(key)).collect();
        self.requeue(missing.clone());
        Ok(Delivered { accepted, missing })
    }

    /// Expires all requests whose deadline passed, returning their keys to pending.
    ///
    /// Returns the expired requests.
    pub fn expire(&mut self, now: Instant) -> Vec<FetchRequest<K>> {
        let expired: Vec<PeerId> = self
            .in_flight
            .iter()
            .filter(|(_, request)| request.deadline <= now)
            .map(|(peer_id, _)| *peer_id)
            .collect();
        let mut requests = Vec::with_capacity(expired.len());
        for peer_id in expired {
            if let Some(request) = self.in_flight.remove(&peer_id) {
                self.requeue(request.keys.clone());
                requests.push(request);
            }
        }
        requests
    }

    /// Returns the outstanding keys of the peer to pending.
    pub fn revoke(&mut self, peer_id: &PeerId) -> Vec<K> {
        match self.in_flight.remove(peer_id) {
            Some(request) => {
                self.requeue(request.keys.clone());
                request.keys
            }
            None => Vec::new(),
        }
    }

    /// Takes an arrived value.
    pub fn take_arrived(&mut self, key: &K) -> Option<V> {
        self.arrived.remove(key)
    }

    /// Takes all arrived values.
    pub fn drain_arrived(&mut self) -> Vec<(K, V)> {
        self.arrived.drain().collect()
    }

    /// Number of keys waiting to be requested.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Number of keys in outstanding requests.
    pub fn in_flight_len(&self) -> usize {
        self.in_flight_keys.len()
    }

    /// Number of arrived keys not taken yet.
    pub fn arrived_len(&self) -> usize {
        self.arrived.len()
    }

    /// Returns true if nothing is pending or in flight.
    pub fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.in_flight.is_empty()
    }

    /// Forgets everything, returning the peers that had a request outstanding.
    pub fn reset(&mut self) -> Vec<PeerId> {
        let peers = self.in_flight.keys().copied().collect();
        self.pending.clear();
        self.in_flight.clear();
        self.in_flight_keys.clear();
        self.arrived.clear();
        peers
    }
}
