//! Retrieval of verified answers from light servers.

use crate::{
    distributor::{DistRequest, DistributeError, RequestDistributor},
    metrics::LesMetrics,
    peer::{LightPeer, Server},
    request::{LightRequest, LightResponse},
    server_pool::ServerPool,
};
use dos_interfaces::p2p::peer::{PeerReporter, ReputationChangeKind};
use dos_metrics::SharedMetrics;
use dos_peers::RequestKind;
use dos_primitives::PeerId;
use futures::future::{BoxFuture, FutureExt, Shared, WeakShared};
use parking_lot::Mutex;
use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use thiserror::Error;
use tokio::{
    sync::oneshot,
    time::{timeout, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Settings of the [`RetrieveManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetrieveConfig {
    /// How long a single server gets to answer.
    pub request_timeout: Duration,
    /// How long a retrieval may take across all attempts.
    pub deadline: Duration,
}

impl Default for RetrieveConfig {
    fn default() -> Self {
        Self { request_timeout: Duration::from_secs(2), deadline: Duration::from_secs(20) }
    }
}

/// Why a retrieval failed.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RetrieveError {
    /// Every capable server was tried without success.
    #[error("all capable servers tried")]
    Exhausted,
    /// The deadline of the retrieval passed.
    #[error("retrieval timed out")]
    Timeout,
    /// The retrieval was cancelled.
    #[error("retrieval cancelled")]
    Cancelled,
    /// The distributor shut down.
    #[error("retrieval closed")]
    Closed,
}

type RetrievalFuture = BoxFuture<'static, Result<LightResponse, RetrieveError>>;

/// A running retrieval, alive while at least one caller waits for it.
struct InFlight {
    id: u64,
    retrieval: WeakShared<RetrievalFuture>,
}

#[derive(Debug)]
struct PendingAnswer {
    peer_id: PeerId,
    tx: oneshot::Sender<LightResponse>,
}

struct RetrieveInner {
    config: RetrieveConfig,
    distributor: RequestDistributor,
    reporter: Arc<dyn PeerReporter>,
    metrics: LesMetrics,
    cancel: CancellationToken,
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, PendingAnswer>>,
    in_flight: Mutex<HashMap<LightRequest, InFlight>>,
}

/// Unregisters a retrieval once it completes or every caller gave up on it.
struct InFlightGuard {
    inner: Arc<RetrieveInner>,
    request: LightRequest,
    id: u64,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut in_flight = self.inner.in_flight.lock();
        if in_flight.get(&self.request).map_or(false, |entry| entry.id == self.id) {
            in_flight.remove(&self.request);
        }
    }
}

/// A request sent to a server and not settled yet.
///
/// Dropped unsettled, it withdraws the request and frees the server without judging it.
struct Outstanding<'a> {
    inner: &'a RetrieveInner,
    server: Server,
    request_id: u64,
    kind: RequestKind,
    settled: bool,
}

impl Outstanding<'_> {
    fn settle(mut self) {
        self.settled = true;
    }
}

impl Drop for Outstanding<'_> {
    fn drop(&mut self) {
        if self.settled {
            return
        }
        let peer_id = self.server.id();
        trace!(target: "les::retrieve", peer_id = %peer_id, request_id = self.request_id, "Withdrawing request");
        self.inner.pending.lock().remove(&self.request_id);
        self.server.cancel(self.kind);
        self.inner.distributor.pool().settle(&peer_id);
    }
}

/// Retrieves answers from light servers, retrying with other servers until one answers
/// correctly.
///
/// Concurrent retrievals of the same request share a single round of network requests.
#[derive(Clone)]
pub struct RetrieveManager {
    inner: Arc<RetrieveInner>,
}

impl fmt::Debug for RetrieveManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetrieveManager")
            .field("config", &self.inner.config)
            .field("pending", &self.inner.pending.lock().len())
            .field("in_flight", &self.inner.in_flight.lock().len())
            .finish_non_exhaustive()
    }
}

impl RetrieveManager {
    /// Creates a manager sending through the distributor.
    ///
    /// Retrievals fail with [`RetrieveError::Cancelled`] once the token fires.
    pub fn new(
        config: RetrieveConfig,
        distributor: RequestDistributor,
        reporter: Arc<dyn PeerReporter>,
        metrics: SharedMetrics,
        cancel: CancellationToken,
    ) -> Self {
        let inner = RetrieveInner {
            config,
            distributor,
            reporter,
            metrics: LesMetrics::new(metrics),
            cancel,
            next_id: AtomicU64::new(1),
            pending: Mutex::default(),
            in_flight: Mutex::default(),
        };
        Self { inner: Arc::new(inner) }
    }

    /// The pool ranking the servers.
    pub fn pool(&self) -> &Arc<ServerPool> {
        self.inner.distributor.pool()
    }

    /// Retrieves a valid answer to the request.
    ///
    /// Joins a retrieval of the same request that is already running. A retrieval every caller
    /// dropped is abandoned, its outstanding request is withdrawn.
    pub async fn retrieve(&self, request: LightRequest) -> Result<LightResponse, RetrieveError> {
        let retrieval = {
            let mut in_flight = self.inner.in_flight.lock();
            match in_flight.get(&request).and_then(|entry| entry.retrieval.upgrade()) {
                Some(retrieval) => {
                    trace!(target: "les::retrieve", ?request, "Joining running retrieval");
                    retrieval
                }
                None => {
                    let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
                    let guard = InFlightGuard {
                        inner: Arc::clone(&self.inner),
                        request: request.clone(),
                        id,
                    };
                    let retrieval = async move { guard.inner.run(&guard.request).await }
                        .boxed()
                        .shared();
                    if let Some(weak) = retrieval.downgrade() {
                        in_flight.insert(request, InFlight { id, retrieval: weak });
                    }
                    retrieval
                }
            }
        };
        retrieval.await
    }

    /// Hands an answer to the retrieval waiting for it.
    ///
    /// Returns false if nothing waits for the answer from this peer, e.g. because the request
    /// already timed out.
    pub fn deliver(&self, peer_id: PeerId, response: LightResponse) -> bool {
        let answer = {
            let mut pending = self.inner.pending.lock();
            match pending.get(&response.request_id) {
                Some(answer) if answer.peer_id == peer_id => pending.remove(&response.request_id),
                _ => None,
            }
        };
        match answer {
            Some(answer) => answer.tx.send(response).is_ok(),
            None => {
                trace!(target: "les::retrieve", peer_id = %peer_id, request_id = response.request_id, "Dropping unsolicited answer");
                false
            }
        }
    }

    /// Number of requests waiting for an answer.
    pub fn pending(&self) -> usize {
        self.inner.pending.lock().len()
    }
}

impl RetrieveInner {
    async fn run(&self, request: &LightRequest) -> Result<LightResponse, RetrieveError> {
        let deadline = Instant::now() + self.config.deadline;
        let kind = request.kind();
        let pool = self.distributor.pool();
        let mut tried = HashSet::new();

        loop {
            if Instant::now() >= deadline {
                debug!(target: "les::retrieve", ?request, tried = tried.len(), "Retrieval deadline passed");
                return Err(RetrieveError::Timeout)
            }
            let dist = DistRequest::new(request.clone())
                .excluding(tried.clone())
                .with_deadline(deadline);
            if !self.distributor.has_candidates(&dist) {
                self.metrics.retrieve_exhausted();
                debug!(target: "les::retrieve", ?request, tried = tried.len(), "No untried server left");
                return Err(RetrieveError::Exhausted)
            }

            let assigned = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(RetrieveError::Cancelled),
                assigned = self.distributor.distribute(dist) => assigned,
            };
            let server = match assigned {
                Ok(server) => server,
                // servers were busy, check the deadline and the candidates again
                Err(DistributeError::NoPeerAvailable) => continue,
                Err(DistributeError::Cancelled) => return Err(RetrieveError::Cancelled),
                Err(DistributeError::Closed) => return Err(RetrieveError::Closed),
            };
            let peer_id = server.id();
            tried.insert(peer_id);

            let request_id = self.next_id.fetch_add(1, Ordering::Relaxed);
            let (tx, rx) = oneshot::channel();
            self.pending.lock().insert(request_id, PendingAnswer { peer_id, tx });
            let sent = Instant::now();
            if let Err(error) = server.handle().request(request_id, request) {
                debug!(target: "les::retrieve", peer_id = %peer_id, %error, "Failed to send request");
                self.pending.lock().remove(&request_id);
                server.cancel(kind);
                pool.record_failure(&peer_id);
                continue
            }
            trace!(target: "les::retrieve", peer_id = %peer_id, request_id, ?request, "Sent request");
            let outstanding = Outstanding {
                inner: self,
                server: Arc::clone(&server),
                request_id,
                kind,
                settled: false,
            };

            let wait = self.config.request_timeout.min(deadline.saturating_duration_since(sent));
            let answer = tokio::select! {
                biased;
                // the unsettled request is withdrawn on return
                _ = self.cancel.cancelled() => return Err(RetrieveError::Cancelled),
                answer = timeout(wait, rx) => answer,
            };
            outstanding.settle();

            match answer {
                Ok(Ok(response)) => match request.validate(&response.payload) {
                    Ok(()) => {
                        let latency = sent.elapsed();
                        server.release(kind, request.amount());
                        pool.record_success(&peer_id, latency);
                        pool.record_served_cost(&peer_id, response.buffer_value);
                        self.metrics.retrieve_success();
                        self.metrics.record_latency(latency);
                        trace!(target: "les::retrieve", peer_id = %peer_id, request_id, ?latency, "Retrieved");
                        return Ok(response)
                    }
                    Err(error) => {
                        debug!(target: "les::retrieve", peer_id = %peer_id, %error, "Invalid answer");
                        server.release(kind, 0);
                        pool.record_failure(&peer_id);
                        self.reporter.report(peer_id, ReputationChangeKind::BadMessage);
                        self.metrics.retrieve_invalid();
                    }
                },
                Ok(Err(_)) | Err(_) => {
                    self.pending.lock().remove(&request_id);
                    debug!(target: "les::retrieve", peer_id = %peer_id, request_id, "Request timed out");
                    server.cancel(kind);
                    pool.record_timeout(&peer_id);
                    self.reporter.report(peer_id, ReputationChangeKind::Timeout);
                    self.metrics.retrieve_timeout();
                }
            }
        }
    }
}
