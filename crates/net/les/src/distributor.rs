//! Assignment of light requests to servers.
//!
//! Requests wait in a FIFO queue until a capable server is idle for their kind. Among the
//! idle servers the one expected to answer soonest wins, ties go to the server with the higher
//! pool score and then to the one that registered first. The queue is re-evaluated whenever a server registers or becomes idle, a request no
//! server picked up before its deadline fails with [`DistributeError::NoPeerAvailable`].

use crate::{
    metrics::LesMetrics,
    peer::{LightPeer, Server, ServerRegistry},
    request::LightRequest,
    server_pool::{ServerPool, NEUTRAL_SCORE},
};
use dos_metrics::SharedMetrics;
use dos_peers::PeerEvent;
use dos_primitives::PeerId;
use dos_tasks::TaskExecutor;
use parking_lot::Mutex;
use std::{
    collections::{BTreeMap, HashSet},
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    task::{Context, Poll},
    time::Duration,
};
use thiserror::Error;
use tokio::{
    sync::{oneshot, Notify},
    task::JoinHandle,
    time::{sleep_until, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Settings of the [`RequestDistributor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DistributorConfig {
    /// How long a request may wait for a server.
    pub wait_timeout: Duration,
}

impl Default for DistributorConfig {
    fn default() -> Self {
        Self { wait_timeout: Duration::from_secs(10) }
    }
}

/// Why a request was not assigned.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DistributeError {
    /// No capable server became idle before the deadline.
    #[error("no peer available")]
    NoPeerAvailable,
    /// The request was cancelled while queued.
    #[error("request cancelled")]
    Cancelled,
    /// The distributor shut down.
    #[error("distributor closed")]
    Closed,
}

/// A request waiting for a server.
#[derive(Debug, Clone)]
pub struct DistRequest {
    /// The request to assign.
    pub request: LightRequest,
    /// Servers that must not be picked.
    pub exclude: HashSet<PeerId>,
    /// Gives up earlier than the configured wait timeout.
    pub deadline: Option<Instant>,
}

impl DistRequest {
    /// A request any capable server may serve.
    pub fn new(request: LightRequest) -> Self {
        Self { request, exclude: HashSet::new(), deadline: None }
    }

    /// Excludes the servers.
    pub fn excluding(mut self, exclude: HashSet<PeerId>) -> Self {
        self.exclude = exclude;
        self
    }

    /// Sets a deadline.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// A queued request, resolves to the server it was assigned to.
///
/// The server is reserved for the kind of the request, the receiver is responsible for
/// releasing it. Dropping the ticket withdraws a request that is still queued.
#[derive(Debug)]
#[must_use = "the assigned server stays reserved"]
pub struct DistTicket {
    id: u64,
    rx: oneshot::Receiver<Result<Server, DistributeError>>,
}

impl DistTicket {
    /// The id to [cancel](RequestDistributor::cancel) the request with.
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Future for DistTicket {
    type Output = Result<Server, DistributeError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|res| res.unwrap_or(Err(DistributeError::Closed)))
    }
}

#[derive(Debug)]
struct Pending {
    request: DistRequest,
    deadline: Instant,
    tx: oneshot::Sender<Result<Server, DistributeError>>,
}

#[derive(Debug, Default)]
struct DistQueue {
    pending: BTreeMap<u64, Pending>,
    closed: bool,
}

#[derive(Debug)]
struct DistributorInner {
    config: DistributorConfig,
    registry: Arc<ServerRegistry>,
    pool: Arc<ServerPool>,
    metrics: LesMetrics,
    queue: Mutex<DistQueue>,
    wake: Notify,
    next_id: AtomicU64,
}

/// Hands light requests to the best idle server.
#[derive(Debug, Clone)]
pub struct RequestDistributor {
    inner: Arc<DistributorInner>,
}

impl RequestDistributor {
    /// Creates a distributor over the servers of the registry.
    ///
    /// Queued requests are only re-evaluated on server events once [`Self::run`] is polled.
    pub fn new(
        config: DistributorConfig,
        registry: Arc<ServerRegistry>,
        pool: Arc<ServerPool>,
        metrics: SharedMetrics,
    ) -> Self {
        let inner = DistributorInner {
            config,
            registry,
            pool,
            metrics: LesMetrics::new(metrics),
            queue: Mutex::default(),
            wake: Notify::new(),
            next_id: AtomicU64::new(1),
        };
        Self { inner: Arc::new(inner) }
    }

    /// The servers requests are distributed to.
    pub fn registry(&self) -> &Arc<ServerRegistry> {
        &self.inner.registry
    }

    /// The pool ranking the servers.
    pub fn pool(&self) -> &Arc<ServerPool> {
        &self.inner.pool
    }

    /// Queues the request.
    pub fn queue(&self, request: DistRequest) -> DistTicket {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        {
            let mut queue = self.inner.queue.lock();
            if queue.closed {
                let _ = tx.send(Err(DistributeError::Closed));
                return DistTicket { id, rx }
            }
            let mut deadline = Instant::now() + self.inner.config.wait_timeout;
            if let Some(limit) = request.deadline {
                deadline = deadline.min(limit);
            }
            trace!(target: "les::distributor", id, request = ?request.request, "Queued request");
            queue.pending.insert(id, Pending { request, deadline, tx });
        }
        self.inner.metrics.distributor_queued();
        self.inner.dispatch();
        self.inner.wake.notify_one();
        DistTicket { id, rx }
    }

    /// Withdraws a queued request, returns false if it was already assigned or expired.
    pub fn cancel(&self, id: u64) -> bool {
        let Some(pending) = self.inner.queue.lock().pending.remove(&id) else { return false };
        let _ = pending.tx.send(Err(DistributeError::Cancelled));
        trace!(target: "les::distributor", id, "Cancelled request");
        true
    }

    /// Queues the request and waits for its assignment.
    pub async fn distribute(&self, request: DistRequest) -> Result<Server, DistributeError> {
        self.queue(request).await
    }

    /// Number of requests waiting for a server.
    pub fn pending(&self) -> usize {
        self.inner.queue.lock().pending.len()
    }

    /// Returns true if any registered server could serve the request once idle.
    pub fn has_candidates(&self, request: &DistRequest) -> bool {
        self.inner.registry.peers().iter().any(|server| self.inner.is_candidate(server, request))
    }

    /// Spawns [`Self::run`] as a critical task.
    pub fn spawn(&self, executor: &TaskExecutor) -> JoinHandle<()> {
        executor.spawn_critical("les distributor", self.clone().run(executor.cancellation_token()))
    }

    /// Re-evaluates the queue on server events and deadlines until cancelled.
    ///
    /// All requests still queued afterwards fail with [`DistributeError::Closed`].
    pub async fn run(self, cancel: CancellationToken) {
        let mut events = self.inner.registry.subscribe();
        loop {
            self.inner.dispatch();
            let deadline = self.inner.next_deadline();
            let expiry = async move {
                match deadline {
                    Some(deadline) => sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            };
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = self.inner.wake.notified() => {}
                event = events.recv() => match event {
                    Some(PeerEvent::Registered(_) | PeerEvent::Idle(..)) => {}
                    Some(PeerEvent::Unregistered(_)) => continue,
                    None => break,
                },
                _ = expiry => {}
            }
        }
        self.close();
    }

    fn close(&self) {
        let pending = {
            let mut queue = self.inner.queue.lock();
            queue.closed = true;
            std::mem::take(&mut queue.pending)
        };
        debug!(target: "les::distributor", pending = pending.len(), "Distributor closed");
        for (_, pending) in pending {
            let _ = pending.tx.send(Err(DistributeError::Closed));
        }
        self.inner.metrics.set_pending(0);
    }
}

impl DistributorInner {
    /// Returns true if the server may be handed the request once idle.
    fn is_candidate(&self, server: &Server, request: &DistRequest) -> bool {
        server.supports(request.request.kind()) &&
            !request.exclude.contains(&server.id()) &&
            server.handle().can_serve(&request.request) &&
            self.pool.meets_floor(&server.id())
    }

    /// Reserves the idle candidate with the lowest estimated service time, the better scored
    /// one among equals.
    fn select(&self, request: &DistRequest) -> Option<Server> {
        let kind = request.request.kind();
        let amount = request.request.amount();
        let mut candidates: Vec<_> = self
            .registry
            .peers()
            .into_iter()
            .filter(|server| {
                server.is_idle(kind) &&
                    self.is_candidate(server, request) &&
                    self.pool.is_eligible(&server.id())
            })
            .map(|server| {
                let score = self.pool.score(&server.id()).unwrap_or(NEUTRAL_SCORE);
                (server.estimated_service_time(kind, amount), score, server.seq(), server)
            })
            .collect();
        candidates.sort_by(|a, b| {
            a.0.cmp(&b.0).then_with(|| b.1.total_cmp(&a.1)).then_with(|| a.2.cmp(&b.2))
        });
        candidates.into_iter().map(|(.., server)| server).find(|server| server.try_reserve(kind))
    }

    /// Assigns what can be assigned and expires what is overdue.
    fn dispatch(&self) {
        let mut queue = self.queue.lock();
        let now = Instant::now();
        let ids: Vec<u64> = queue.pending.keys().copied().collect();
        for id in ids {
            let Some(pending) = queue.pending.get(&id) else { continue };
            if pending.tx.is_closed() {
                queue.pending.remove(&id);
                continue
            }
            if let Some(server) = self.select(&pending.request) {
                let Some(pending) = queue.pending.remove(&id) else { continue };
                let kind = pending.request.request.kind();
                if pending.tx.send(Ok(Arc::clone(&server))).is_err() {
                    server.cancel(kind);
                    continue
                }
                self.pool.on_assign(&server.id());
                self.metrics.distributor_assigned();
                trace!(target: "les::distributor", id, peer_id = %server.id(), %kind, "Assigned request");
            } else if pending.deadline <= now {
                if let Some(pending) = queue.pending.remove(&id) {
                    let _ = pending.tx.send(Err(DistributeError::NoPeerAvailable));
                }
                self.metrics.distributor_expired();
                debug!(target: "les::distributor", id, "No peer available before deadline");
            }
        }
        self.metrics.set_pending(queue.pending.len());
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.queue.lock().pending.values().map(|pending| pending.deadline).min()
    }
}
