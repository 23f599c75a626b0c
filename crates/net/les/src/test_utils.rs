//! Simulated light servers.

#![allow(missing_docs, unreachable_pub)]

use crate::{
    distributor::{DistributorConfig, RequestDistributor},
    peer::{LightPeer, ServerHandle, ServerRegistry},
    request::{LightPayload, LightRequest, LightResponse},
    retrieve::{RetrieveConfig, RetrieveManager},
    server_pool::{ServerPool, ServerPoolConfig},
};
use dos_interfaces::{
    db::MemoryDatabase,
    p2p::error::RequestResult,
    test_utils::{RecordingReporter, TestChain},
};
use dos_metrics::CountingMetrics;
use dos_peers::Capabilities;
use dos_primitives::{keccak256, BlockNumber, Bytes, PeerId, Receipt, B256};
use parking_lot::Mutex;
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::{
    sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

/// How a [`TestLightServer`] answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ServerBehaviour {
    #[default]
    Honest,
    /// Never answers.
    Silent,
    /// Answers with data that fails validation.
    Garbage,
    /// Answers honestly after the delay.
    Delayed(Duration),
}

/// A light server serving a [`TestChain`].
#[derive(Debug)]
pub struct TestLightServer {
    id: PeerId,
    chain: TestChain,
    codes: Mutex<HashMap<B256, Bytes>>,
    behaviour: Mutex<ServerBehaviour>,
    responses: UnboundedSender<(PeerId, LightResponse)>,
    requests: Mutex<Vec<LightRequest>>,
}

impl TestLightServer {
    /// Makes the code available, returns its hash.
    pub fn add_code(&self, code: Bytes) -> B256 {
        let hash = keccak256(&code);
        self.codes.lock().insert(hash, code);
        hash
    }

    /// All requests received so far.
    pub fn requests(&self) -> Vec<LightRequest> {
        self.requests.lock().clone()
    }

    fn answer(&self, request: &LightRequest) -> LightPayload {
        match request {
            LightRequest::Headers(request) => LightPayload::Headers(self.chain.answer_headers(request)),
            LightRequest::Body { header } => LightPayload::Body(
                self.chain.answer_bodies(&[header.hash()]).pop().unwrap_or_default(),
            ),
            LightRequest::Receipts { header } => LightPayload::Receipts(
                self.chain.answer_receipts(&[header.hash()]).pop().unwrap_or_default(),
            ),
            LightRequest::TrieNode { hash } => {
                LightPayload::TrieNode(self.chain.node(hash).cloned().unwrap_or_default())
            }
            LightRequest::Code { hash } => {
                LightPayload::Code(self.codes.lock().get(hash).cloned().unwrap_or_default())
            }
        }
    }
}

fn corrupt(payload: LightPayload) -> LightPayload {
    match payload {
        LightPayload::Headers(mut headers) => {
            if let Some(first) = headers.first_mut() {
                first.extra_data = Bytes::from_static(b"garbage");
            }
            LightPayload::Headers(headers)
        }
        LightPayload::Body(mut body) => {
            body.transactions.push(Bytes::from_static(b"garbage"));
            LightPayload::Body(body)
        }
        LightPayload::Receipts(mut receipts) => {
            receipts.push(Receipt::default());
            LightPayload::Receipts(receipts)
        }
        LightPayload::TrieNode(_) => LightPayload::TrieNode(Bytes::from_static(b"garbage")),
        LightPayload::Code(_) => LightPayload::Code(Bytes::from_static(b"garbage")),
    }
}

impl LightPeer for TestLightServer {
    fn id(&self) -> PeerId {
        self.id
    }

    fn request(&self, request_id: u64, request: &LightRequest) -> RequestResult<()> {
        self.requests.lock().push(request.clone());
        let behaviour = *self.behaviour.lock();
        let payload = match behaviour {
            ServerBehaviour::Silent => return Ok(()),
            ServerBehaviour::Garbage => corrupt(self.answer(request)),
            ServerBehaviour::Honest | ServerBehaviour::Delayed(_) => self.answer(request),
        };
        let response = LightResponse { request_id, buffer_value: 1, payload };
        match behaviour {
            ServerBehaviour::Delayed(delay) => {
                let (responses, id) = (self.responses.clone(), self.id);
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = responses.send((id, response));
                });
                Ok(())
            }
            _ => Ok(self.responses.send((self.id, response))?),
        }
    }

    fn head_number(&self) -> BlockNumber {
        self.chain.head_number()
    }
}

/// A set of simulated servers registered in one registry and ranked by one pool.
#[derive(Debug)]
pub struct TestLightNetwork {
    registry: Arc<ServerRegistry>,
    pool: Arc<ServerPool>,
    responses: UnboundedSender<(PeerId, LightResponse)>,
    receiver: Mutex<Option<UnboundedReceiver<(PeerId, LightResponse)>>>,
}

impl Default for TestLightNetwork {
    /// Servers skip the trial phase.
    fn default() -> Self {
        Self::new(ServerPoolConfig { trial_requests: 0, ..Default::default() })
    }
}

impl TestLightNetwork {
    pub fn new(pool: ServerPoolConfig) -> Self {
        let pool = ServerPool::new(pool, Arc::new(MemoryDatabase::new()), dos_metrics::noop())
            .expect("memory database");
        let (responses, receiver) = unbounded_channel();
        Self {
            registry: Arc::new(ServerRegistry::new()),
            pool: Arc::new(pool),
            responses,
            receiver: Mutex::new(Some(receiver)),
        }
    }

    pub fn registry(&self) -> Arc<ServerRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn pool(&self) -> Arc<ServerPool> {
        Arc::clone(&self.pool)
    }

    /// Registers a server with id `PeerId::repeat_byte(seed)`.
    pub fn add_server(
        &self,
        seed: u8,
        chain: &TestChain,
        behaviour: ServerBehaviour,
    ) -> Arc<TestLightServer> {
        let id = PeerId::repeat_byte(seed);
        let server = Arc::new(TestLightServer {
            id,
            chain: chain.clone(),
            codes: Mutex::default(),
            behaviour: Mutex::new(behaviour),
            responses: self.responses.clone(),
            requests: Mutex::default(),
        });
        let handle: ServerHandle = server.clone();
        self.pool.connect(id);
        self.registry
            .register(id, handle, Capabilities::full(), chain.head().hash(), chain.head_td())
            .expect("server ids are unique");
        server
    }

    /// Forwards the answers of all servers to the retriever.
    pub fn spawn_router(&self, retriever: RetrieveManager) -> JoinHandle<()> {
        let mut receiver = self.receiver.lock().take().expect("router spawned once");
        tokio::spawn(async move {
            while let Some((peer_id, response)) = receiver.recv().await {
                retriever.deliver(peer_id, response);
            }
        })
    }
}

/// A retrieval stack over a [`TestLightNetwork`].
#[derive(Debug)]
pub struct TestLes {
    pub network: TestLightNetwork,
    pub distributor: RequestDistributor,
    pub retriever: RetrieveManager,
    pub reporter: Arc<RecordingReporter>,
    pub metrics: Arc<CountingMetrics>,
    pub cancel: CancellationToken,
}

impl TestLes {
    pub fn new(config: RetrieveConfig) -> Self {
        Self::with_network(TestLightNetwork::default(), config)
    }

    /// Spawns the distributor and the response router.
    pub fn with_network(network: TestLightNetwork, config: RetrieveConfig) -> Self {
        let metrics = Arc::new(CountingMetrics::default());
        let reporter = Arc::new(RecordingReporter::default());
        let cancel = CancellationToken::new();
        let distributor = RequestDistributor::new(
            DistributorConfig::default(),
            network.registry(),
            network.pool(),
            metrics.clone(),
        );
        let retriever = RetrieveManager::new(
            config,
            distributor.clone(),
            reporter.clone(),
            metrics.clone(),
            cancel.child_token(),
        );
        tokio::spawn(distributor.clone().run(cancel.child_token()));
        network.spawn_router(retriever.clone());
        Self { network, distributor, retriever, reporter, metrics, cancel }
    }
}

impl Drop for TestLes {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
