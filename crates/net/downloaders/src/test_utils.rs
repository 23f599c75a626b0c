//! Simulated peers and a wired downloader for tests.

#![allow(missing_docs, unreachable_pub)]

use crate::{
    downloader::{Downloader, DownloaderConfig, SyncOutcome, SyncPeer, SyncRegistry},
    fetcher::{Fetcher, FetcherChain, FetcherConfig, FetcherHandle, ImportError},
};
use dos_interfaces::{
    consensus::ConsensusError,
    db::MemoryDatabase,
    p2p::{
        error::{DownloadResult, RequestError, RequestResult},
        message::EthMessage,
        peer::EthPeer,
    },
    test_utils::{RecordingReporter, TestChain, TestConsensus, TestExecutor},
};
use dos_metrics::CountingMetrics;
use dos_peers::Capabilities;
use dos_primitives::{
    BlockNumber, Header, HeadersRequest, PeerId, SealedBlock, SealedHeader, SyncMode, B256,
};
use dos_provider::{BlockHead, ChainProvider};
use parking_lot::Mutex;
use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
    time::Duration,
};
use tokio::{
    sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

/// A response of a simulated peer.
pub type Response = (PeerId, EthMessage);

/// How a [`TestEthPeer`] deviates from an honest peer.
#[derive(Debug, Clone, Default)]
pub struct Behaviour {
    /// Never answer any request.
    pub silent: bool,
    /// Never answer bodies requests.
    pub withhold_bodies: bool,
    /// Serve the header with this number with a broken parent hash.
    pub tamper_at: Option<BlockNumber>,
    /// Disconnect on the first bodies request that includes a block above this number.
    pub disconnect_above: Option<BlockNumber>,
    /// Delay of node data answers.
    pub node_data_delay: Option<Duration>,
}

/// A peer serving a [`TestChain`] up to its visible height.
#[derive(Debug)]
pub struct TestEthPeer {
    id: PeerId,
    chain: TestChain,
    behaviour: Mutex<Behaviour>,
    height: AtomicU64,
    responses: UnboundedSender<Response>,
    registry: Weak<SyncRegistry>,
    requests: Mutex<Vec<EthMessage>>,
    served_bodies: Mutex<Vec<B256>>,
}

impl TestEthPeer {
    /// Makes blocks up to `height` visible to requests.
    pub fn set_height(&self, height: BlockNumber) {
        self.height.store(height, Ordering::SeqCst);
    }

    /// All requests received so far.
    pub fn requests(&self) -> Vec<EthMessage> {
        self.requests.lock().clone()
    }

    /// Hashes of all bodies answered so far.
    pub fn served_bodies(&self) -> Vec<B256> {
        self.served_bodies.lock().clone()
    }

    pub fn chain(&self) -> &TestChain {
        &self.chain
    }

    fn visible(&self, hash: &B256) -> bool {
        let height = self.height.load(Ordering::SeqCst);
        self.chain.number_of(hash).map_or(false, |number| number <= height)
    }

    /// Logs the request and returns the current behaviour.
    fn receive(&self, request: EthMessage) -> Behaviour {
        self.requests.lock().push(request);
        self.behaviour.lock().clone()
    }

    fn respond(&self, message: EthMessage, delay: Option<Duration>) -> RequestResult<()> {
        match delay {
            None => Ok(self.responses.send((self.id, message))?),
            Some(delay) => {
                let (responses, id) = (self.responses.clone(), self.id);
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = responses.send((id, message));
                });
                Ok(())
            }
        }
    }
}

impl EthPeer for TestEthPeer {
    fn id(&self) -> PeerId {
        self.id
    }

    fn request_headers(&self, request: HeadersRequest) -> RequestResult<()> {
        let behaviour = self.receive(EthMessage::GetBlockHeaders(request.clone()));
        if behaviour.silent {
            return Ok(())
        }
        let height = self.height.load(Ordering::SeqCst);
        let mut headers: Vec<Header> = self
            .chain
            .answer_headers(&request)
            .into_iter()
            .take_while(|header| header.number <= height)
            .collect();
        if let Some(number) = behaviour.tamper_at {
            for header in headers.iter_mut().filter(|header| header.number == number) {
                header.parent_hash = B256::repeat_byte(0xee);
            }
        }
        self.respond(EthMessage::BlockHeaders(headers), None)
    }

    fn request_bodies(&self, hashes: Vec<B256>) -> RequestResult<()> {
        let behaviour = self.receive(EthMessage::GetBlockBodies(hashes.clone()));
        if behaviour.silent || behaviour.withhold_bodies {
            return Ok(())
        }
        if let Some(limit) = behaviour.disconnect_above {
            let above = hashes
                .iter()
                .any(|hash| self.chain.number_of(hash).map_or(false, |number| number > limit));
            if above {
                if let Some(registry) = self.registry.upgrade() {
                    let _ = registry.unregister(&self.id);
                }
                return Err(RequestError::ConnectionDropped)
            }
        }
        let hashes: Vec<B256> = hashes.into_iter().take_while(|hash| self.visible(hash)).collect();
        self.served_bodies.lock().extend(hashes.iter().copied());
        self.respond(EthMessage::BlockBodies(self.chain.answer_bodies(&hashes)), None)
    }

    fn request_receipts(&self, hashes: Vec<B256>) -> RequestResult<()> {
        let behaviour = self.receive(EthMessage::GetReceipts(hashes.clone()));
        if behaviour.silent {
            return Ok(())
        }
        let hashes: Vec<B256> = hashes.into_iter().take_while(|hash| self.visible(hash)).collect();
        self.respond(EthMessage::Receipts(self.chain.answer_receipts(&hashes)), None)
    }

    fn request_node_data(&self, hashes: Vec<B256>) -> RequestResult<()> {
        let behaviour = self.receive(EthMessage::GetNodeData(hashes.clone()));
        if behaviour.silent {
            return Ok(())
        }
        let nodes = self.chain.answer_node_data(&hashes);
        self.respond(EthMessage::NodeData(nodes), behaviour.node_data_delay)
    }
}

/// A set of simulated peers registered in one registry.
#[derive(Debug)]
pub struct TestNetwork {
    registry: Arc<SyncRegistry>,
    responses: UnboundedSender<Response>,
    receiver: Mutex<Option<UnboundedReceiver<Response>>>,
}

impl Default for TestNetwork {
    fn default() -> Self {
        let (responses, receiver) = unbounded_channel();
        Self {
            registry: Arc::new(SyncRegistry::new()),
            responses,
            receiver: Mutex::new(Some(receiver)),
        }
    }
}

impl TestNetwork {
    pub fn registry(&self) -> Arc<SyncRegistry> {
        Arc::clone(&self.registry)
    }

    /// Registers a peer with id `PeerId::repeat_byte(seed)` serving the whole chain.
    pub fn add_peer(&self, seed: u8, chain: &TestChain, behaviour: Behaviour) -> Arc<TestEthPeer> {
        let id = PeerId::repeat_byte(seed);
        let peer = Arc::new(TestEthPeer {
            id,
            chain: chain.clone(),
            behaviour: Mutex::new(behaviour),
            height: AtomicU64::new(chain.head_number()),
            responses: self.responses.clone(),
            registry: Arc::downgrade(&self.registry),
            requests: Mutex::default(),
            served_bodies: Mutex::default(),
        });
        let handle: SyncPeer = peer.clone();
        self.registry
            .register(id, handle, Capabilities::full(), chain.head().hash(), chain.head_td())
            .expect("peer ids are unique");
        peer
    }

    /// Forwards responses of all peers to the downloader.
    pub fn spawn_router(&self, downloader: Arc<Downloader>) -> JoinHandle<()> {
        let mut receiver = self.receiver.lock().take().expect("router spawned once");
        tokio::spawn(async move {
            while let Some((peer_id, message)) = receiver.recv().await {
                match message {
                    EthMessage::BlockHeaders(headers) => {
                        downloader.deliver_headers(peer_id, headers);
                    }
                    EthMessage::BlockBodies(bodies) => {
                        downloader.deliver_bodies(peer_id, bodies);
                    }
                    EthMessage::Receipts(receipts) => {
                        downloader.deliver_receipts(peer_id, receipts);
                    }
                    EthMessage::NodeData(nodes) => {
                        downloader.deliver_node_data(peer_id, nodes);
                    }
                    _ => {}
                }
            }
        })
    }
}

/// A provider holding blocks `0..=upto` of the chain.
pub fn seeded_provider(chain: &TestChain, upto: BlockNumber) -> ChainProvider {
    let provider = ChainProvider::new(Arc::new(MemoryDatabase::new()));
    provider.init_genesis(chain.genesis()).expect("empty database");
    let upto = upto as usize;
    if upto > 0 {
        let blocks = chain.blocks()[1..=upto].to_vec();
        let receipts: Vec<_> = (1..=upto)
            .map(|number| chain.receipts(number as u64).cloned().unwrap_or_default())
            .collect();
        provider.insert_blocks(&blocks, Some(&receipts), BlockHead::Full).expect("valid blocks");
    }
    provider
}

/// A downloader wired to a [`TestNetwork`] with recording collaborators.
#[derive(Debug)]
pub struct TestSync {
    pub network: TestNetwork,
    pub downloader: Arc<Downloader>,
    pub provider: ChainProvider,
    pub consensus: Arc<TestConsensus>,
    pub executor: Arc<TestExecutor>,
    pub reporter: Arc<RecordingReporter>,
    pub metrics: Arc<CountingMetrics>,
    pub cancel: CancellationToken,
}

impl TestSync {
    /// Wires a downloader whose local chain holds blocks `0..=local` of `chain`.
    ///
    /// Must be called within a tokio runtime, the response router is spawned right away.
    pub fn new(config: DownloaderConfig, chain: &TestChain, local: BlockNumber) -> Self {
        let network = TestNetwork::default();
        let provider = seeded_provider(chain, local);
        let consensus = Arc::new(TestConsensus::default());
        let executor = Arc::new(TestExecutor::default());
        let reporter = Arc::new(RecordingReporter::default());
        let metrics = Arc::new(CountingMetrics::default());
        let cancel = CancellationToken::new();
        let downloader = Arc::new(Downloader::new(
            config,
            provider.clone(),
            network.registry(),
            consensus.clone(),
            executor.clone(),
            reporter.clone(),
            metrics.clone(),
            cancel.clone(),
        ));
        network.spawn_router(Arc::clone(&downloader));
        Self { network, downloader, provider, consensus, executor, reporter, metrics, cancel }
    }

    /// Synchronises with the peer, which advertises the head of `chain`.
    pub async fn synchronise(
        &self,
        peer: &TestEthPeer,
        mode: SyncMode,
    ) -> DownloadResult<SyncOutcome> {
        let head = peer.chain().head();
        self.downloader.synchronise(peer.id, head.hash(), peer.chain().head_td(), mode).await
    }
}

/// A config with short timeouts for tests.
pub fn test_config() -> DownloaderConfig {
    DownloaderConfig {
        request_ttl: Duration::from_millis(500),
        request_timeout: Duration::from_secs(2),
        ..Default::default()
    }
}

/// A [`FetcherChain`] over the blocks of a [`TestChain`] that records imports and relays.
#[derive(Debug, Default)]
pub struct TestFetcherChain {
    known: Mutex<HashMap<B256, BlockNumber>>,
    rejected: Mutex<HashSet<B256>>,
    inserted: Mutex<Vec<BlockNumber>>,
    broadcasts: Mutex<Vec<(BlockNumber, bool)>>,
}

impl TestFetcherChain {
    /// A chain holding blocks `0..=upto`.
    pub fn new(chain: &TestChain, upto: BlockNumber) -> Self {
        let known = (0..=upto)
            .filter_map(|number| chain.header(number))
            .map(|header| (header.hash(), header.number))
            .collect();
        Self { known: Mutex::new(known), ..Default::default() }
    }

    /// Makes the header of the block fail verification.
    pub fn reject(&self, hash: B256) {
        self.rejected.lock().insert(hash);
    }

    /// Numbers of the imported blocks, in import order.
    pub fn inserted(&self) -> Vec<BlockNumber> {
        self.inserted.lock().clone()
    }

    /// Relayed blocks and whether they were propagated in full.
    pub fn broadcasts(&self) -> Vec<(BlockNumber, bool)> {
        self.broadcasts.lock().clone()
    }
}

impl FetcherChain for TestFetcherChain {
    fn has_block(&self, hash: B256) -> bool {
        self.known.lock().contains_key(&hash)
    }

    fn chain_height(&self) -> BlockNumber {
        self.known.lock().values().copied().max().unwrap_or_default()
    }

    fn verify_header(&self, header: &SealedHeader) -> Result<(), ImportError> {
        if !self.has_block(header.parent_hash) {
            return Err(ImportError::UnknownParent(header.parent_hash))
        }
        if self.rejected.lock().contains(&header.hash()) {
            return Err(ConsensusError::ZeroDifficulty { number: header.number }.into())
        }
        Ok(())
    }

    fn insert_block(&self, block: &SealedBlock) -> Result<(), ImportError> {
        self.known.lock().insert(block.hash(), block.number());
        self.inserted.lock().push(block.number());
        Ok(())
    }

    fn broadcast_block(&self, block: &SealedBlock, propagate: bool) {
        self.broadcasts.lock().push((block.number(), propagate));
    }
}

/// A running fetcher whose local chain holds blocks `0..=local` of a [`TestChain`].
#[derive(Debug)]
pub struct TestFetcher {
    pub network: TestNetwork,
    pub chain: Arc<TestFetcherChain>,
    pub handle: FetcherHandle,
    pub reporter: Arc<RecordingReporter>,
    pub metrics: Arc<CountingMetrics>,
    pub cancel: CancellationToken,
}

impl TestFetcher {
    /// Must be called within a tokio runtime, the fetcher task is spawned right away.
    pub fn new(config: FetcherConfig, chain: &TestChain, local: BlockNumber) -> Self {
        let network = TestNetwork::default();
        let fetcher_chain = Arc::new(TestFetcherChain::new(chain, local));
        let reporter = Arc::new(RecordingReporter::default());
        let metrics = Arc::new(CountingMetrics::default());
        let cancel = CancellationToken::new();
        let (fetcher, handle) = Fetcher::new(
            config,
            fetcher_chain.clone(),
            network.registry(),
            reporter.clone(),
            metrics.clone(),
        );
        tokio::spawn(fetcher.run(cancel.clone()));
        Self { network, chain: fetcher_chain, handle, reporter, metrics, cancel }
    }
}
