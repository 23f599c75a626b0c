//! Assembly of the node components.
use dos_chain_indexer::{BloomBitsReader, BloomIndexer, ChainIndexer, HeadWatcher};
use dos_config::Config;
use dos_downloaders::{
    downloader::{Downloader, SyncRegistry},
    fetcher::{Fetcher, StoredChain},
    handler::{ChainSyncer, SyncHandler},
};
use dos_interfaces::{
    consensus::{Consensus, EngineConsensus},
    db::KeyValueStore,
    executor::{BlockExecutor, ExecutionError},
    p2p::peer::PeerReporter,
};
use dos_les::{LightOdr, RequestDistributor, RetrieveManager, ServerPool, ServerRegistry};
use dos_metrics::SharedMetrics;
use dos_primitives::{
    proofs::{EMPTY_LIST_HASH, EMPTY_ROOT},
    EngineKind, Header, Receipt, SealedBlock, SealedHeader, U256,
};
use dos_provider::ChainProvider;
use dos_tasks::TaskExecutor;
use std::{sync::Arc, time::Duration};
use tokio::sync::mpsc::unbounded_channel;
use tracing::{debug, info};

/// How often the head watcher looks at the canonical head.
const HEAD_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// The genesis of a fresh development chain.
pub fn dev_genesis() -> SealedHeader {
    Header {
        ommers_hash: EMPTY_LIST_HASH,
        state_root: EMPTY_ROOT,
        transactions_root: EMPTY_ROOT,
        receipts_root: EMPTY_ROOT,
        difficulty: U256::from(131_072),
        gas_limit: 8_000_000,
        ..Default::default()
    }
    .seal_slow()
}

/// Refuses every block, execution is supplied by the embedding application.
#[derive(Debug, Default, Clone, Copy)]
#[non_exhaustive]
pub struct NoExecution;

impl BlockExecutor for NoExecution {
    fn execute(&self, block: &SealedBlock) -> Result<Vec<Receipt>, ExecutionError> {
        Err(ExecutionError::Failed {
            number: block.number(),
            reason: "no block executor configured".to_string(),
        })
    }
}

/// External collaborators of the node.
#[derive(Debug, Clone)]
pub struct NodeComponents {
    /// The chain database.
    pub db: Arc<dyn KeyValueStore>,
    /// Genesis written into an empty database.
    pub genesis: SealedHeader,
    /// Consensus engine the headers are verified with.
    pub engine: EngineKind,
    /// Executes blocks during full synchronisation and block import.
    pub executor: Arc<dyn BlockExecutor>,
    /// Receives peer misbehaviour.
    pub reporter: Arc<dyn PeerReporter>,
    /// Destination of all measurements.
    pub metrics: SharedMetrics,
}

/// The running node.
///
/// Transports register eth peers through [`Node::sync_handler`] and light servers through
/// [`Node::server_registry`], answers to light requests go to [`LightOdr`]'s retriever.
#[derive(Debug)]
pub struct Node {
    provider: ChainProvider,
    downloader: Arc<Downloader>,
    sync_handler: SyncHandler,
    server_registry: Arc<ServerRegistry>,
    server_pool: Arc<ServerPool>,
    retriever: RetrieveManager,
    les: LightOdr,
    bloom_indexer: ChainIndexer,
    bloom_bits: BloomBitsReader,
}

impl Node {
    /// Creates every component and spawns its tasks on the executor.
    pub fn launch(
        config: &Config,
        components: NodeComponents,
        tasks: &TaskExecutor,
    ) -> eyre::Result<Self> {
        config.validate()?;
        let NodeComponents { db, genesis, engine, executor, reporter, metrics } = components;

        let provider = ChainProvider::new(Arc::clone(&db));
        provider.init_genesis(&genesis)?;
        let head = provider.head_header()?;
        info!(target: "dos::node", number = head.number, hash = %head.hash(), "Loaded chain head");

        // chain synchronisation
        let consensus: Arc<dyn Consensus> = Arc::new(EngineConsensus::new(engine));
        let downloader = Arc::new(Downloader::new(
            (&config.sync).into(),
            provider.clone(),
            Arc::new(SyncRegistry::new()),
            Arc::clone(&consensus),
            Arc::clone(&executor),
            Arc::clone(&reporter),
            Arc::clone(&metrics),
            tasks.cancellation_token(),
        ));
        let chain = StoredChain::new(provider.clone(), consensus, executor);
        let (fetcher, fetcher_handle) = Fetcher::new(
            (&config.fetcher).into(),
            Arc::new(chain),
            Arc::clone(downloader.registry()),
            Arc::clone(&reporter),
            Arc::clone(&metrics),
        );
        tasks.spawn_critical("block fetcher", fetcher.run(tasks.cancellation_token()));
        let sync_handler = SyncHandler::new(Arc::clone(&downloader), fetcher_handle);
        let syncer = ChainSyncer::new(
            (&config.sync).into(),
            Arc::clone(&downloader),
            Arc::clone(&reporter),
            sync_handler.wake(),
        );
        debug!(target: "dos::node", mode = %syncer.mode(), "Starting chain syncer");
        tasks.spawn_critical("chain syncer", syncer.run(tasks.cancellation_token()));

        // on-demand retrieval
        let server_registry = Arc::new(ServerRegistry::new());
        let server_pool = Arc::new(ServerPool::new(
            config.les.server_pool_config(),
            Arc::clone(&db),
            Arc::clone(&metrics),
        )?);
        let distributor = RequestDistributor::new(
            config.les.distributor_config(),
            Arc::clone(&server_registry),
            Arc::clone(&server_pool),
            Arc::clone(&metrics),
        );
        distributor.spawn(tasks);
        let retriever = RetrieveManager::new(
            config.les.retrieve_config(),
            distributor,
            Arc::clone(&reporter),
            Arc::clone(&metrics),
            tasks.cancellation_token(),
        );
        let les = LightOdr::new(provider.clone(), retriever.clone());

        // chain indexers
        let section_size = config.indexer.bloom_section_size;
        let backend = BloomIndexer::new(provider.clone(), section_size)?;
        let bloom_bits = backend.reader();
        let bloom_indexer = ChainIndexer::new(
            provider.clone(),
            Box::new(backend),
            "bloombits",
            section_size,
            config.indexer.bloom_confirms,
            metrics,
        )?;
        let (events_tx, events_rx) = unbounded_channel();
        let watcher = HeadWatcher::new(provider.clone(), HEAD_POLL_INTERVAL);
        tasks.spawn_with_signal(|cancel| watcher.run(events_tx, cancel));
        bloom_indexer.start(events_rx, tasks.cancellation_token());

        info!(target: "dos::node", network_id = config.les.network_id, "Node started");
        Ok(Self {
            provider,
            downloader,
            sync_handler,
            server_registry,
            server_pool,
            retriever,
            les,
            bloom_indexer,
            bloom_bits,
        })
    }

    /// The local chain.
    pub fn provider(&self) -> &ChainProvider {
        &self.provider
    }

    /// The chain downloader.
    pub fn downloader(&self) -> &Arc<Downloader> {
        &self.downloader
    }

    /// Entry point for eth peer connections.
    pub fn sync_handler(&self) -> &SyncHandler {
        &self.sync_handler
    }

    /// Registry light servers are registered in.
    pub fn server_registry(&self) -> &Arc<ServerRegistry> {
        &self.server_registry
    }

    /// Receives the answers of light servers.
    pub fn retriever(&self) -> &RetrieveManager {
        &self.retriever
    }

    /// On-demand access to chain data.
    pub fn les(&self) -> &LightOdr {
        &self.les
    }

    /// The indexer of the log bloom bits.
    pub fn bloom_indexer(&self) -> &ChainIndexer {
        &self.bloom_indexer
    }

    /// Reader of the indexed log bloom bits.
    pub fn bloom_bits(&self) -> &BloomBitsReader {
        &self.bloom_bits
    }

    /// Persists state that outlives the process.
    pub fn shutdown(&self) -> eyre::Result<()> {
        self.server_pool.persist()?;
        let sections = self.bloom_indexer.sections()?;
        info!(target: "dos::node", bloom_sections = sections.count, "Node stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dos_interfaces::{db::MemoryDatabase, p2p::peer::NoopReporter};
    use dos_tasks::TaskManager;

    fn components(db: Arc<dyn KeyValueStore>) -> NodeComponents {
        NodeComponents {
            db,
            genesis: dev_genesis(),
            engine: EngineKind::ProofOfWork,
            executor: Arc::new(NoExecution),
            reporter: Arc::new(NoopReporter::default()),
            metrics: dos_metrics::noop(),
        }
    }

    #[tokio::test]
    async fn launches_on_empty_database() {
        let manager = TaskManager::current();
        let db: Arc<dyn KeyValueStore> = Arc::new(MemoryDatabase::new());
        let node = Node::launch(&Config::default(), components(Arc::clone(&db)), &manager.executor())
            .unwrap();
        assert_eq!(node.provider().head_header().unwrap().hash(), dev_genesis().hash());
        assert!(node.server_registry().is_empty());
        assert_eq!(node.bloom_indexer().sections().unwrap().count, 0);
        node.shutdown().unwrap();
        manager.graceful_shutdown();

        // a second launch on the same database keeps the chain
        let manager = TaskManager::current();
        let node = Node::launch(&Config::default(), components(db), &manager.executor()).unwrap();
        assert_eq!(node.provider().genesis_hash().unwrap(), dev_genesis().hash());
        manager.graceful_shutdown();
    }

    #[tokio::test]
    async fn rejects_invalid_config() {
        let manager = TaskManager::current();
        let mut config = Config::default();
        config.indexer.bloom_section_size = 12;
        let db: Arc<dyn KeyValueStore> = Arc::new(MemoryDatabase::new());
        assert!(Node::launch(&config, components(db), &manager.executor()).is_err());
        manager.graceful_shutdown();
    }
}
