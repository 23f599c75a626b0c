use dos_chain_indexer::{BloomIndexer, ChainIndexer, HeadWatcher};
use dos_interfaces::{db::MemoryDatabase, test_utils::TestChain};
use dos_metrics::CountingMetrics;
use dos_primitives::SealedHeader;
use dos_provider::ChainProvider;
use std::{sync::Arc, time::Duration};
use tokio::sync::mpsc::unbounded_channel;
use tokio_util::sync::CancellationToken;

fn headers(chain: &TestChain, from: usize) -> Vec<SealedHeader> {
    chain.blocks()[from..].iter().map(|block| block.header.clone()).collect()
}

#[tokio::test(start_paused = true)]
async fn follows_the_chain_through_a_reorg() {
    dos_tracing::init_test_tracing();
    let chain = TestChain::new(40);
    let provider = ChainProvider::new(Arc::new(MemoryDatabase::new()));
    provider.init_genesis(chain.genesis()).unwrap();
    provider.insert_headers(&headers(&chain, 1)).unwrap();

    let metrics = Arc::new(CountingMetrics::default());
    let backend = BloomIndexer::new(provider.clone(), 8).unwrap();
    let reader = backend.reader();
    let indexer =
        ChainIndexer::new(provider.clone(), Box::new(backend), "bloombits", 8, 4, metrics.clone())
            .unwrap();
    let backend = BloomIndexer::new(provider.clone(), 16).unwrap();
    let child =
        ChainIndexer::new(provider.clone(), Box::new(backend), "bloomtrie", 16, 0, metrics.clone())
            .unwrap();
    indexer.add_child_indexer(child.clone()).unwrap();

    let cancel = CancellationToken::new();
    let (tx, rx) = unbounded_channel();
    let watcher = HeadWatcher::new(provider.clone(), Duration::from_secs(1));
    tokio::spawn(watcher.run(tx, cancel.clone()));
    indexer.start(rx, cancel.clone());

    tokio::time::sleep(Duration::from_secs(2)).await;
    // (40 - 4) / 8
    assert_eq!(indexer.sections().unwrap().count, 4);
    assert_eq!(child.sections().unwrap().count, 2);
    assert!(reader.bloom_bits(0, 3).unwrap().is_some());

    let fork = chain.fork(20, 30, 1);
    provider.insert_headers(&headers(&fork, 21)).unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;
    // (50 - 4) / 8
    let info = indexer.sections().unwrap();
    assert_eq!(info.count, 5);
    assert_eq!(info.processed_head, Some(fork.header(39).unwrap().hash()));
    assert_eq!(child.sections().unwrap().count, 2);
    assert_eq!(child.section_head(1).unwrap(), Some(fork.header(31).unwrap().hash()));
    // sections 2 and 3 of the parent, section 1 of the child
    assert_eq!(metrics.counter("indexer.sections.rolled_back"), 3);

    cancel.cancel();
}
