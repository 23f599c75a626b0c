use assert_matches::assert_matches;
use dos_downloaders::{
    fetcher::{FetcherChain, FetcherConfig, ImportError, StoredChain},
    test_utils::{seeded_provider, Behaviour, TestFetcher},
};
use dos_interfaces::{
    p2p::{
        message::EthMessage,
        peer::{EthPeer, ReputationChangeKind},
    },
    test_utils::{TestChain, TestConsensus, TestExecutor},
};
use dos_primitives::{BlockBody, Header, HeadersRequest, SealedBlock, B256};
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::mpsc::unbounded_channel,
    time::{sleep, Instant},
};

fn header_request(hash: B256) -> EthMessage {
    EthMessage::GetBlockHeaders(HeadersRequest::rising(hash, 1))
}

#[tokio::test(start_paused = true)]
async fn announced_empty_block_is_imported_after_header() {
    let chain = TestChain::new(10);
    let fetcher = TestFetcher::new(FetcherConfig::default(), &chain, 5);
    let a = fetcher.network.add_peer(1, &chain, Behaviour::default());
    let b = fetcher.network.add_peer(2, &chain, Behaviour::default());

    let block = chain.block(6).unwrap();
    assert!(block.header.is_empty_body());
    fetcher.handle.notify(a.id(), block.hash(), 6, Instant::now());
    fetcher.handle.notify(b.id(), block.hash(), 6, Instant::now());
    fetcher.handle.notify(a.id(), block.hash(), 6, Instant::now());
    sleep(Duration::from_millis(600)).await;

    // a single fetch, from the earliest announcer
    assert_eq!(a.requests(), vec![header_request(block.hash())]);
    assert!(b.requests().is_empty());

    let unrelated = chain.header(2).unwrap().header().clone();
    let passed = fetcher
        .handle
        .filter_headers(a.id(), vec![block.header.header().clone(), unrelated.clone()], Instant::now())
        .await;
    assert_eq!(passed, vec![unrelated]);

    sleep(Duration::from_millis(10)).await;
    assert_eq!(fetcher.chain.inserted(), vec![6]);
    assert_eq!(fetcher.chain.broadcasts(), vec![(6, true), (6, false)]);
    assert_eq!(fetcher.metrics.counter("fetcher.filter.headers.in"), 2);
    assert_eq!(fetcher.metrics.counter("fetcher.filter.headers.out"), 1);
}

#[tokio::test(start_paused = true)]
async fn far_future_numbers_are_dropped() {
    let chain = TestChain::new(10);
    let fetcher = TestFetcher::new(FetcherConfig::default(), &chain, 5);
    let peer = fetcher.network.add_peer(1, &chain, Behaviour::default());

    fetcher.handle.notify(peer.id(), B256::repeat_byte(0xaa), u64::MAX, Instant::now());
    let header = Header { number: u64::MAX, ..Default::default() }.seal_slow();
    fetcher.handle.enqueue(peer.id(), SealedBlock { header, body: BlockBody::default() });
    sleep(Duration::from_millis(10)).await;
    assert_eq!(fetcher.metrics.counter("fetcher.prop.announces.drop"), 1);
    assert_eq!(fetcher.metrics.counter("fetcher.prop.broadcasts.drop"), 1);

    // the fetcher keeps serving announcements
    let block = chain.block(6).unwrap();
    fetcher.handle.notify(peer.id(), block.hash(), 6, Instant::now());
    sleep(Duration::from_millis(600)).await;
    assert_eq!(peer.requests(), vec![header_request(block.hash())]);
}

#[tokio::test(start_paused = true)]
async fn body_is_fetched_from_header_provider() {
    let chain = TestChain::new(10);
    let fetcher = TestFetcher::new(FetcherConfig::default(), &chain, 6);
    let peer = fetcher.network.add_peer(1, &chain, Behaviour::default());

    let block = chain.block(7).unwrap();
    assert!(!block.header.is_empty_body());
    fetcher.handle.notify(peer.id(), block.hash(), 7, Instant::now());
    sleep(Duration::from_millis(600)).await;

    let passed = fetcher
        .handle
        .filter_headers(peer.id(), vec![block.header.header().clone()], Instant::now())
        .await;
    assert!(passed.is_empty());
    sleep(Duration::from_millis(300)).await;
    assert_eq!(peer.requests().last(), Some(&EthMessage::GetBlockBodies(vec![block.hash()])));
    assert!(fetcher.chain.inserted().is_empty());

    let other = chain.block(8).unwrap().body.clone();
    let passed = fetcher
        .handle
        .filter_bodies(peer.id(), vec![other.clone(), block.body.clone()], Instant::now())
        .await;
    assert_eq!(passed, vec![other]);

    sleep(Duration::from_millis(10)).await;
    assert_eq!(fetcher.chain.inserted(), vec![7]);
    assert_eq!(fetcher.metrics.counter("fetcher.fetch.bodies"), 1);
}

#[tokio::test(start_paused = true)]
async fn silent_announcer_falls_back_to_next() {
    let chain = TestChain::new(10);
    let fetcher = TestFetcher::new(FetcherConfig::default(), &chain, 5);
    let silent = fetcher.network.add_peer(1, &chain, Behaviour { silent: true, ..Default::default() });
    let honest = fetcher.network.add_peer(2, &chain, Behaviour::default());

    let block = chain.block(6).unwrap();
    fetcher.handle.notify(silent.id(), block.hash(), 6, Instant::now());
    fetcher.handle.notify(honest.id(), block.hash(), 6, Instant::now());
    sleep(Duration::from_millis(600)).await;
    assert_eq!(silent.requests().len(), 1);
    assert!(honest.requests().is_empty());

    sleep(FetcherConfig::default().fetch_timeout).await;
    assert_eq!(fetcher.reporter.reports_for(silent.id()), vec![ReputationChangeKind::Timeout]);
    assert_eq!(honest.requests(), vec![header_request(block.hash())]);

    // the late answer of the first announcer is no longer claimed
    let header = block.header.header().clone();
    let passed =
        fetcher.handle.filter_headers(silent.id(), vec![header.clone()], Instant::now()).await;
    assert_eq!(passed, vec![header.clone()]);

    let passed = fetcher.handle.filter_headers(honest.id(), vec![header], Instant::now()).await;
    assert!(passed.is_empty());
    sleep(Duration::from_millis(10)).await;
    assert_eq!(fetcher.chain.inserted(), vec![6]);
}

#[tokio::test(start_paused = true)]
async fn departed_announcer_is_replaced() {
    let chain = TestChain::new(10);
    let fetcher = TestFetcher::new(FetcherConfig::default(), &chain, 5);
    let leaving = fetcher.network.add_peer(1, &chain, Behaviour::default());
    let staying = fetcher.network.add_peer(2, &chain, Behaviour::default());

    let block = chain.block(6).unwrap();
    fetcher.handle.notify(leaving.id(), block.hash(), 6, Instant::now());
    fetcher.handle.notify(staying.id(), block.hash(), 6, Instant::now());
    sleep(Duration::from_millis(600)).await;
    assert_eq!(leaving.requests().len(), 1);

    fetcher.network.registry().unregister(&leaving.id()).unwrap();
    sleep(Duration::from_millis(200)).await;
    assert_eq!(staying.requests(), vec![header_request(block.hash())]);
    assert!(fetcher.reporter.reports().is_empty());
}

#[tokio::test(start_paused = true)]
async fn announce_flood_is_capped() {
    let chain = TestChain::new(10);
    let config = FetcherConfig { hash_limit: 4, ..Default::default() };
    let fetcher = TestFetcher::new(config, &chain, 5);
    let peer = fetcher.network.add_peer(1, &chain, Behaviour::default());

    // out of range announcements are dropped
    fetcher.handle.notify(peer.id(), B256::repeat_byte(0xaa), 100, Instant::now());
    for byte in 1..=6u8 {
        fetcher.handle.notify(peer.id(), B256::repeat_byte(byte), 6, Instant::now());
    }
    sleep(Duration::from_millis(600)).await;

    assert_eq!(fetcher.metrics.counter("fetcher.prop.announces.in"), 7);
    assert_eq!(fetcher.metrics.counter("fetcher.prop.announces.dos"), 2);
    assert_eq!(fetcher.metrics.counter("fetcher.prop.announces.drop"), 1);
    assert_eq!(peer.requests().len(), 4);
}

#[tokio::test(start_paused = true)]
async fn propagated_blocks_are_imported_in_order() {
    let chain = TestChain::new(60);
    let fetcher = TestFetcher::new(FetcherConfig::default(), &chain, 5);
    let peer = fetcher.network.add_peer(1, &chain, Behaviour::default());

    fetcher.handle.enqueue(peer.id(), chain.block(50).unwrap().clone());
    fetcher.handle.enqueue(peer.id(), chain.block(7).unwrap().clone());
    sleep(Duration::from_millis(10)).await;
    assert_eq!(fetcher.metrics.counter("fetcher.prop.broadcasts.drop"), 1);
    // block 7 waits for its parent
    assert!(fetcher.chain.inserted().is_empty());

    fetcher.handle.enqueue(peer.id(), chain.block(6).unwrap().clone());
    sleep(Duration::from_millis(10)).await;
    assert_eq!(fetcher.chain.inserted(), vec![6, 7]);
    assert_eq!(fetcher.metrics.counter("fetcher.prop.broadcasts.in"), 3);
    assert_eq!(fetcher.metrics.counter("fetcher.prop.broadcasts.out"), 2);
    assert!(peer.requests().is_empty());
}

#[tokio::test(start_paused = true)]
async fn invalid_propagated_block_is_reported() {
    let chain = TestChain::new(10);
    let fetcher = TestFetcher::new(FetcherConfig::default(), &chain, 5);
    let peer = fetcher.network.add_peer(1, &chain, Behaviour::default());

    let block = chain.block(6).unwrap().clone();
    fetcher.chain.reject(block.hash());
    fetcher.handle.enqueue(peer.id(), block);
    sleep(Duration::from_millis(10)).await;

    assert!(fetcher.chain.inserted().is_empty());
    assert!(fetcher.chain.broadcasts().is_empty());
    assert_eq!(fetcher.reporter.reports_for(peer.id()), vec![ReputationChangeKind::BadBlock]);
}

#[test]
fn stored_chain_moves_head_only_for_heavier_blocks() {
    let chain = TestChain::new(10);
    let provider = seeded_provider(&chain, 5);
    let (relay_tx, mut relay_rx) = unbounded_channel();
    let stored = StoredChain::new(
        provider.clone(),
        Arc::new(TestConsensus::default()),
        Arc::new(TestExecutor::default()),
    )
    .with_relay(relay_tx);

    let block = chain.block(6).unwrap().clone();
    stored.verify_header(&block.header).unwrap();
    stored.insert_block(&block).unwrap();
    assert!(stored.has_block(block.hash()));
    assert_eq!(stored.chain_height(), 6);

    // a sibling of equal weight is kept on the side
    let side = chain.fork(5, 1, 1).block(6).unwrap().clone();
    stored.insert_block(&side).unwrap();
    assert!(stored.has_block(side.hash()));
    assert_eq!(provider.head_block().unwrap().hash(), block.hash());

    let orphan = chain.block(8).unwrap().clone();
    assert_matches!(
        stored.insert_block(&orphan),
        Err(ImportError::UnknownParent(parent)) if parent == orphan.parent_hash
    );

    stored.broadcast_block(&block, true);
    let (relayed, propagate) = relay_rx.try_recv().unwrap();
    assert_eq!(relayed.hash(), block.hash());
    assert!(propagate);
}
