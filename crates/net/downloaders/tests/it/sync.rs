use assert_matches::assert_matches;
use dos_downloaders::{
    downloader::{DownloaderConfig, SyncOutcome},
    test_utils::{test_config, Behaviour, TestSync},
};
use dos_interfaces::{
    p2p::{
        error::DownloadError,
        message::EthMessage,
        peer::{EthPeer, ReputationChangeKind},
    },
    test_utils::TestChain,
};
use dos_primitives::{PeerId, SyncMode, B256, U256};
use std::{collections::HashSet, sync::Arc, time::Duration};

fn non_empty_bodies(chain: &TestChain, range: std::ops::RangeInclusive<u64>) -> HashSet<B256> {
    range
        .filter_map(|number| chain.block(number))
        .filter(|block| !block.header.is_empty_body())
        .map(|block| block.hash())
        .collect()
}

#[tokio::test(start_paused = true)]
async fn disconnecting_peer_work_moves_to_remaining_peer() {
    dos_tracing::init_test_tracing();
    let chain = TestChain::new(100);
    let config = DownloaderConfig { max_block_fetch: 4, ..test_config() };
    let sync = TestSync::new(config, &chain, 40);
    let a = sync
        .network
        .add_peer(1, &chain, Behaviour { disconnect_above: Some(70), ..Default::default() });
    let b = sync.network.add_peer(2, &chain, Behaviour::default());

    let outcome = sync.synchronise(&a, SyncMode::Full).await.unwrap();
    assert_eq!(outcome, SyncOutcome::Synced { origin: 40, head: chain.head().num_hash() });

    // committed strictly in order, without gaps
    assert_eq!(sync.executor.executed(), (41..=100).collect::<Vec<_>>());
    assert_eq!(sync.provider.head_block().unwrap().hash(), chain.head().hash());

    let from_a = a.served_bodies();
    let from_b = b.served_bodies();
    assert!(!from_a.is_empty());
    assert!(from_a.iter().all(|hash| chain.number_of(hash).unwrap() <= 70));

    // every body was served exactly once
    let served: HashSet<B256> = from_a.iter().chain(from_b.iter()).copied().collect();
    assert_eq!(served.len(), from_a.len() + from_b.len());
    assert_eq!(served, non_empty_bodies(&chain, 41..=100));

    assert!(!sync.network.registry().contains(&a.id()));
    assert_eq!(sync.reporter.reports_for(a.id()), vec![ReputationChangeKind::Dropped]);
}

#[tokio::test(start_paused = true)]
async fn broken_header_chain_aborts_run() {
    dos_tracing::init_test_tracing();
    let chain = TestChain::new(20);
    let sync = TestSync::new(test_config(), &chain, 0);
    let malicious =
        sync.network.add_peer(7, &chain, Behaviour { tamper_at: Some(5), ..Default::default() });

    let err = sync.synchronise(&malicious, SyncMode::Fast).await.unwrap_err();
    assert_matches!(
        err,
        DownloadError::MismatchedHeaders { header_number: 5, parent_number: 4, .. }
    );
    assert!(err.is_protocol_fault());
    assert_eq!(err.peer(), Some(PeerId::repeat_byte(7)));

    // nothing beyond the offending answer was requested
    let requests = malicious.requests();
    assert_matches!(requests.last(), Some(EthMessage::GetBlockHeaders(_)));
    assert!(requests.iter().all(|request| matches!(request, EthMessage::GetBlockHeaders(_))));
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(malicious.requests().len(), requests.len());
    assert_eq!(sync.provider.head_header().unwrap().number, 0);
}

#[tokio::test(start_paused = true)]
async fn fast_sync_downloads_pivot_state() {
    let chain = TestChain::new(30);
    let config = DownloaderConfig { pivot_distance: 10, ..test_config() };
    let sync = TestSync::new(config, &chain, 0);
    let peer = sync.network.add_peer(1, &chain, Behaviour::default());

    let outcome = sync.synchronise(&peer, SyncMode::Fast).await.unwrap();
    assert_eq!(outcome, SyncOutcome::Synced { origin: 0, head: chain.head().num_hash() });

    let pivot = chain.header(20).unwrap();
    assert!(sync.provider.has_state_node(pivot.state_root).unwrap());
    // only blocks above the pivot are executed
    assert_eq!(sync.executor.executed(), (21..=30).collect::<Vec<_>>());
    for number in 1..=20 {
        let block = chain.block(number).unwrap();
        assert_eq!(
            sync.provider.receipts(number, block.hash()).unwrap().as_ref(),
            chain.receipts(number)
        );
    }
    assert_eq!(sync.provider.head_block().unwrap().number, 30);

    let progress = sync.downloader.progress();
    assert_eq!(progress.current, 30);
    assert!(progress.pulled_states > 0);
    assert_eq!(progress.pulled_states, progress.known_states);
}

#[tokio::test(start_paused = true)]
async fn light_sync_restarts_state_when_pivot_moves() {
    let chain = TestChain::new(30);
    let config = DownloaderConfig {
        pivot_distance: 2,
        request_ttl: Duration::from_secs(1),
        ..test_config()
    };
    let sync = TestSync::new(config, &chain, 0);
    let peer = sync.network.add_peer(
        1,
        &chain,
        Behaviour { node_data_delay: Some(Duration::from_millis(1500)), ..Default::default() },
    );
    peer.set_height(20);

    let downloader = Arc::clone(&sync.downloader);
    let head = chain.header(20).unwrap().hash();
    let td = chain.td(20).unwrap();
    let run = tokio::spawn(async move {
        downloader.synchronise(PeerId::repeat_byte(1), head, td, SyncMode::Light).await
    });
    tokio::time::sleep(Duration::from_millis(500)).await;
    peer.set_height(30);

    let outcome = run.await.unwrap().unwrap();
    let head = chain.header(30).unwrap().num_hash();
    assert_eq!(outcome, SyncOutcome::Synced { origin: 0, head });
    assert_eq!(sync.provider.head_header().unwrap().number, 30);

    // the state below the new pivot is complete, the abandoned one is not
    let new_pivot = chain.header(28).unwrap();
    let old_pivot = chain.header(18).unwrap();
    assert!(sync.provider.has_state_node(new_pivot.state_root).unwrap());
    assert!(!sync.provider.has_state_node(old_pivot.state_root).unwrap());
    // light sync never touches bodies
    assert!(peer
        .requests()
        .iter()
        .all(|request| !matches!(request, EthMessage::GetBlockBodies(_))));
}

#[tokio::test(start_paused = true)]
async fn rejects_heavier_head_below_fork_limit() {
    let local = TestChain::new(20);
    let short = local.fork(3, 7, 2);
    let config = DownloaderConfig { max_fork_ancestry: 5, ..test_config() };
    let sync = TestSync::new(config, &local, 20);
    let peer = sync.network.add_peer(1, &short, Behaviour::default());

    let td = local.head_td() + U256::from(1);
    let err = sync
        .downloader
        .synchronise(peer.id(), short.head().hash(), td, SyncMode::Full)
        .await
        .unwrap_err();
    assert_matches!(err, DownloadError::InvalidAncestor { .. });
    assert_eq!(err.peer(), Some(peer.id()));
    // only the head lookup went out
    assert_eq!(peer.requests().len(), 1);
    assert_eq!(sync.provider.head_block().unwrap().hash(), local.head().hash());
}

#[tokio::test(start_paused = true)]
async fn switches_to_heavier_fork() {
    let local = TestChain::new(50);
    let fork = local.fork(30, 40, 1);
    let sync = TestSync::new(test_config(), &local, 50);
    let peer = sync.network.add_peer(1, &fork, Behaviour::default());

    let outcome = sync.synchronise(&peer, SyncMode::Full).await.unwrap();
    assert_eq!(outcome, SyncOutcome::Synced { origin: 30, head: fork.head().num_hash() });
    assert_eq!(sync.executor.executed(), (31..=70).collect::<Vec<_>>());
    assert_eq!(
        sync.provider.canonical_hash(45).unwrap(),
        Some(fork.header(45).unwrap().hash())
    );
}
