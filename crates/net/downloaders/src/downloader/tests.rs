use super::*;
use crate::test_utils::{test_config, Behaviour, TestSync};
use assert_matches::assert_matches;
use dos_interfaces::{
    p2p::{
        message::EthMessage,
        peer::{EthPeer, ReputationChangeKind},
    },
    test_utils::TestChain,
};
use std::time::Duration;

fn silent() -> Behaviour {
    Behaviour { silent: true, ..Default::default() }
}

#[tokio::test(start_paused = true)]
async fn rejects_without_peers() {
    let chain = TestChain::new(10);
    let sync = TestSync::new(test_config(), &chain, 0);
    let result =
        sync.downloader.synchronise(PeerId::ZERO, chain.head().hash(), U256::MAX, SyncMode::Full);
    assert_matches!(result.await, Err(DownloadError::NoPeers));

    sync.network.add_peer(1, &chain, Behaviour::default());
    let unknown = PeerId::repeat_byte(9);
    let result =
        sync.downloader.synchronise(unknown, chain.head().hash(), U256::MAX, SyncMode::Full);
    assert_matches!(result.await, Err(DownloadError::UnknownPeer(id)) if id == unknown);
    assert!(!sync.downloader.synchronising());
}

#[tokio::test(start_paused = true)]
async fn no_improvement_when_local_is_heavier() {
    let chain = TestChain::new(10);
    let sync = TestSync::new(test_config(), &chain, 10);
    let peer = sync.network.add_peer(1, &chain, Behaviour::default());

    assert_matches!(sync.synchronise(&peer, SyncMode::Full).await, Ok(SyncOutcome::NoImprovement));
    assert!(peer.requests().is_empty());
}

#[tokio::test(start_paused = true)]
async fn syncs_full_chain_in_order() {
    let chain = TestChain::new(50);
    let sync = TestSync::new(test_config(), &chain, 0);
    let peer = sync.network.add_peer(1, &chain, Behaviour::default());

    let outcome = sync.synchronise(&peer, SyncMode::Full).await.unwrap();
    assert_eq!(outcome, SyncOutcome::Synced { origin: 0, head: chain.head().num_hash() });
    assert_eq!(sync.executor.executed(), (1..=50).collect::<Vec<_>>());
    assert_eq!(sync.provider.head_block().unwrap().hash(), chain.head().hash());
    assert_eq!(sync.downloader.progress().current, 50);
    assert!(sync.metrics.counter("downloader.bodies.in") > 0);
    assert_eq!(sync.metrics.counter("downloader.blocks.committed"), 50);
}

#[tokio::test(start_paused = true)]
async fn concurrent_run_is_rejected() {
    let chain = TestChain::new(10);
    let sync = TestSync::new(test_config(), &chain, 0);
    let peer = sync.network.add_peer(1, &chain, silent());

    let downloader = Arc::clone(&sync.downloader);
    let (hash, td) = (chain.head().hash(), chain.head_td());
    let run = tokio::spawn(async move {
        downloader.synchronise(PeerId::repeat_byte(1), hash, td, SyncMode::Full).await
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(sync.downloader.synchronising());
    assert_matches!(sync.synchronise(&peer, SyncMode::Full).await, Err(DownloadError::Busy));

    sync.downloader.cancel();
    assert_matches!(run.await.unwrap(), Err(DownloadError::Cancelled));
    assert!(!sync.downloader.synchronising());
}

#[tokio::test(start_paused = true)]
async fn failed_execution_keeps_preceding_blocks() {
    let chain = TestChain::new(30);
    let sync = TestSync::new(test_config(), &chain, 0);
    let peer = sync.network.add_peer(1, &chain, Behaviour::default());
    let bad = chain.header(20).unwrap().hash();
    sync.executor.fail_on(bad);

    assert_matches!(
        sync.synchronise(&peer, SyncMode::Full).await,
        Err(DownloadError::BadBlock { number: 20, hash, .. }) if hash == bad
    );
    assert_eq!(sync.executor.executed(), (1..=19).collect::<Vec<_>>());
    assert_eq!(sync.provider.head_block().unwrap().number, 19);
}

#[tokio::test(start_paused = true)]
async fn terminate_rejects_future_runs() {
    let chain = TestChain::new(10);
    let sync = TestSync::new(test_config(), &chain, 0);
    let peer = sync.network.add_peer(1, &chain, silent());

    let downloader = Arc::clone(&sync.downloader);
    let (hash, td) = (chain.head().hash(), chain.head_td());
    let run = tokio::spawn(async move {
        downloader.synchronise(PeerId::repeat_byte(1), hash, td, SyncMode::Fast).await
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    sync.downloader.terminate();
    assert_matches!(run.await.unwrap(), Err(DownloadError::Terminated));
    assert_matches!(sync.synchronise(&peer, SyncMode::Fast).await, Err(DownloadError::Terminated));
}

#[tokio::test(start_paused = true)]
async fn silent_master_times_out() {
    let chain = TestChain::new(10);
    let sync = TestSync::new(test_config(), &chain, 0);
    let peer = sync.network.add_peer(1, &chain, silent());

    assert_matches!(
        sync.synchronise(&peer, SyncMode::Full).await,
        Err(DownloadError::Timeout { peer_id }) if peer_id == PeerId::repeat_byte(1)
    );
    // the head request was retried up to the limit
    assert_eq!(peer.requests().len(), test_config().peer_timeout_limit);
    assert_eq!(sync.metrics.counter("downloader.errors.timeout"), 1);
}

#[tokio::test(start_paused = true)]
async fn stalls_when_bodies_never_arrive() {
    let chain = TestChain::new(10);
    let sync = TestSync::new(test_config(), &chain, 0);
    let peer =
        sync.network.add_peer(1, &chain, Behaviour { withhold_bodies: true, ..Default::default() });

    assert_matches!(sync.synchronise(&peer, SyncMode::Full).await, Err(DownloadError::Stalled));
    assert_eq!(sync.reporter.reports_for(peer.id()), vec![ReputationChangeKind::Timeout]);
    let bodies = peer
        .requests()
        .into_iter()
        .filter(|request| matches!(request, EthMessage::GetBlockBodies(_)))
        .count();
    assert_eq!(bodies, test_config().peer_timeout_limit);
    assert_eq!(sync.provider.head_block().unwrap().number, 0);
}

#[tokio::test(start_paused = true)]
async fn late_deliveries_are_dropped() {
    let chain = TestChain::new(3);
    let sync = TestSync::new(test_config(), &chain, 0);
    assert!(!sync.downloader.deliver_headers(PeerId::ZERO, vec![chain.head().header().clone()]));
    assert_eq!(sync.metrics.counter("downloader.headers.drop"), 1);
}

#[tokio::test(start_paused = true)]
async fn skeleton_gaps_are_filled_by_all_peers() {
    let chain = TestChain::new(100);
    let config = DownloaderConfig { fill_batch: 16, skeleton_size: 4, ..test_config() };
    let sync = TestSync::new(config, &chain, 0);
    let master = sync.network.add_peer(1, &chain, Behaviour::default());
    let filler = sync.network.add_peer(2, &chain, Behaviour::default());

    let outcome = sync.synchronise(&master, SyncMode::Full).await.unwrap();
    assert_eq!(outcome, SyncOutcome::Synced { origin: 0, head: chain.head().num_hash() });
    assert_eq!(sync.executor.executed(), (1..=100).collect::<Vec<_>>());

    let skeletons = master
        .requests()
        .into_iter()
        .filter(|request| {
            matches!(request, EthMessage::GetBlockHeaders(request) if request.skip == 15)
        })
        .count();
    assert_eq!(skeletons, 2);
    assert!(filler
        .requests()
        .iter()
        .any(|request| matches!(request, EthMessage::GetBlockHeaders(_))));
}
