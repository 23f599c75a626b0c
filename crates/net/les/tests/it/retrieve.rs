use assert_matches::assert_matches;
use dos_interfaces::{p2p::peer::ReputationChangeKind, test_utils::TestChain};
use dos_les::{
    server_pool::NEUTRAL_SCORE,
    test_utils::{ServerBehaviour, TestLes, TestLightNetwork},
    LightPayload, LightPeer, LightRequest, LightResponse, RetrieveConfig, RetrieveError,
    ServerPoolConfig,
};
use dos_peers::RequestKind;
use dos_primitives::B256;
use proptest::{collection::vec, prelude::*};
use std::time::Duration;
use tokio::time::Instant;

fn state_root(chain: &TestChain, number: u64) -> B256 {
    chain.header(number).unwrap().state_root
}

#[tokio::test(start_paused = true)]
async fn retrieves_from_honest_server() {
    let chain = TestChain::new(10);
    let les = TestLes::new(RetrieveConfig::default());
    let server = les.network.add_server(1, &chain, ServerBehaviour::Honest);

    let hash = state_root(&chain, 4);
    let response = les.retriever.retrieve(LightRequest::TrieNode { hash }).await.unwrap();
    assert_eq!(response.payload, LightPayload::TrieNode(chain.node(&hash).unwrap().clone()));
    assert_eq!(server.requests(), vec![LightRequest::TrieNode { hash }]);

    let pool = les.retriever.pool();
    assert!(pool.score(&server.id()).unwrap() > NEUTRAL_SCORE);
    assert_eq!(pool.served_cost(&server.id()), 1);
    assert_eq!(les.metrics.counter("les.retrieve.success"), 1);
    assert_eq!(les.retriever.pending(), 0);
}

#[tokio::test(start_paused = true)]
async fn failing_servers_are_skipped_and_penalised() {
    dos_tracing::init_test_tracing();
    let chain = TestChain::new(10);
    let les = TestLes::new(RetrieveConfig::default());
    let garbage = les.network.add_server(1, &chain, ServerBehaviour::Garbage);
    let silent = les.network.add_server(2, &chain, ServerBehaviour::Silent);
    let honest = les.network.add_server(3, &chain, ServerBehaviour::Honest);

    let header = chain.header(7).unwrap().clone();
    let started = Instant::now();
    let response =
        les.retriever.retrieve(LightRequest::Body { header: header.clone() }).await.unwrap();
    assert_eq!(response.payload, LightPayload::Body(chain.block(7).unwrap().body.clone()));
    assert!(started.elapsed() >= RetrieveConfig::default().request_timeout);

    // every server was asked once, in registration order
    for server in [&garbage, &silent, &honest] {
        assert_eq!(server.requests().len(), 1);
    }
    assert_eq!(les.reporter.reports_for(garbage.id()), vec![ReputationChangeKind::BadMessage]);
    assert_eq!(les.reporter.reports_for(silent.id()), vec![ReputationChangeKind::Timeout]);
    assert!(les.reporter.reports_for(honest.id()).is_empty());
    assert_eq!(les.metrics.counter("les.retrieve.invalid"), 1);
    assert_eq!(les.metrics.counter("les.retrieve.timeout"), 1);

    let pool = les.retriever.pool();
    assert!(pool.score(&garbage.id()).unwrap() < NEUTRAL_SCORE);
    assert!(pool.score(&silent.id()).unwrap() < NEUTRAL_SCORE);
}

#[tokio::test(start_paused = true)]
async fn exhausted_when_every_server_fails() {
    let chain = TestChain::new(10);
    let les = TestLes::new(RetrieveConfig::default());
    les.network.add_server(1, &chain, ServerBehaviour::Garbage);
    les.network.add_server(2, &chain, ServerBehaviour::Garbage);

    let hash = state_root(&chain, 2);
    assert_matches!(
        les.retriever.retrieve(LightRequest::TrieNode { hash }).await,
        Err(RetrieveError::Exhausted)
    );
    assert_eq!(les.metrics.counter("les.retrieve.invalid"), 2);
    assert_eq!(les.metrics.counter("les.retrieve.exhausted"), 1);
}

#[tokio::test(start_paused = true)]
async fn exhausted_without_capable_server() {
    let chain = TestChain::new(10);
    let short = TestChain::new(3);
    let les = TestLes::new(RetrieveConfig::default());
    let behind = les.network.add_server(1, &short, ServerBehaviour::Honest);

    let header = chain.header(8).unwrap().clone();
    assert_matches!(
        les.retriever.retrieve(LightRequest::Receipts { header }).await,
        Err(RetrieveError::Exhausted)
    );
    assert!(behind.requests().is_empty());
}

#[tokio::test(start_paused = true)]
async fn deadline_bounds_all_attempts() {
    let chain = TestChain::new(10);
    let config =
        RetrieveConfig { request_timeout: Duration::from_secs(2), deadline: Duration::from_secs(3) };
    let les = TestLes::new(config);
    for seed in 1..=3 {
        les.network.add_server(seed, &chain, ServerBehaviour::Silent);
    }

    let started = Instant::now();
    let hash = state_root(&chain, 5);
    assert_matches!(
        les.retriever.retrieve(LightRequest::TrieNode { hash }).await,
        Err(RetrieveError::Timeout)
    );
    assert!(started.elapsed() >= Duration::from_secs(3));
    assert!(started.elapsed() < Duration::from_secs(4));
    assert_eq!(les.reporter.reports().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn concurrent_retrievals_share_one_request() {
    let chain = TestChain::new(10);
    let les = TestLes::new(RetrieveConfig::default());
    let server =
        les.network.add_server(1, &chain, ServerBehaviour::Delayed(Duration::from_millis(500)));

    let hash = state_root(&chain, 6);
    let (a, b) = tokio::join!(
        les.retriever.retrieve(LightRequest::TrieNode { hash }),
        les.retriever.retrieve(LightRequest::TrieNode { hash }),
    );
    assert_eq!(a.unwrap(), b.unwrap());
    assert_eq!(server.requests().len(), 1);

    // a later retrieval starts over
    les.retriever.retrieve(LightRequest::TrieNode { hash }).await.unwrap();
    assert_eq!(server.requests().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn abandoned_retrieval_is_not_joined_later() {
    let chain = TestChain::new(10);
    let les = TestLes::new(RetrieveConfig::default());
    let silent = les.network.add_server(1, &chain, ServerBehaviour::Silent);

    let request = LightRequest::TrieNode { hash: state_root(&chain, 6) };
    let retriever = les.retriever.clone();
    let first = tokio::spawn({
        let request = request.clone();
        async move { retriever.retrieve(request).await }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(silent.requests().len(), 1);
    first.abort();
    assert!(first.await.unwrap_err().is_cancelled());
    // the withdrawn request freed the server
    assert_eq!(les.retriever.pending(), 0);
    assert!(les.network.registry().get(&silent.id()).unwrap().is_idle(RequestKind::NodeData));

    tokio::time::sleep(Duration::from_secs(60)).await;
    let honest = les.network.add_server(2, &chain, ServerBehaviour::Honest);
    let response = les.retriever.retrieve(request.clone()).await.unwrap();
    let node = chain.node(&state_root(&chain, 6)).unwrap().clone();
    assert_eq!(response.payload, LightPayload::TrieNode(node));
    assert_eq!(honest.requests(), vec![request]);
}

#[tokio::test(start_paused = true)]
async fn cancelled_retrieval_settles_trial_slot() {
    let chain = TestChain::new(10);
    let network = TestLightNetwork::new(ServerPoolConfig::default());
    let les = TestLes::with_network(network, RetrieveConfig::default());
    let silent = les.network.add_server(1, &chain, ServerBehaviour::Silent);
    let pool = les.retriever.pool().clone();

    let retriever = les.retriever.clone();
    let hash = state_root(&chain, 2);
    let retrieval =
        tokio::spawn(async move { retriever.retrieve(LightRequest::TrieNode { hash }).await });
    tokio::time::sleep(Duration::from_millis(100)).await;
    // the one trial request is outstanding
    assert!(!pool.is_eligible(&silent.id()));

    les.cancel.cancel();
    assert_matches!(retrieval.await.unwrap(), Err(RetrieveError::Cancelled));
    assert!(pool.is_eligible(&silent.id()));
    assert!(pool.on_trial(&silent.id()));
    assert_eq!(pool.score(&silent.id()), Some(NEUTRAL_SCORE));
    assert!(les.reporter.reports().is_empty());
}

#[tokio::test(start_paused = true)]
async fn late_and_foreign_answers_are_dropped() {
    let chain = TestChain::new(10);
    let config = RetrieveConfig { request_timeout: Duration::from_secs(1), ..Default::default() };
    let les = TestLes::new(config);
    let slow = les.network.add_server(1, &chain, ServerBehaviour::Delayed(Duration::from_secs(2)));
    let honest = les.network.add_server(2, &chain, ServerBehaviour::Honest);

    let hash = state_root(&chain, 3);
    les.retriever.retrieve(LightRequest::TrieNode { hash }).await.unwrap();
    assert_eq!(slow.requests().len(), 1);
    assert_eq!(honest.requests().len(), 1);
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(les.metrics.counter("les.retrieve.success"), 1);

    let foreign = LightResponse {
        request_id: 1,
        buffer_value: 0,
        payload: LightPayload::TrieNode(Default::default()),
    };
    assert!(!les.retriever.deliver(honest.id(), foreign));
}

#[tokio::test(start_paused = true)]
async fn servers_on_trial_get_one_request_at_a_time() {
    let chain = TestChain::new(10);
    let network = TestLightNetwork::new(ServerPoolConfig::default());
    let les = TestLes::with_network(network, RetrieveConfig::default());
    let delay = ServerBehaviour::Delayed(Duration::from_millis(300));
    let first = les.network.add_server(1, &chain, delay);
    let second = les.network.add_server(2, &chain, delay);

    let node = LightRequest::TrieNode { hash: state_root(&chain, 1) };
    let header = LightRequest::header_by_hash(chain.header(4).unwrap().hash());
    let (a, b) = tokio::join!(
        les.retriever.retrieve(node.clone()),
        les.retriever.retrieve(header.clone()),
    );
    assert_matches!(a, Ok(_));
    assert_matches!(b, Ok(_));
    // the first server is idle for headers but already has its one trial request
    assert_eq!(first.requests(), vec![node]);
    assert_eq!(second.requests(), vec![header]);
    assert!(les.retriever.pool().on_trial(&first.id()));
}

fn behaviour() -> impl Strategy<Value = ServerBehaviour> {
    prop_oneof![
        Just(ServerBehaviour::Honest),
        Just(ServerBehaviour::Silent),
        Just(ServerBehaviour::Garbage),
        (1u64..1500).prop_map(|ms| ServerBehaviour::Delayed(Duration::from_millis(ms))),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn retrieval_succeeds_iff_some_server_answers(behaviours in vec(behaviour(), 1..6)) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build()
            .unwrap();
        let answers = behaviours
            .iter()
            .any(|b| matches!(b, ServerBehaviour::Honest | ServerBehaviour::Delayed(_)));

        let (result, asked) = runtime.block_on(async {
            let chain = TestChain::new(8);
            let les = TestLes::new(RetrieveConfig::default());
            let servers: Vec<_> = behaviours
                .iter()
                .enumerate()
                .map(|(i, b)| les.network.add_server(i as u8 + 1, &chain, *b))
                .collect();
            let header = chain.header(5).unwrap().clone();
            let result = les.retriever.retrieve(LightRequest::Receipts { header }).await;
            let asked: Vec<usize> = servers.iter().map(|s| s.requests().len()).collect();
            (result, asked)
        });

        prop_assert_eq!(result.is_ok(), answers);
        match &result {
            Ok(response) => prop_assert!(matches!(response.payload, LightPayload::Receipts(_))),
            Err(error) => prop_assert_eq!(*error, RetrieveError::Exhausted),
        }
        // no server is asked twice for the same data
        prop_assert!(asked.iter().all(|count| *count <= 1));
    }
}
