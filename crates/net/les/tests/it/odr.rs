use assert_matches::assert_matches;
use dos_interfaces::{db::MemoryDatabase, test_utils::TestChain};
use dos_les::{
    test_utils::{ServerBehaviour, TestLes},
    LightOdr, LightRequest, OdrError, RetrieveConfig, RetrieveError,
};
use dos_primitives::Bytes;
use dos_provider::ChainProvider;
use std::sync::Arc;

fn odr(les: &TestLes, chain: &TestChain) -> LightOdr {
    let provider = ChainProvider::new(Arc::new(MemoryDatabase::new()));
    provider.init_genesis(chain.genesis()).unwrap();
    LightOdr::new(provider, les.retriever.clone())
}

#[tokio::test(start_paused = true)]
async fn retrieved_data_is_stored_locally() {
    let chain = TestChain::new(10);
    let les = TestLes::new(RetrieveConfig::default());
    let server = les.network.add_server(1, &chain, ServerBehaviour::Honest);
    let odr = odr(&les, &chain);

    let block = chain.block(8).unwrap();
    let body = odr.block_body(block.hash()).await.unwrap();
    assert_eq!(body, block.body);
    let receipts = odr.receipts(block.hash()).await.unwrap();
    assert_eq!(&receipts, chain.receipts(8).unwrap());
    // one header, one body, one receipts request
    assert_eq!(server.requests().len(), 3);
    assert_eq!(server.requests()[0], LightRequest::header_by_hash(block.hash()));

    // served locally from now on
    assert_eq!(odr.block_body(block.hash()).await.unwrap(), block.body);
    assert_eq!(&odr.receipts(block.hash()).await.unwrap(), chain.receipts(8).unwrap());
    assert_eq!(odr.header_by_hash(block.hash()).await.unwrap(), block.header);
    assert_eq!(server.requests().len(), 3);
    assert_eq!(odr.provider().body(8, block.hash()).unwrap(), Some(block.body.clone()));
}

#[tokio::test(start_paused = true)]
async fn local_data_needs_no_server() {
    let chain = TestChain::new(10);
    let les = TestLes::new(RetrieveConfig::default());
    let odr = odr(&les, &chain);

    let genesis = chain.genesis();
    assert_eq!(odr.header_by_number(0).await.unwrap(), *genesis);
    let root = genesis.state_root;
    let node = chain.node(&root).unwrap().clone();
    odr.provider().write_state_nodes([(&root, &node)]).unwrap();
    assert_eq!(odr.trie_node(root).await.unwrap(), node);

    // empty bodies are known from the header alone
    let empty = chain.block(6).unwrap();
    odr.provider().write_header(&empty.header).unwrap();
    assert!(odr.block_body(empty.hash()).await.unwrap().transactions.is_empty());

    assert_matches!(
        odr.header_by_number(4).await,
        Err(OdrError::Retrieve(RetrieveError::Exhausted))
    );
}

#[tokio::test(start_paused = true)]
async fn state_and_code_are_verified_and_cached() {
    let chain = TestChain::new(10);
    let les = TestLes::new(RetrieveConfig::default());
    let liar = les.network.add_server(1, &chain, ServerBehaviour::Garbage);
    let honest = les.network.add_server(2, &chain, ServerBehaviour::Honest);
    let odr = odr(&les, &chain);

    let code = Bytes::from_static(&[0x60, 0x00, 0x60, 0x00, 0xf3]);
    let hash = honest.add_code(code.clone());
    liar.add_code(code.clone());
    assert_eq!(odr.code(hash).await.unwrap(), code);
    assert_eq!(odr.provider().code(hash).unwrap(), Some(code));

    let root = chain.header(9).unwrap().state_root;
    assert_eq!(&odr.trie_node(root).await.unwrap(), chain.node(&root).unwrap());
    assert!(odr.provider().has_state_node(root).unwrap());
    // the liar is slower by now and not asked again
    assert_eq!(liar.requests().len(), 1);
    assert_eq!(honest.requests().len(), 2);

    let hash = chain.header(9).unwrap().hash();
    assert_eq!(odr.header_by_hash(hash).await.unwrap().hash(), hash);
    assert_eq!(liar.requests().len(), 2);
    assert_eq!(honest.requests().len(), 3);
}
