use alloy_rlp::Encodable;
use dos_primitives::{
    keccak256, logs_bloom,
    proofs::{calculate_receipt_root, calculate_transaction_root, EMPTY_LIST_HASH, EMPTY_ROOT},
    Address, BlockBody, BlockHashOrNumber, Bytes, Header, HeadersRequest, Log, Receipt,
    SealedBlock, SealedHeader, B256, U256,
};
use std::collections::HashMap;

/// Difficulty of every generated block.
pub const DIFFICULTY: u64 = 50;

/// Gas limit of every generated block.
pub const GAS_LIMIT: u64 = 8_000_000;

/// Number of leaves of every generated state trie.
pub const STATE_LEAVES: usize = 8;

/// Generates a chain of `count` sealed headers on top of `parent`.
///
/// The headers commit to empty bodies and receipts and pass [`EngineConsensus`] proof-of-work
/// validation.
///
/// [`EngineConsensus`]: crate::consensus::EngineConsensus
pub fn header_chain(parent: &SealedHeader, count: usize) -> Vec<SealedHeader> {
    let mut headers: Vec<SealedHeader> = Vec::with_capacity(count);
    for _ in 0..count {
        let parent = headers.last().unwrap_or(parent);
        let header = Header {
            parent_hash: parent.hash(),
            ommers_hash: EMPTY_LIST_HASH,
            state_root: EMPTY_ROOT,
            transactions_root: EMPTY_ROOT,
            receipts_root: EMPTY_ROOT,
            difficulty: U256::from(DIFFICULTY),
            number: parent.number + 1,
            gas_limit: GAS_LIMIT,
            timestamp: parent.timestamp + 10,
            ..Default::default()
        };
        headers.push(header.seal_slow());
    }
    headers
}

/// The receipts produced by executing the body of a generated block.
///
/// Every transaction emits one log whose topic is the hash of the transaction.
pub fn receipts_for(body: &BlockBody) -> Vec<Receipt> {
    body.transactions
        .iter()
        .enumerate()
        .map(|(idx, tx)| {
            let log = Log {
                address: Address::with_last_byte(tx.last().copied().unwrap_or_default()),
                topics: vec![keccak256(tx)],
                data: Bytes::new(),
            };
            Receipt::new(true, 21_000 * (idx as u64 + 1), vec![log])
        })
        .collect()
}

/// Encodes a synthetic trie node referencing `children` and carrying `value`.
pub fn encode_node(children: &[B256], value: &[u8]) -> Bytes {
    let value = Bytes::copy_from_slice(value);
    let mut payload_length = children.iter().map(Encodable::length).sum::<usize>();
    if !value.is_empty() {
        payload_length += value.length();
    }
    let mut out = Vec::new();
    alloy_rlp::Header { list: true, payload_length }.encode(&mut out);
    for child in children {
        child.encode(&mut out);
    }
    if !value.is_empty() {
        value.encode(&mut out);
    }
    out.into()
}

fn insert_node(nodes: &mut HashMap<B256, Bytes>, node: Bytes) -> B256 {
    let hash = keccak256(&node);
    nodes.insert(hash, node);
    hash
}

/// Builds a small state trie unique to the block and returns its root.
///
/// All tries share their leaves and inner nodes, only the root differs.
pub fn state_trie(nodes: &mut HashMap<B256, Bytes>, number: u64, seed: u8) -> B256 {
    let leaves: Vec<B256> = (0..STATE_LEAVES)
        .map(|idx| insert_node(nodes, encode_node(&[], format!("account-{idx}").as_bytes())))
        .collect();
    let branches: Vec<B256> =
        leaves.chunks(4).map(|chunk| insert_node(nodes, encode_node(chunk, &[]))).collect();
    let mut value = number.to_be_bytes().to_vec();
    value.push(seed);
    insert_node(nodes, encode_node(&branches, &value))
}

/// A fully materialised chain with bodies, receipts, total difficulties and state.
#[derive(Debug, Clone)]
pub struct TestChain {
    blocks: Vec<SealedBlock>,
    receipts: Vec<Vec<Receipt>>,
    tds: Vec<U256>,
    numbers: HashMap<B256, u64>,
    nodes: HashMap<B256, Bytes>,
}

impl TestChain {
    /// Generates a chain of `length` blocks on top of a fresh genesis.
    pub fn new(length: u64) -> Self {
        let mut nodes = HashMap::new();
        let genesis = Header {
            ommers_hash: EMPTY_LIST_HASH,
            state_root: state_trie(&mut nodes, 0, 0),
            transactions_root: EMPTY_ROOT,
            receipts_root: EMPTY_ROOT,
            difficulty: U256::from(DIFFICULTY),
            gas_limit: GAS_LIMIT,
            ..Default::default()
        }
        .seal_slow();
        let mut chain = Self {
            numbers: HashMap::from([(genesis.hash(), 0)]),
            blocks: vec![SealedBlock { header: genesis, body: BlockBody::default() }],
            receipts: vec![Vec::new()],
            tds: vec![U256::from(DIFFICULTY)],
            nodes,
        };
        chain.extend(length, 0);
        chain
    }

    /// Returns a copy of the chain sharing blocks `0..=at` and continuing with `length` new
    /// blocks. A non-zero seed makes the new blocks differ from any other branch.
    pub fn fork(&self, at: u64, length: u64, seed: u8) -> Self {
        let keep = (at + 1) as usize;
        let mut chain = Self {
            blocks: self.blocks[..keep].to_vec(),
            receipts: self.receipts[..keep].to_vec(),
            tds: self.tds[..keep].to_vec(),
            numbers: self.blocks[..keep].iter().map(|b| (b.hash(), b.number())).collect(),
            nodes: self.nodes.clone(),
        };
        chain.extend(length, seed);
        chain
    }

    fn extend(&mut self, length: u64, seed: u8) {
        for _ in 0..length {
            let parent = self.head().header.clone();
            let number = parent.number + 1;
            let transactions = (0..number % 3)
                .map(|idx| {
                    let mut tx = number.to_be_bytes().to_vec();
                    tx.extend_from_slice(&[seed, idx as u8]);
                    Bytes::from(tx)
                })
                .collect();
            let body = BlockBody { transactions, ommers: Vec::new() };
            let receipts = receipts_for(&body);
            let header = Header {
                parent_hash: parent.hash(),
                ommers_hash: EMPTY_LIST_HASH,
                state_root: state_trie(&mut self.nodes, number, seed),
                transactions_root: calculate_transaction_root(&body),
                receipts_root: calculate_receipt_root(&receipts),
                logs_bloom: logs_bloom(receipts.iter().flat_map(|r| r.logs.iter())),
                difficulty: U256::from(DIFFICULTY),
                number,
                gas_limit: GAS_LIMIT,
                gas_used: receipts.last().map(|r| r.cumulative_gas_used).unwrap_or_default(),
                timestamp: parent.timestamp + 10,
                extra_data: Bytes::from(vec![seed]),
            }
            .seal_slow();
            let td = self.head_td() + header.difficulty;
            self.numbers.insert(header.hash(), number);
            self.blocks.push(SealedBlock { header, body });
            self.receipts.push(receipts);
            self.tds.push(td);
        }
    }

    /// The genesis header.
    pub fn genesis(&self) -> &SealedHeader {
        &self.blocks[0].header
    }

    /// The last block of the chain.
    pub fn head(&self) -> &SealedBlock {
        &self.blocks[self.blocks.len() - 1]
    }

    /// Total difficulty of the head.
    pub fn head_td(&self) -> U256 {
        self.tds[self.tds.len() - 1]
    }

    /// Number of the head.
    pub fn head_number(&self) -> u64 {
        self.head().number()
    }

    /// The block with the given number.
    pub fn block(&self, number: u64) -> Option<&SealedBlock> {
        self.blocks.get(number as usize)
    }

    /// The header with the given number.
    pub fn header(&self, number: u64) -> Option<&SealedHeader> {
        self.block(number).map(|b| &b.header)
    }

    /// The number of the block with the given hash.
    pub fn number_of(&self, hash: &B256) -> Option<u64> {
        self.numbers.get(hash).copied()
    }

    /// The receipts of the block with the given number.
    pub fn receipts(&self, number: u64) -> Option<&Vec<Receipt>> {
        self.receipts.get(number as usize)
    }

    /// Total difficulty of the block with the given number.
    pub fn td(&self, number: u64) -> Option<U256> {
        self.tds.get(number as usize).copied()
    }

    /// All blocks in ascending order.
    pub fn blocks(&self) -> &[SealedBlock] {
        &self.blocks
    }

    /// Answers a `GetBlockHeaders` request the way a compliant peer does.
    pub fn answer_headers(&self, request: &HeadersRequest) -> Vec<Header> {
        let start = match request.start {
            BlockHashOrNumber::Hash(hash) => match self.number_of(&hash) {
                Some(number) => number,
                None => return Vec::new(),
            },
            BlockHashOrNumber::Number(number) => number,
        };
        let step = request.skip + 1;
        let mut headers = Vec::new();
        let mut next = Some(start);
        while let Some(number) = next {
            if headers.len() as u64 >= request.limit {
                break
            }
            let Some(header) = self.header(number) else { break };
            headers.push(header.header().clone());
            next = if request.direction.is_rising() {
                number.checked_add(step)
            } else {
                number.checked_sub(step)
            };
        }
        headers
    }

    /// Answers a `GetBlockBodies` request, skipping unknown hashes.
    pub fn answer_bodies(&self, hashes: &[B256]) -> Vec<BlockBody> {
        hashes
            .iter()
            .filter_map(|hash| self.number_of(hash))
            .filter_map(|number| self.block(number))
            .map(|block| block.body.clone())
            .collect()
    }

    /// Answers a `GetReceipts` request, skipping unknown hashes.
    pub fn answer_receipts(&self, hashes: &[B256]) -> Vec<Vec<Receipt>> {
        hashes
            .iter()
            .filter_map(|hash| self.number_of(hash))
            .filter_map(|number| self.receipts(number))
            .cloned()
            .collect()
    }

    /// Answers a `GetNodeData` request, skipping unknown hashes.
    pub fn answer_node_data(&self, hashes: &[B256]) -> Vec<Bytes> {
        hashes.iter().filter_map(|hash| self.nodes.get(hash)).cloned().collect()
    }

    /// The trie node with the given hash.
    pub fn node(&self, hash: &B256) -> Option<&Bytes> {
        self.nodes.get(hash)
    }
}
