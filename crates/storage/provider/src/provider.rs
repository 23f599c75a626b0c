use crate::keys;
use alloy_rlp::Decodable;
use dos_interfaces::{
    db::{KeyValueStore, WriteBatch},
    provider::{ProviderError, ProviderResult},
};
use dos_primitives::{
    BlockBody, BlockHash, BlockNumber, Bytes, Header, Receipt, SealedBlock,
    SealedHeader, B256, U256,
};
use std::sync::Arc;
use tracing::{debug, trace};

/// Which head pointer a block import advances.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockHead {
    /// Leave both block heads untouched.
    None,
    /// Advance the fast block head, the state of the blocks is not available.
    Fast,
    /// Advance the full block head and the fast block head.
    Full,
}

/// Typed access to the chain stored in a [`KeyValueStore`].
///
/// Every write method produces exactly one [`WriteBatch`], so a crash never leaves half a
/// commit behind.
#[derive(Debug, Clone)]
pub struct ChainProvider {
    db: Arc<dyn KeyValueStore>,
}

impl ChainProvider {
    /// Create a provider over the given database.
    pub fn new(db: Arc<dyn KeyValueStore>) -> Self {
        Self { db }
    }

    /// The underlying database.
    pub fn db(&self) -> &Arc<dyn KeyValueStore> {
        &self.db
    }

    fn get_decoded<T: Decodable>(
        &self,
        key: &[u8],
        what: &'static str,
    ) -> ProviderResult<Option<T>> {
        match self.db.get(key)? {
            Some(raw) => T::decode(&mut raw.as_slice())
                .map(Some)
                .map_err(|error| ProviderError::Decode { what, error }),
            None => Ok(None),
        }
    }

    fn get_hash(&self, key: &[u8]) -> ProviderResult<Option<B256>> {
        match self.db.get(key)? {
            Some(raw) if raw.len() == 32 => Ok(Some(B256::from_slice(&raw))),
            Some(_) => Err(ProviderError::Decode {
                what: "hash",
                error: alloy_rlp::Error::UnexpectedLength,
            }),
            None => Ok(None),
        }
    }

    /// Seeds an empty database with the genesis header.
    ///
    /// Calling it again with the same genesis is a no-op.
    pub fn init_genesis(&self, genesis: &SealedHeader) -> ProviderResult<()> {
        if let Some(existing) = self.canonical_hash(0)? {
            if existing == genesis.hash() {
                return Ok(())
            }
        }
        let hash = genesis.hash();
        let mut batch = WriteBatch::default();
        batch.put(keys::header_key(0, hash), alloy_rlp::encode(genesis.header()));
        batch.put(keys::td_key(0, hash), alloy_rlp::encode(genesis.difficulty));
        batch.put(keys::canonical_key(0), hash.to_vec());
        batch.put(keys::number_key(hash), 0u64.to_be_bytes().to_vec());
        batch.put(keys::body_key(0, hash), alloy_rlp::encode(BlockBody::default()));
        batch.put(keys::receipts_key(0, hash), alloy_rlp::encode(Vec::<Receipt>::new()));
        batch.put(keys::HEAD_HEADER_KEY, hash.to_vec());
        batch.put(keys::HEAD_BLOCK_KEY, hash.to_vec());
        batch.put(keys::HEAD_FAST_BLOCK_KEY, hash.to_vec());
        self.db.write_batch(batch)?;
        debug!(target: "storage::provider", %hash, "Initialized genesis");
        Ok(())
    }

    /// Hash of the canonical genesis block.
    pub fn genesis_hash(&self) -> ProviderResult<B256> {
        self.canonical_hash(0)?.ok_or(ProviderError::MissingGenesis)
    }

    /// Number of the block with the given hash.
    pub fn block_number(&self, hash: BlockHash) -> ProviderResult<Option<BlockNumber>> {
        match self.db.get(&keys::number_key(hash))? {
            Some(raw) => {
                let bytes: [u8; 8] = raw.as_slice().try_into().map_err(|_| ProviderError::Decode {
                    what: "block number",
                    error: alloy_rlp::Error::UnexpectedLength,
                })?;
                Ok(Some(u64::from_be_bytes(bytes)))
            }
            None => Ok(None),
        }
    }

    /// Hash of the canonical block at the given height.
    pub fn canonical_hash(&self, number: BlockNumber) -> ProviderResult<Option<B256>> {
        self.get_hash(&keys::canonical_key(number))
    }

    /// The header with the given number and hash.
    pub fn header(&self, number: BlockNumber, hash: BlockHash) -> ProviderResult<Option<SealedHeader>> {
        Ok(self
            .get_decoded::<Header>(&keys::header_key(number, hash), "header")?
            .map(|header| SealedHeader::new(header, hash)))
    }

    /// The header with the given hash.
    pub fn header_by_hash(&self, hash: BlockHash) -> ProviderResult<Option<SealedHeader>> {
        match self.block_number(hash)? {
            Some(number) => self.header(number, hash),
            None => Ok(None),
        }
    }

    /// The canonical header at the given height.
    pub fn header_by_number(&self, number: BlockNumber) -> ProviderResult<Option<SealedHeader>> {
        match self.canonical_hash(number)? {
            Some(hash) => self.header(number, hash),
            None => Ok(None),
        }
    }

    /// Returns true if the header is stored.
    pub fn has_header(&self, number: BlockNumber, hash: BlockHash) -> ProviderResult<bool> {
        Ok(self.db.has(&keys::header_key(number, hash))?)
    }

    /// Total difficulty of the chain up to and including the given block.
    pub fn td(&self, number: BlockNumber, hash: BlockHash) -> ProviderResult<Option<U256>> {
        self.get_decoded(&keys::td_key(number, hash), "total difficulty")
    }

    /// The body of the given block.
    pub fn body(&self, number: BlockNumber, hash: BlockHash) -> ProviderResult<Option<BlockBody>> {
        self.get_decoded(&keys::body_key(number, hash), "body")
    }

    /// Returns true if both header and body of the block are stored.
    pub fn has_block(&self, number: BlockNumber, hash: BlockHash) -> ProviderResult<bool> {
        Ok(self.has_header(number, hash)? && self.db.has(&keys::body_key(number, hash))?)
    }

    /// The full block with the given hash.
    pub fn block_by_hash(&self, hash: BlockHash) -> ProviderResult<Option<SealedBlock>> {
        let Some(header) = self.header_by_hash(hash)? else { return Ok(None) };
        Ok(self.body(header.number, hash)?.map(|body| body.into_block(header)))
    }

    /// The receipts of the given block.
    pub fn receipts(&self, number: BlockNumber, hash: BlockHash) -> ProviderResult<Option<Vec<Receipt>>> {
        self.get_decoded(&keys::receipts_key(number, hash), "receipts")
    }

    /// Returns true if the receipts of the block are stored.
    pub fn has_receipts(&self, number: BlockNumber, hash: BlockHash) -> ProviderResult<bool> {
        Ok(self.db.has(&keys::receipts_key(number, hash))?)
    }

    fn head(&self, key: &[u8]) -> ProviderResult<SealedHeader> {
        let hash = self.get_hash(key)?.ok_or(ProviderError::MissingGenesis)?;
        self.header_by_hash(hash)?.ok_or(ProviderError::HeaderNotFound(hash.into()))
    }

    /// The latest header of the canonical chain.
    pub fn head_header(&self) -> ProviderResult<SealedHeader> {
        self.head(keys::HEAD_HEADER_KEY)
    }

    /// The latest block whose state is available.
    pub fn head_block(&self) -> ProviderResult<SealedHeader> {
        self.head(keys::HEAD_BLOCK_KEY)
    }

    /// The latest block with body and receipts.
    pub fn head_fast_block(&self) -> ProviderResult<SealedHeader> {
        self.head(keys::HEAD_FAST_BLOCK_KEY)
    }

    /// Queue the headers into the batch and return the new canonical head if it changed.
    ///
    /// Headers must be contiguous and the parent of the first one must be stored.
    fn queue_headers(
        &self,
        batch: &mut WriteBatch,
        headers: &[&SealedHeader],
    ) -> ProviderResult<Option<(SealedHeader, U256)>> {
        let Some(first) = headers.first() else { return Ok(None) };
        if first.number == 0 {
            return Err(ProviderError::NonContiguousHeaders { block_number: 0 })
        }
        let mut td = self.td(first.number - 1, first.parent_hash)?.ok_or(
            ProviderError::UnknownParent {
                block_number: first.number,
                parent_hash: first.parent_hash,
            },
        )?;

        let mut parent: Option<&SealedHeader> = None;
        for header in headers {
            if let Some(parent) = parent {
                if !header.is_child_of(parent) {
                    return Err(ProviderError::NonContiguousHeaders { block_number: header.number })
                }
            }
            td += header.difficulty;
            let (number, hash) = (header.number, header.hash());
            batch.put(keys::header_key(number, hash), alloy_rlp::encode(header.header()));
            batch.put(keys::td_key(number, hash), alloy_rlp::encode(td));
            batch.put(keys::number_key(hash), number.to_be_bytes().to_vec());
            parent = Some(header);
        }

        let last = headers[headers.len() - 1];
        let head = self.head_header()?;
        let head_td = self.td(head.number, head.hash())?.ok_or(
            ProviderError::TotalDifficultyNotFound {
                block_number: head.number,
                block_hash: head.hash(),
            },
        )?;
        if td <= head_td {
            trace!(target: "storage::provider", number = last.number, %td, "Stored side chain headers");
            return Ok(None)
        }

        // the new chain is heavier, make it canonical
        for header in headers {
            batch.put(keys::canonical_key(header.number), header.hash().to_vec());
        }
        // fix up canonical hashes of the shared prefix the headers were built on
        let mut ancestor_hash = first.parent_hash;
        let mut ancestor_number = first.number - 1;
        while self.canonical_hash(ancestor_number)? != Some(ancestor_hash) {
            batch.put(keys::canonical_key(ancestor_number), ancestor_hash.to_vec());
            let Some(ancestor) = self.header(ancestor_number, ancestor_hash)? else {
                return Err(ProviderError::HeaderNotFound(ancestor_hash.into()))
            };
            if ancestor_number == 0 {
                break
            }
            ancestor_hash = ancestor.parent_hash;
            ancestor_number -= 1;
        }
        // drop canonical entries of the old chain above the new head
        for number in last.number + 1..=head.number {
            batch.delete(keys::canonical_key(number));
        }
        batch.put(keys::HEAD_HEADER_KEY, last.hash().to_vec());
        Ok(Some(((*last).clone(), td)))
    }

    /// Insert a contiguous chain of headers.
    ///
    /// If the resulting chain is heavier than the current canonical chain it becomes canonical
    /// and the header head moves to the last header. Returns the new head, if any.
    pub fn insert_headers(&self, headers: &[SealedHeader]) -> ProviderResult<Option<SealedHeader>> {
        let headers: Vec<&SealedHeader> = headers.iter().collect();
        let mut batch = WriteBatch::default();
        let head = self.queue_headers(&mut batch, &headers)?;
        self.db.write_batch(batch)?;
        if let Some((head, td)) = &head {
            debug!(target: "storage::provider", number = head.number, hash = %head.hash(), %td, "Updated header head");
        }
        Ok(head.map(|(head, _)| head))
    }

    /// Insert bodies, and optionally receipts, of a contiguous range of blocks.
    ///
    /// Headers that are not stored yet are written as well. `head` selects which block head
    /// pointer moves to the last block.
    pub fn insert_blocks(
        &self,
        blocks: &[SealedBlock],
        receipts: Option<&[Vec<Receipt>]>,
        head: BlockHead,
    ) -> ProviderResult<()> {
        let Some(last) = blocks.last() else { return Ok(()) };
        let mut batch = WriteBatch::default();

        let mut missing = Vec::new();
        for block in blocks {
            if !self.has_header(block.number(), block.hash())? {
                missing.push(&block.header);
            }
        }
        self.queue_headers(&mut batch, &missing)?;

        for (idx, block) in blocks.iter().enumerate() {
            let (number, hash) = (block.number(), block.hash());
            batch.put(keys::body_key(number, hash), alloy_rlp::encode(&block.body));
            if let Some(receipts) = receipts.and_then(|receipts| receipts.get(idx)) {
                batch.put(keys::receipts_key(number, hash), alloy_rlp::encode(receipts));
            }
        }
        match head {
            BlockHead::None => {}
            BlockHead::Fast => batch.put(keys::HEAD_FAST_BLOCK_KEY, last.hash().to_vec()),
            BlockHead::Full => {
                batch.put(keys::HEAD_FAST_BLOCK_KEY, last.hash().to_vec());
                batch.put(keys::HEAD_BLOCK_KEY, last.hash().to_vec());
            }
        }
        self.db.write_batch(batch)?;
        trace!(target: "storage::provider", first = blocks[0].number(), last = last.number(), ?head, "Inserted blocks");
        Ok(())
    }

    /// Store a header without touching total difficulty or canonical markers.
    ///
    /// Used by light clients that retrieve individual headers on demand.
    pub fn write_header(&self, header: &SealedHeader) -> ProviderResult<()> {
        let mut batch = WriteBatch::default();
        batch.put(keys::header_key(header.number, header.hash()), alloy_rlp::encode(header.header()));
        batch.put(keys::number_key(header.hash()), header.number.to_be_bytes().to_vec());
        self.db.write_batch(batch)?;
        Ok(())
    }

    /// Store a single body.
    pub fn write_body(&self, number: BlockNumber, hash: BlockHash, body: &BlockBody) -> ProviderResult<()> {
        Ok(self.db.put(&keys::body_key(number, hash), &alloy_rlp::encode(body))?)
    }

    /// Store the receipts of a single block.
    pub fn write_receipts(
        &self,
        number: BlockNumber,
        hash: BlockHash,
        receipts: &[Receipt],
    ) -> ProviderResult<()> {
        let mut out = Vec::new();
        alloy_rlp::encode_list(receipts, &mut out);
        Ok(self.db.put(&keys::receipts_key(number, hash), &out)?)
    }

    /// The state trie node with the given hash.
    pub fn state_node(&self, hash: B256) -> ProviderResult<Option<Bytes>> {
        Ok(self.db.get(&keys::state_node_key(hash))?.map(Bytes::from))
    }

    /// Returns true if the state trie node is stored.
    pub fn has_state_node(&self, hash: B256) -> ProviderResult<bool> {
        Ok(self.db.has(&keys::state_node_key(hash))?)
    }

    /// Store a set of state trie nodes in one batch.
    pub fn write_state_nodes<'a>(
        &self,
        nodes: impl IntoIterator<Item = (&'a B256, &'a Bytes)>,
    ) -> ProviderResult<usize> {
        let mut batch = WriteBatch::default();
        for (hash, node) in nodes {
            batch.put(keys::state_node_key(*hash), node.to_vec());
        }
        let written = batch.len();
        self.db.write_batch(batch)?;
        Ok(written)
    }

    /// The contract code with the given hash.
    pub fn code(&self, hash: B256) -> ProviderResult<Option<Bytes>> {
        Ok(self.db.get(&keys::code_key(hash))?.map(Bytes::from))
    }

    /// Store contract code.
    pub fn write_code(&self, hash: B256, code: &Bytes) -> ProviderResult<()> {
        Ok(self.db.put(&keys::code_key(hash), code)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use dos_interfaces::{db::MemoryDatabase, test_utils::TestChain};

    fn provider(chain: &TestChain) -> ChainProvider {
        let provider = ChainProvider::new(Arc::new(MemoryDatabase::new()));
        provider.init_genesis(chain.genesis()).unwrap();
        provider
    }

    #[test]
    fn genesis_initialisation_is_idempotent() {
        let chain = TestChain::new(0);
        let provider = provider(&chain);
        provider.init_genesis(chain.genesis()).unwrap();
        assert_eq!(provider.genesis_hash().unwrap(), chain.genesis().hash());
        assert_eq!(provider.head_header().unwrap(), *chain.genesis());
        assert_eq!(provider.head_block().unwrap(), *chain.genesis());
        assert_eq!(provider.td(0, chain.genesis().hash()).unwrap(), chain.td(0));
    }

    #[test]
    fn inserts_headers_and_blocks() {
        let chain = TestChain::new(10);
        let provider = provider(&chain);
        let headers: Vec<_> = (1..=10).map(|n| chain.header(n).unwrap().clone()).collect();
        let head = provider.insert_headers(&headers).unwrap().unwrap();
        assert_eq!(head.number, 10);
        assert_eq!(provider.td(10, head.hash()).unwrap(), Some(chain.head_td()));
        assert_eq!(provider.head_block().unwrap().number, 0);

        let blocks = chain.blocks()[1..=5].to_vec();
        let receipts: Vec<_> = (1..=5).map(|n| chain.receipts(n).unwrap().clone()).collect();
        provider.insert_blocks(&blocks, Some(&receipts), BlockHead::Fast).unwrap();
        assert_eq!(provider.head_fast_block().unwrap().number, 5);
        assert_eq!(provider.head_block().unwrap().number, 0);
        assert_eq!(provider.receipts(3, blocks[2].hash()).unwrap().as_ref(), chain.receipts(3));
        assert_eq!(provider.block_by_hash(blocks[4].hash()).unwrap(), Some(blocks[4].clone()));
    }

    #[test]
    fn heavier_fork_becomes_canonical() {
        let chain = TestChain::new(10);
        let fork = chain.fork(6, 6, 1);
        let provider = provider(&chain);
        provider.insert_blocks(&chain.blocks()[1..].to_vec(), None, BlockHead::Full).unwrap();
        assert_eq!(provider.head_header().unwrap().number, 10);

        // lighter side chain is stored but not canonical
        let side = chain.fork(6, 2, 2);
        let side_headers: Vec<_> = (7..=8).map(|n| side.header(n).unwrap().clone()).collect();
        assert_eq!(provider.insert_headers(&side_headers).unwrap(), None);
        assert_eq!(provider.canonical_hash(7).unwrap(), Some(chain.header(7).unwrap().hash()));

        let fork_headers: Vec<_> = (7..=12).map(|n| fork.header(n).unwrap().clone()).collect();
        provider.insert_headers(&fork_headers).unwrap();
        assert_eq!(provider.head_header().unwrap().hash(), fork.head().hash());
        assert_eq!(provider.canonical_hash(7).unwrap(), Some(fork.header(7).unwrap().hash()));
        assert_eq!(provider.canonical_hash(6).unwrap(), Some(chain.header(6).unwrap().hash()));
    }

    #[test]
    fn rejects_unknown_parent() {
        let chain = TestChain::new(5);
        let provider = provider(&chain);
        let headers = vec![chain.header(3).unwrap().clone()];
        assert_matches!(
            provider.insert_headers(&headers),
            Err(ProviderError::UnknownParent { block_number: 3, .. })
        );
    }

    #[test]
    fn retrieved_parts_are_stored_individually() {
        let chain = TestChain::new(5);
        let provider = provider(&chain);
        let block = chain.block(5).unwrap();
        let receipts = chain.receipts(5).unwrap();
        assert!(!receipts.is_empty());

        provider.write_header(&block.header).unwrap();
        provider.write_body(5, block.hash(), &block.body).unwrap();
        provider.write_receipts(5, block.hash(), receipts.as_slice()).unwrap();
        assert_eq!(provider.header_by_hash(block.hash()).unwrap(), Some(block.header.clone()));
        assert_eq!(provider.body(5, block.hash()).unwrap(), Some(block.body.clone()));
        assert_eq!(provider.receipts(5, block.hash()).unwrap().as_ref(), Some(receipts));
        // stored receipts are encoded like a full block insert
        assert_eq!(
            provider.db().get(&keys::receipts_key(5, block.hash())).unwrap(),
            Some(alloy_rlp::encode(receipts))
        );
    }

    #[test]
    fn state_nodes_roundtrip() {
        let chain = TestChain::new(1);
        let provider = provider(&chain);
        let root = chain.header(1).unwrap().state_root;
        let node = chain.node(&root).unwrap().clone();
        assert_eq!(provider.write_state_nodes([(&root, &node)]).unwrap(), 1);
        assert!(provider.has_state_node(root).unwrap());
        assert_eq!(provider.state_node(root).unwrap(), Some(node));
    }
}
