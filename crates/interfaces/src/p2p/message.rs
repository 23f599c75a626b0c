use dos_primitives::{Block, BlockBody, BlockNumHash, Bytes, Header, HeadersRequest, Receipt, B256, U256};

/// The eth protocol messages exchanged with full peers.
///
/// The wire encoding is handled by the transport, the synchronisation engine only ever sees the
/// decoded payloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EthMessage {
    /// Request a range of headers.
    GetBlockHeaders(HeadersRequest),
    /// Headers answering a [`EthMessage::GetBlockHeaders`].
    BlockHeaders(Vec<Header>),
    /// Request the bodies of the given blocks.
    GetBlockBodies(Vec<B256>),
    /// Bodies answering a [`EthMessage::GetBlockBodies`], in request order.
    BlockBodies(Vec<BlockBody>),
    /// Request the receipts of the given blocks.
    GetReceipts(Vec<B256>),
    /// Receipts answering a [`EthMessage::GetReceipts`], in request order.
    Receipts(Vec<Vec<Receipt>>),
    /// Request state trie nodes by hash.
    GetNodeData(Vec<B256>),
    /// State trie nodes answering a [`EthMessage::GetNodeData`].
    NodeData(Vec<Bytes>),
    /// Announcement of new blocks by hash.
    NewBlockHashes(Vec<BlockNumHash>),
    /// Propagation of a full block together with the total difficulty of its chain.
    NewBlock {
        /// The propagated block.
        block: Block,
        /// Total difficulty including the block.
        td: U256,
    },
}
