use crate::{
    request::{LightPayload, LightRequest},
    retrieve::{RetrieveError, RetrieveManager},
};
use dos_interfaces::provider::ProviderError;
use dos_peers::RequestKind;
use dos_primitives::{BlockBody, BlockHash, BlockNumber, Bytes, Receipt, SealedHeader, B256};
use dos_provider::ChainProvider;
use thiserror::Error;
use tracing::debug;

/// Errors of on-demand retrieval.
#[derive(Debug, Error)]
pub enum OdrError {
    /// The data could not be retrieved from the network.
    #[error(transparent)]
    Retrieve(#[from] RetrieveError),
    /// The local store failed.
    #[error(transparent)]
    Provider(#[from] ProviderError),
    /// A validated answer carried no data of the requested kind.
    #[error("answer carries no {0}")]
    UnexpectedPayload(RequestKind),
}

/// On-demand access to chain data.
///
/// Lookups consult the local store first. Missing data is retrieved from light servers,
/// verified and written to the local store, so the next lookup is served locally.
///
/// Headers retrieved by number cannot be verified against anything local and are stored
/// without becoming canonical.
#[derive(Debug, Clone)]
pub struct LightOdr {
    provider: ChainProvider,
    retriever: RetrieveManager,
}

impl LightOdr {
    /// Creates a new instance.
    pub fn new(provider: ChainProvider, retriever: RetrieveManager) -> Self {
        Self { provider, retriever }
    }

    /// The local store.
    pub fn provider(&self) -> &ChainProvider {
        &self.provider
    }

    /// The header with the given number.
    pub async fn header_by_number(&self, number: BlockNumber) -> Result<SealedHeader, OdrError> {
        if let Some(header) = self.provider.header_by_number(number)? {
            return Ok(header)
        }
        let header = self.fetch_header(LightRequest::header_by_number(number)).await?;
        debug!(target: "les::odr", number, hash = %header.hash(), "Retrieved header by number");
        Ok(header)
    }

    /// The header with the given hash.
    pub async fn header_by_hash(&self, hash: BlockHash) -> Result<SealedHeader, OdrError> {
        if let Some(header) = self.provider.header_by_hash(hash)? {
            return Ok(header)
        }
        let header = self.fetch_header(LightRequest::header_by_hash(hash)).await?;
        debug!(target: "les::odr", number = header.number, %hash, "Retrieved header");
        Ok(header)
    }

    async fn fetch_header(&self, request: LightRequest) -> Result<SealedHeader, OdrError> {
        let response = self.retriever.retrieve(request).await?;
        let LightPayload::Headers(headers) = response.payload else {
            return Err(OdrError::UnexpectedPayload(RequestKind::Headers))
        };
        let header = headers
            .into_iter()
            .next()
            .ok_or(OdrError::UnexpectedPayload(RequestKind::Headers))?
            .seal_slow();
        self.provider.write_header(&header)?;
        Ok(header)
    }

    /// The body of the block with the given hash.
    pub async fn block_body(&self, hash: BlockHash) -> Result<BlockBody, OdrError> {
        let header = self.header_by_hash(hash).await?;
        if header.is_empty_body() {
            return Ok(BlockBody::default())
        }
        if let Some(body) = self.provider.body(header.number, hash)? {
            return Ok(body)
        }
        let number = header.number;
        let response = self.retriever.retrieve(LightRequest::Body { header }).await?;
        let LightPayload::Body(body) = response.payload else {
            return Err(OdrError::UnexpectedPayload(RequestKind::Bodies))
        };
        self.provider.write_body(number, hash, &body)?;
        debug!(target: "les::odr", number, %hash, "Retrieved body");
        Ok(body)
    }

    /// The receipts of the block with the given hash.
    pub async fn receipts(&self, hash: BlockHash) -> Result<Vec<Receipt>, OdrError> {
        let header = self.header_by_hash(hash).await?;
        if header.is_empty_receipts() {
            return Ok(Vec::new())
        }
        if let Some(receipts) = self.provider.receipts(header.number, hash)? {
            return Ok(receipts)
        }
        let number = header.number;
        let response = self.retriever.retrieve(LightRequest::Receipts { header }).await?;
        let LightPayload::Receipts(receipts) = response.payload else {
            return Err(OdrError::UnexpectedPayload(RequestKind::Receipts))
        };
        self.provider.write_receipts(number, hash, &receipts)?;
        debug!(target: "les::odr", number, %hash, count = receipts.len(), "Retrieved receipts");
        Ok(receipts)
    }

    /// The state trie node with the given hash.
    pub async fn trie_node(&self, hash: B256) -> Result<Bytes, OdrError> {
        if let Some(node) = self.provider.state_node(hash)? {
            return Ok(node)
        }
        let response = self.retriever.retrieve(LightRequest::TrieNode { hash }).await?;
        let LightPayload::TrieNode(node) = response.payload else {
            return Err(OdrError::UnexpectedPayload(RequestKind::NodeData))
        };
        self.provider.write_state_nodes([(&hash, &node)])?;
        debug!(target: "les::odr", %hash, "Retrieved trie node");
        Ok(node)
    }

    /// The contract code with the given hash.
    pub async fn code(&self, hash: B256) -> Result<Bytes, OdrError> {
        if let Some(code) = self.provider.code(hash)? {
            return Ok(code)
        }
        let response = self.retriever.retrieve(LightRequest::Code { hash }).await?;
        let LightPayload::Code(code) = response.payload else {
            return Err(OdrError::UnexpectedPayload(RequestKind::NodeData))
        };
        self.provider.write_code(hash, &code)?;
        debug!(target: "les::odr", %hash, len = code.len(), "Retrieved code");
        Ok(code)
    }
}
