//! Requests served by light servers and the checks their answers have to pass.

use dos_peers::RequestKind;
use dos_primitives::{
    keccak256, proofs::calculate_receipt_root, BlockBody, BlockHash, BlockHashOrNumber,
    BlockNumber, Bytes, Header, HeadersRequest, Receipt, SealedHeader, B256,
};
use thiserror::Error;

/// A piece of chain data requested from a light server.
///
/// Every variant except a by-number header request carries enough information to verify the
/// answer without trusting the server.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LightRequest {
    /// A run of headers.
    Headers(HeadersRequest),
    /// The body of a block whose header is known.
    Body {
        /// Header the body has to match.
        header: SealedHeader,
    },
    /// The receipts of a block whose header is known.
    Receipts {
        /// Header the receipts have to match.
        header: SealedHeader,
    },
    /// A state trie node.
    TrieNode {
        /// Hash of the node.
        hash: B256,
    },
    /// Contract code.
    Code {
        /// Hash of the code.
        hash: B256,
    },
}

impl LightRequest {
    /// A single header by hash.
    pub fn header_by_hash(hash: BlockHash) -> Self {
        Self::Headers(HeadersRequest::rising(hash, 1))
    }

    /// A single header by number.
    pub fn header_by_number(number: BlockNumber) -> Self {
        Self::Headers(HeadersRequest::rising(number, 1))
    }

    /// The capability a server needs to answer the request.
    pub const fn kind(&self) -> RequestKind {
        match self {
            Self::Headers(_) => RequestKind::Headers,
            Self::Body { .. } => RequestKind::Bodies,
            Self::Receipts { .. } => RequestKind::Receipts,
            Self::TrieNode { .. } | Self::Code { .. } => RequestKind::NodeData,
        }
    }

    /// Number of items the request asks for, used to estimate its service time.
    pub fn amount(&self) -> usize {
        match self {
            Self::Headers(request) => request.limit.max(1) as usize,
            _ => 1,
        }
    }

    /// The block the request is about, if any.
    pub fn block_number(&self) -> Option<BlockNumber> {
        match self {
            Self::Headers(request) => match request.start {
                BlockHashOrNumber::Number(number) => Some(number),
                BlockHashOrNumber::Hash(_) => None,
            },
            Self::Body { header } | Self::Receipts { header } => Some(header.number),
            Self::TrieNode { .. } | Self::Code { .. } => None,
        }
    }

    /// Checks that `payload` is a valid answer to the request.
    pub fn validate(&self, payload: &LightPayload) -> Result<(), ValidationError> {
        match (self, payload) {
            (Self::Headers(request), LightPayload::Headers(headers)) => {
                validate_headers(request, headers)
            }
            (Self::Body { header }, LightPayload::Body(body)) => {
                if body.matches(header.header()) {
                    Ok(())
                } else {
                    Err(ValidationError::BodyMismatch { number: header.number })
                }
            }
            (Self::Receipts { header }, LightPayload::Receipts(receipts)) => {
                let got = calculate_receipt_root(receipts);
                if got == header.receipts_root {
                    Ok(())
                } else {
                    Err(ValidationError::ReceiptRootMismatch {
                        number: header.number,
                        expected: header.receipts_root,
                        got,
                    })
                }
            }
            (Self::TrieNode { hash }, LightPayload::TrieNode(data)) |
            (Self::Code { hash }, LightPayload::Code(data)) => {
                let got = keccak256(data);
                if got == *hash {
                    Ok(())
                } else {
                    Err(ValidationError::HashMismatch { expected: *hash, got })
                }
            }
            _ => Err(ValidationError::KindMismatch { expected: self.kind() }),
        }
    }
}

fn validate_headers(request: &HeadersRequest, headers: &[Header]) -> Result<(), ValidationError> {
    let Some(first) = headers.first() else { return Err(ValidationError::Empty) };
    if headers.len() as u64 > request.limit {
        return Err(ValidationError::TooManyHeaders { limit: request.limit, got: headers.len() })
    }
    match request.start {
        BlockHashOrNumber::Hash(hash) => {
            let got = first.hash_slow();
            if got != hash {
                return Err(ValidationError::HashMismatch { expected: hash, got })
            }
        }
        BlockHashOrNumber::Number(number) => {
            if first.number != number {
                return Err(ValidationError::WrongStart { expected: number, got: first.number })
            }
        }
    }

    let step = request.skip + 1;
    for pair in headers.windows(2) {
        let (prev, next) = (&pair[0], &pair[1]);
        let expected = if request.direction.is_rising() {
            prev.number.checked_add(step)
        } else {
            prev.number.checked_sub(step)
        };
        if expected != Some(next.number) {
            return Err(ValidationError::UnlinkedHeaders { number: next.number })
        }
        // consecutive headers must hash-link
        if request.skip == 0 {
            let linked = if request.direction.is_rising() {
                next.parent_hash == prev.hash_slow()
            } else {
                prev.parent_hash == next.hash_slow()
            };
            if !linked {
                return Err(ValidationError::UnlinkedHeaders { number: next.number })
            }
        }
    }
    Ok(())
}

/// The data carried by a [`LightResponse`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LightPayload {
    /// Headers in the order requested.
    Headers(Vec<Header>),
    /// A block body.
    Body(BlockBody),
    /// The receipts of one block.
    Receipts(Vec<Receipt>),
    /// A state trie node.
    TrieNode(Bytes),
    /// Contract code.
    Code(Bytes),
}

/// An answer of a light server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LightResponse {
    /// Id of the request this answers.
    pub request_id: u64,
    /// Request cost the server charged for the answer.
    pub buffer_value: u64,
    /// The data.
    pub payload: LightPayload,
}

/// Why an answer was rejected.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum ValidationError {
    #[error("answer does not match a {expected} request")]
    KindMismatch { expected: RequestKind },
    #[error("empty answer")]
    Empty,
    #[error("requested at most {limit} headers, got {got}")]
    TooManyHeaders { limit: u64, got: usize },
    #[error("first header is {got}, requested {expected}")]
    WrongStart { expected: BlockNumber, got: BlockNumber },
    #[error("header {number} does not follow its predecessor")]
    UnlinkedHeaders { number: BlockNumber },
    #[error("hash mismatch: expected {expected}, got {got}")]
    HashMismatch { expected: B256, got: B256 },
    #[error("body does not match header {number}")]
    BodyMismatch { number: BlockNumber },
    #[error("receipt root mismatch in block {number}: expected {expected}, got {got}")]
    ReceiptRootMismatch { number: BlockNumber, expected: B256, got: B256 },
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use dos_interfaces::test_utils::TestChain;

    #[test]
    fn trie_node_must_hash_to_key() {
        let node = Bytes::from_static(b"node");
        let request = LightRequest::TrieNode { hash: keccak256(&node) };
        assert_eq!(request.validate(&LightPayload::TrieNode(node)), Ok(()));
        assert_matches!(
            request.validate(&LightPayload::TrieNode(Bytes::from_static(b"other"))),
            Err(ValidationError::HashMismatch { .. })
        );
        assert_matches!(
            request.validate(&LightPayload::Code(Bytes::from_static(b"node"))),
            Err(ValidationError::KindMismatch { expected: RequestKind::NodeData })
        );
    }

    #[test]
    fn body_and_receipts_are_checked_against_header() {
        let chain = TestChain::new(10);
        let block = chain.block(7).unwrap();
        let request = LightRequest::Body { header: block.header.clone() };
        assert_eq!(request.validate(&LightPayload::Body(block.body.clone())), Ok(()));
        let other = chain.block(8).unwrap().body.clone();
        assert_matches!(
            request.validate(&LightPayload::Body(other)),
            Err(ValidationError::BodyMismatch { number: 7 })
        );

        let request = LightRequest::Receipts { header: block.header.clone() };
        let receipts = chain.receipts(7).unwrap().clone();
        assert_eq!(request.validate(&LightPayload::Receipts(receipts)), Ok(()));
        let wrong = chain.receipts(8).unwrap().clone();
        assert_matches!(
            request.validate(&LightPayload::Receipts(wrong)),
            Err(ValidationError::ReceiptRootMismatch { number: 7, .. })
        );
    }

    #[test]
    fn headers_must_start_right_and_link() {
        let chain = TestChain::new(10);
        let request = HeadersRequest::rising(3u64, 4);
        let headers = chain.answer_headers(&request);
        assert_eq!(LightRequest::Headers(request.clone()).validate(&LightPayload::Headers(headers.clone())), Ok(()));

        let mut broken = headers.clone();
        broken[2].parent_hash = B256::repeat_byte(0xee);
        assert_matches!(
            LightRequest::Headers(request.clone()).validate(&LightPayload::Headers(broken)),
            Err(ValidationError::UnlinkedHeaders { number: 5 })
        );

        let shifted = chain.answer_headers(&HeadersRequest::rising(4u64, 4));
        assert_matches!(
            LightRequest::Headers(request).validate(&LightPayload::Headers(shifted)),
            Err(ValidationError::WrongStart { expected: 3, got: 4 })
        );

        let hash = chain.header(5).unwrap().hash();
        let request = LightRequest::header_by_hash(hash);
        let wrong = vec![chain.header(6).unwrap().header().clone()];
        assert_matches!(
            request.validate(&LightPayload::Headers(wrong)),
            Err(ValidationError::HashMismatch { expected, .. }) if expected == hash
        );
        assert_matches!(
            request.validate(&LightPayload::Headers(Vec::new())),
            Err(ValidationError::Empty)
        );
    }
}
