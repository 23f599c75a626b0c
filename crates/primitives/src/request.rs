use crate::{BlockHash, BlockNumber, B256};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Either a block hash _or_ a block number
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BlockHashOrNumber {
    /// A block hash
    Hash(B256),
    /// A block number
    Number(u64),
}

impl From<B256> for BlockHashOrNumber {
    fn from(value: B256) -> Self {
        Self::Hash(value)
    }
}

impl From<u64> for BlockHashOrNumber {
    fn from(value: u64) -> Self {
        Self::Number(value)
    }
}

impl fmt::Display for BlockHashOrNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Hash(hash) => write!(f, "{hash}"),
            Self::Number(num) => write!(f, "{num}"),
        }
    }
}

/// A block number and hash pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct BlockNumHash {
    /// Block number
    pub number: BlockNumber,
    /// Block hash
    pub hash: BlockHash,
}

impl BlockNumHash {
    /// Creates a new `BlockNumHash` from a block number and hash.
    pub const fn new(number: BlockNumber, hash: BlockHash) -> Self {
        Self { number, hash }
    }
}

/// Represents the direction for a headers request depending on the `reverse` field of the
/// request.
///
/// See also <https://github.com/ethereum/devp2p/blob/master/caps/eth.md#getblockheaders-0x03>
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum HeadersDirection {
    /// Rising block number.
    #[default]
    Rising,
    /// Falling block number.
    Falling,
}

impl HeadersDirection {
    /// Returns true for rising block numbers
    pub const fn is_rising(&self) -> bool {
        matches!(self, Self::Rising)
    }

    /// Converts the bool into a direction.
    ///
    /// Returns:
    ///
    /// [`HeadersDirection::Rising`] block numbers for `reverse == false`
    /// [`HeadersDirection::Falling`] block numbers for `reverse == true`
    pub const fn new(reverse: bool) -> Self {
        if reverse {
            Self::Falling
        } else {
            Self::Rising
        }
    }
}

/// The header request struct to be sent to connected peers, which
/// will proceed to ask them to stream the requested headers to us.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct HeadersRequest {
    /// The starting block
    pub start: BlockHashOrNumber,
    /// The response max size
    pub limit: u64,
    /// The number of blocks to skip between consecutive headers
    pub skip: u64,
    /// The direction in which headers should be returned.
    pub direction: HeadersDirection,
}

impl HeadersRequest {
    /// Requests `limit` consecutive headers in rising order starting at `start`.
    pub fn rising(start: impl Into<BlockHashOrNumber>, limit: u64) -> Self {
        Self { start: start.into(), limit, skip: 0, direction: HeadersDirection::Rising }
    }

    /// Requests `limit` headers `skip` apart in rising order starting at `start`.
    pub fn skipping(start: impl Into<BlockHashOrNumber>, limit: u64, skip: u64) -> Self {
        Self { start: start.into(), limit, skip, direction: HeadersDirection::Rising }
    }

    /// Returns the block numbers a compliant peer answers with, if the start is a number.
    pub fn expected_numbers(&self) -> Option<Vec<BlockNumber>> {
        let BlockHashOrNumber::Number(start) = self.start else { return None };
        let step = self.skip + 1;
        let mut numbers = Vec::with_capacity(self.limit as usize);
        for i in 0..self.limit {
            let number = if self.direction.is_rising() {
                start.checked_add(i * step)
            } else {
                start.checked_sub(i * step)
            };
            match number {
                Some(number) => numbers.push(number),
                None => break,
            }
        }
        Some(numbers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expected_numbers_of_skeleton_request() {
        let request = HeadersRequest::skipping(191u64, 3, 191);
        assert_eq!(request.expected_numbers(), Some(vec![191, 383, 575]));

        let request = HeadersRequest {
            start: 2u64.into(),
            limit: 5,
            skip: 0,
            direction: HeadersDirection::Falling,
        };
        assert_eq!(request.expected_numbers(), Some(vec![2, 1, 0]));

        assert_eq!(HeadersRequest::rising(B256::ZERO, 1).expected_numbers(), None);
    }
}
