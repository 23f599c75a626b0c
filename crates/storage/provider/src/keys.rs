//! Database key schema of the chain.
//!
//! All chain data lives in a single ordered key space. Keys of per-block data start with a one
//! byte prefix followed by the big endian block number, so range scans walk blocks in order.

use dos_primitives::{BlockNumber, B256};

/// Key of the hash of the latest known header.
pub const HEAD_HEADER_KEY: &[u8] = b"LastHeader";
/// Key of the hash of the latest full block.
pub const HEAD_BLOCK_KEY: &[u8] = b"LastBlock";
/// Key of the hash of the latest block imported by fast synchronisation.
pub const HEAD_FAST_BLOCK_KEY: &[u8] = b"LastFast";

const HEADER_PREFIX: u8 = b'h';
const TD_SUFFIX: u8 = b't';
const CANONICAL_SUFFIX: u8 = b'n';
const NUMBER_PREFIX: u8 = b'H';
const BODY_PREFIX: u8 = b'b';
const RECEIPTS_PREFIX: u8 = b'r';
const CODE_PREFIX: u8 = b'c';

fn block_key(prefix: u8, number: BlockNumber, hash: B256) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + 8 + 32 + 1);
    key.push(prefix);
    key.extend_from_slice(&number.to_be_bytes());
    key.extend_from_slice(hash.as_slice());
    key
}

/// `h | num | hash`
pub fn header_key(number: BlockNumber, hash: B256) -> Vec<u8> {
    block_key(HEADER_PREFIX, number, hash)
}

/// `h | num | hash | t`
pub fn td_key(number: BlockNumber, hash: B256) -> Vec<u8> {
    let mut key = header_key(number, hash);
    key.push(TD_SUFFIX);
    key
}

/// `h | num | n`
pub fn canonical_key(number: BlockNumber) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + 8 + 1);
    key.push(HEADER_PREFIX);
    key.extend_from_slice(&number.to_be_bytes());
    key.push(CANONICAL_SUFFIX);
    key
}

/// `H | hash`
pub fn number_key(hash: B256) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + 32);
    key.push(NUMBER_PREFIX);
    key.extend_from_slice(hash.as_slice());
    key
}

/// `b | num | hash`
pub fn body_key(number: BlockNumber, hash: B256) -> Vec<u8> {
    block_key(BODY_PREFIX, number, hash)
}

/// `r | num | hash`
pub fn receipts_key(number: BlockNumber, hash: B256) -> Vec<u8> {
    block_key(RECEIPTS_PREFIX, number, hash)
}

/// `c | hash`
pub fn code_key(hash: B256) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + 32);
    key.push(CODE_PREFIX);
    key.extend_from_slice(hash.as_slice());
    key
}

/// State trie nodes are stored under their raw hash.
pub fn state_node_key(hash: B256) -> Vec<u8> {
    hash.to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_do_not_collide() {
        let hash = B256::repeat_byte(0x11);
        let keys = [
            header_key(1, hash),
            td_key(1, hash),
            canonical_key(1),
            number_key(hash),
            body_key(1, hash),
            receipts_key(1, hash),
            code_key(hash),
            state_node_key(hash),
        ];
        for (i, a) in keys.iter().enumerate() {
            for b in &keys[i + 1..] {
                assert_ne!(a, b);
            }
        }
        assert!(header_key(1, hash) < header_key(2, B256::ZERO));
    }
}
