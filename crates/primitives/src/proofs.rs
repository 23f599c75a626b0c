//! Helper function for calculating Merkle proofs and hashes.

use crate::{b256, keccak256, BlockBody, Header, Receipt, B256};
use alloy_rlp::Encodable;
use alloy_trie::{HashBuilder, Nibbles};
use bytes::BytesMut;

/// Keccak-256 hash of the RLP of an empty list, KEC("\xc0").
pub const EMPTY_LIST_HASH: B256 =
    b256!("1dcc4de8dec75d7aab85b567b6ccd41ad312451b948a7413f0a142fd40d49347");

/// Root hash of an empty trie.
pub const EMPTY_ROOT: B256 =
    b256!("56e81f171bcc55a6ff8345e692c0f86e5b48e01b996cadc001622fb5e363b421");

/// Adjust the index of an item for rlp encoding.
pub const fn adjust_index_for_rlp(i: usize, len: usize) -> usize {
    if i > 0x7f {
        i
    } else if i == 0x7f || i + 1 == len {
        0
    } else {
        i + 1
    }
}

/// Compute a trie root of the collection of rlp encodable items.
///
/// Items are keyed by the rlp encoding of their index, the same layout blocks use for their
/// transaction and receipt tries.
pub fn ordered_trie_root<T: Encodable>(items: &[T]) -> B256 {
    let mut index_buffer = BytesMut::new();
    let mut value_buffer = BytesMut::new();

    let mut hb = HashBuilder::default();
    let items_len = items.len();
    for i in 0..items_len {
        let index = adjust_index_for_rlp(i, items_len);

        index_buffer.clear();
        index.encode(&mut index_buffer);

        value_buffer.clear();
        items[index].encode(&mut value_buffer);

        hb.add_leaf(Nibbles::unpack(&index_buffer), &value_buffer);
    }

    hb.root()
}

/// Calculates the root of the transaction trie of a body.
pub fn calculate_transaction_root(body: &BlockBody) -> B256 {
    ordered_trie_root(&body.transactions)
}

/// Calculates the hash of the ommers list.
pub fn calculate_ommers_root(ommers: &[Header]) -> B256 {
    let mut ommers_rlp = Vec::new();
    alloy_rlp::encode_list(ommers, &mut ommers_rlp);
    keccak256(ommers_rlp)
}

/// Calculates the root of the receipt trie.
pub fn calculate_receipt_root(receipts: &[Receipt]) -> B256 {
    ordered_trie_root(receipts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Bytes;

    #[test]
    fn empty_commitments() {
        assert_eq!(ordered_trie_root::<Bytes>(&[]), EMPTY_ROOT);
        assert_eq!(calculate_ommers_root(&[]), EMPTY_LIST_HASH);
        assert_eq!(calculate_receipt_root(&[]), EMPTY_ROOT);
    }

    #[test]
    fn ommers_root_hashes_the_header_list() {
        let ommers = vec![Header { number: 7, ..Default::default() }, Header::default()];
        let root = calculate_ommers_root(&ommers);
        assert_eq!(root, keccak256(alloy_rlp::encode(&ommers)));
        assert_ne!(root, calculate_ommers_root(&ommers[..1]));
        assert_ne!(root, EMPTY_LIST_HASH);
    }

    #[test]
    fn root_depends_on_order() {
        let a = Bytes::from_static(&[1, 2, 3]);
        let b = Bytes::from_static(&[4, 5, 6]);
        let forward = ordered_trie_root(&[a.clone(), b.clone()]);
        let backward = ordered_trie_root(&[b, a]);
        assert_ne!(forward, backward);
        assert_ne!(forward, EMPTY_ROOT);
    }
}
