//! Minimal view into state trie nodes.
//!
//! The synchronisation engine never interprets trie nodes beyond discovering which other nodes
//! they reference by hash, so this module only walks the rlp structure of a node.

use crate::B256;
use alloy_rlp::Header as RlpHeader;

/// Returns the hashes of all nodes referenced by the encoded trie node.
///
/// A reference is any 32 byte string inside the node's list structure. Nodes shorter than 32
/// bytes are embedded into their parent and are walked recursively. A node that is not a list
/// (a raw value) references nothing.
pub fn node_references(data: &[u8]) -> Result<Vec<B256>, alloy_rlp::Error> {
    let mut refs = Vec::new();
    collect_references(data, &mut refs)?;
    Ok(refs)
}

fn collect_references(mut data: &[u8], refs: &mut Vec<B256>) -> Result<(), alloy_rlp::Error> {
    let header = RlpHeader::decode(&mut data)?;
    if !header.list {
        return Ok(())
    }
    if data.len() < header.payload_length {
        return Err(alloy_rlp::Error::InputTooShort)
    }
    let mut payload = &data[..header.payload_length];

    while !payload.is_empty() {
        let item_start = payload;
        let item = RlpHeader::decode(&mut payload)?;
        if payload.len() < item.payload_length {
            return Err(alloy_rlp::Error::InputTooShort)
        }
        let (body, rest) = payload.split_at(item.payload_length);
        if item.list {
            let consumed = item_start.len() - rest.len();
            collect_references(&item_start[..consumed], refs)?;
        } else if body.len() == 32 {
            refs.push(B256::from_slice(body));
        }
        payload = rest;
    }
    Ok(())
}
