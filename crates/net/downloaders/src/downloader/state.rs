//! Scheduling of the state trie download at the pivot block.

use crate::queue::{Delivered, FetchQueue, QueueError};
use dos_interfaces::provider::{ProviderError, ProviderResult};
use dos_peers::RequestKind;
use dos_primitives::{keccak256, trie::node_references, Bytes, PeerId, B256};
use dos_provider::ChainProvider;
use std::collections::{HashMap, HashSet};
use tracing::trace;

/// A downloaded node whose children are not all stored yet.
#[derive(Debug)]
struct PendingNode {
    data: Bytes,
    missing: usize,
}

/// Downloads the trie below one state root.
///
/// Nodes are requested by hash. A node is written to storage only once all nodes it references
/// are stored, so an interrupted download never leaves a node whose subtrie is incomplete. A
/// hash referenced by several parents is requested once.
#[derive(Debug)]
pub(crate) struct StateSync {
    root: B256,
    queue: FetchQueue<B256, Bytes>,
    pending: HashMap<B256, PendingNode>,
    /// Child hash to the parents waiting for it.
    parents: HashMap<B256, Vec<B256>>,
    /// Hashes scheduled, in flight or pending, but not stored.
    tracked: HashSet<B256>,
    pulled: u64,
    committed: u64,
    done: bool,
}

impl StateSync {
    pub(crate) fn new(root: B256, provider: &ChainProvider) -> ProviderResult<Self> {
        let mut sync = Self {
            root,
            queue: FetchQueue::new(RequestKind::NodeData),
            pending: HashMap::new(),
            parents: HashMap::new(),
            tracked: HashSet::new(),
            pulled: 0,
            committed: 0,
            done: false,
        };
        if provider.has_state_node(root)? {
            sync.done = true;
        } else {
            sync.tracked.insert(root);
            sync.queue.schedule([root]);
        }
        Ok(sync)
    }

    pub(crate) const fn root(&self) -> B256 {
        self.root
    }

    pub(crate) const fn is_complete(&self) -> bool {
        self.done
    }

    pub(crate) fn queue(&self) -> &FetchQueue<B256, Bytes> {
        &self.queue
    }

    pub(crate) fn queue_mut(&mut self) -> &mut FetchQueue<B256, Bytes> {
        &mut self.queue
    }

    /// Nodes downloaded so far.
    pub(crate) const fn pulled(&self) -> u64 {
        self.pulled
    }

    /// Nodes known to be part of the trie.
    pub(crate) fn known(&self) -> u64 {
        self.committed + self.tracked.len() as u64
    }

    /// Matches delivered nodes to the peer's request by their hash.
    pub(crate) fn deliver(
        &mut self,
        peer_id: PeerId,
        nodes: Vec<Bytes>,
    ) -> Result<Delivered<B256>, QueueError> {
        self.queue.deliver_keyed(peer_id, nodes.into_iter().map(|node| (keccak256(&node), node)))
    }

    /// Expands arrived nodes and stores every node whose subtrie is complete.
    ///
    /// Returns the number of nodes written.
    pub(crate) fn process(&mut self, provider: &ChainProvider) -> ProviderResult<usize> {
        let mut writes: Vec<(B256, Bytes)> = Vec::new();
        let mut written: HashSet<B256> = HashSet::new();
        for (hash, data) in self.queue.drain_arrived() {
            self.pulled += 1;
            let children = node_references(&data)
                .map_err(|error| ProviderError::Decode { what: "state node", error })?;
            let mut missing = 0;
            for child in children {
                if self.tracked.contains(&child) {
                    self.parents.entry(child).or_default().push(hash);
                    missing += 1;
                    continue
                }
                if written.contains(&child) || provider.has_state_node(child)? {
                    continue
                }
                self.tracked.insert(child);
                self.queue.schedule([child]);
                self.parents.entry(child).or_default().push(hash);
                missing += 1;
            }
            if missing == 0 {
                self.commit(hash, data, &mut writes, &mut written);
            } else {
                self.pending.insert(hash, PendingNode { data, missing });
            }
        }
        if writes.is_empty() {
            return Ok(0)
        }
        let count = provider.write_state_nodes(writes.iter().map(|(hash, node)| (hash, node)))?;
        trace!(target: "sync::downloader", count, pulled = self.pulled, known = self.known(), "Committed state nodes");
        Ok(count)
    }

    /// Queues the node and every parent it completes, children first.
    fn commit(
        &mut self,
        hash: B256,
        data: Bytes,
        writes: &mut Vec<(B256, Bytes)>,
        written: &mut HashSet<B256>,
    ) {
        let mut stack = vec![(hash, data)];
        while let Some((hash, data)) = stack.pop() {
            self.tracked.remove(&hash);
            self.committed += 1;
            written.insert(hash);
            writes.push((hash, data));
            if hash == self.root {
                self.done = true;
            }
            for parent in self.parents.remove(&hash).unwrap_or_default() {
                let Some(node) = self.pending.get_mut(&parent) else { continue };
                node.missing -= 1;
                if node.missing == 0 {
                    if let Some(node) = self.pending.remove(&parent) {
                        stack.push((parent, node.data));
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dos_interfaces::{
        db::MemoryDatabase,
        test_utils::generators::{encode_node, state_trie},
    };
    use std::{sync::Arc, time::Duration};

    fn provider() -> ChainProvider {
        ChainProvider::new(Arc::new(MemoryDatabase::new()))
    }

    /// Serves every request of the scheduler from the given nodes until it completes.
    fn serve(sync: &mut StateSync, nodes: &HashMap<B256, Bytes>, provider: &ChainProvider) -> usize {
        let peer = PeerId::repeat_byte(1);
        let mut requested = 0;
        while let Some(request) = sync.queue_mut().reserve(peer, 384, Duration::from_secs(1)) {
            requested += request.keys.len();
            let answer = request.keys.iter().filter_map(|hash| nodes.get(hash).cloned()).collect();
            sync.deliver(peer, answer).unwrap();
            sync.process(provider).unwrap();
        }
        requested
    }

    #[test]
    fn downloads_trie_bottom_up() {
        let mut nodes = HashMap::new();
        let root = state_trie(&mut nodes, 7, 0);
        let provider = provider();
        let mut sync = StateSync::new(root, &provider).unwrap();
        assert!(!sync.is_complete());

        let requested = serve(&mut sync, &nodes, &provider);
        assert!(sync.is_complete());
        assert_eq!(requested, nodes.len());
        for hash in nodes.keys() {
            assert!(provider.has_state_node(*hash).unwrap());
        }
        assert_eq!(sync.pulled(), nodes.len() as u64);
    }

    #[test]
    fn shared_subtries_are_fetched_once() {
        let mut nodes = HashMap::new();
        let first = state_trie(&mut nodes, 1, 0);
        let second = state_trie(&mut nodes, 2, 0);
        let provider = provider();

        let mut sync = StateSync::new(first, &provider).unwrap();
        serve(&mut sync, &nodes, &provider);

        // only the new root is missing
        let mut sync = StateSync::new(second, &provider).unwrap();
        assert_eq!(serve(&mut sync, &nodes, &provider), 1);
        assert!(sync.is_complete());
    }

    #[test]
    fn duplicate_references_are_requested_once() {
        let mut nodes = HashMap::new();
        let leaf = encode_node(&[], b"leaf");
        let leaf_hash = keccak256(&leaf);
        nodes.insert(leaf_hash, leaf);
        let left = encode_node(&[leaf_hash], b"left");
        let right = encode_node(&[leaf_hash], b"right");
        let (left_hash, right_hash) = (keccak256(&left), keccak256(&right));
        nodes.insert(left_hash, left);
        nodes.insert(right_hash, right);
        let root = encode_node(&[left_hash, right_hash], &[]);
        let root_hash = keccak256(&root);
        nodes.insert(root_hash, root);

        let provider = provider();
        let mut sync = StateSync::new(root_hash, &provider).unwrap();
        assert_eq!(serve(&mut sync, &nodes, &provider), 4);
        assert!(sync.is_complete());
    }

    #[test]
    fn parent_is_not_stored_before_children() {
        let mut nodes = HashMap::new();
        let root = state_trie(&mut nodes, 3, 0);
        let provider = provider();
        let mut sync = StateSync::new(root, &provider).unwrap();
        let peer = PeerId::repeat_byte(2);

        // deliver only the root
        let request = sync.queue_mut().reserve(peer, 384, Duration::from_secs(1)).unwrap();
        sync.deliver(peer, vec![nodes[&request.keys[0]].clone()]).unwrap();
        assert_eq!(sync.process(&provider).unwrap(), 0);
        assert!(!provider.has_state_node(root).unwrap());
        assert!(sync.known() > 1);
    }
}
