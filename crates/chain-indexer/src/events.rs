use crate::indexer::IndexerError;
use dos_primitives::{BlockNumber, SealedHeader};
use dos_provider::ChainProvider;
use std::time::Duration;
use tokio::{
    sync::mpsc::UnboundedSender,
    time::{interval, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// A change of the canonical head.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainEvent {
    /// The chain was extended up to the block.
    Head(BlockNumber),
    /// The chain switched to another branch.
    Reorg {
        /// Last block shared by both branches.
        ancestor: BlockNumber,
        /// The new head.
        head: BlockNumber,
    },
}

/// Turns changes of the stored canonical head into [`ChainEvent`]s.
#[derive(Debug)]
pub struct HeadWatcher {
    provider: ChainProvider,
    poll_interval: Duration,
    last: Option<SealedHeader>,
}

impl HeadWatcher {
    /// Creates a watcher polling the provider at the given interval.
    pub fn new(provider: ChainProvider, poll_interval: Duration) -> Self {
        Self { provider, poll_interval, last: None }
    }

    /// Compares the current head with the last one seen.
    pub fn poll(&mut self) -> Result<Option<ChainEvent>, IndexerError> {
        let head = self.provider.head_header()?;
        let event = match &self.last {
            Some(last) if last.hash() == head.hash() => return Ok(None),
            Some(last) if self.provider.canonical_hash(last.number)? != Some(last.hash()) => {
                ChainEvent::Reorg { ancestor: self.common_ancestor(last)?, head: head.number }
            }
            _ => ChainEvent::Head(head.number),
        };
        trace!(target: "chain::indexer::watcher", ?event, hash = %head.hash(), "Head changed");
        self.last = Some(head);
        Ok(Some(event))
    }

    /// Walks back from a header that left the canonical chain until it meets it again.
    fn common_ancestor(&self, header: &SealedHeader) -> Result<BlockNumber, IndexerError> {
        let (mut number, mut hash) = (header.number, header.hash());
        while number > 0 && self.provider.canonical_hash(number)? != Some(hash) {
            let header =
                self.provider.header(number, hash)?.ok_or(IndexerError::MissingHeader { number })?;
            hash = header.parent_hash;
            number -= 1;
        }
        Ok(number)
    }

    /// Sends an event for every head change until cancelled or the receiver is gone.
    pub async fn run(mut self, events: UnboundedSender<ChainEvent>, cancel: CancellationToken) {
        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            match self.poll() {
                Ok(Some(event)) => {
                    if events.send(event).is_err() {
                        break
                    }
                }
                Ok(None) => {}
                Err(error) => {
                    warn!(target: "chain::indexer::watcher", %error, "Failed to read the chain head")
                }
            }
        }
        debug!(target: "chain::indexer::watcher", "Head watcher stopped");
    }
}
