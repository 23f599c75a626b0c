use crate::{events::ChainEvent, metrics::IndexerMetrics};
use dos_interfaces::{db::DatabaseError, provider::ProviderError};
use dos_metrics::SharedMetrics;
use dos_primitives::{BlockNumber, SealedHeader, B256};
use dos_provider::ChainProvider;
use parking_lot::Mutex;
use std::{fmt::Debug, sync::Arc};
use thiserror::Error;
use tokio::{
    sync::{mpsc::UnboundedReceiver, Notify},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Errors of section processing.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IndexerError {
    /// Reading the chain failed.
    #[error(transparent)]
    Provider(#[from] ProviderError),
    /// Reading or writing index data failed.
    #[error(transparent)]
    Database(#[from] DatabaseError),
    /// A canonical header of the section is not stored.
    #[error("canonical header {number} is missing")]
    MissingHeader {
        /// Number of the missing header.
        number: BlockNumber,
    },
    /// The canonical chain changed while the section was read.
    #[error("chain reorged at block {number} during section processing")]
    Reorged {
        /// First header that does not link to its predecessor.
        number: BlockNumber,
    },
    /// The head of a finished section is not stored.
    #[error("head of section {section} is missing")]
    MissingSectionHead {
        /// The section.
        section: u64,
    },
    /// The section size is zero or unsupported by the backend.
    #[error("invalid section size {0}")]
    InvalidSectionSize(u64),
}

/// Processes the headers of one section at a time.
///
/// Calls for a section always come as one `reset`, the headers of the section in ascending
/// order via `process`, then `commit`. A failed section is started over with another `reset`.
pub trait ChainIndexerBackend: Debug + Send {
    /// Starts a new section. `prev_head` is the last header hash of the previous section, zero
    /// for the first section.
    fn reset(&mut self, section: u64, prev_head: B256) -> Result<(), IndexerError>;

    /// Adds the next header of the section.
    fn process(&mut self, header: &SealedHeader) -> Result<(), IndexerError>;

    /// Persists the finished section.
    fn commit(&mut self) -> Result<(), IndexerError>;
}

/// Progress of a [`ChainIndexer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionsInfo {
    /// Number of finished sections.
    pub count: u64,
    /// Number of the last header of the last finished section.
    pub last_head_number: Option<BlockNumber>,
    /// Hash of the last header of the last finished section.
    pub processed_head: Option<B256>,
}

#[derive(Debug, Default)]
struct SectionState {
    /// Sections processed and persisted.
    stored: u64,
    /// Sections with enough confirmations.
    known: u64,
}

#[derive(Debug)]
struct IndexerInner {
    name: String,
    provider: ChainProvider,
    backend: Mutex<Box<dyn ChainIndexerBackend>>,
    section_size: u64,
    confirms: u64,
    state: Mutex<SectionState>,
    children: Mutex<Vec<ChainIndexer>>,
    running: Mutex<Option<CancellationToken>>,
    update: Notify,
    metrics: IndexerMetrics,
}

/// Runs a [`ChainIndexerBackend`] over every confirmed section of the canonical chain.
///
/// Section `i` covers blocks `i * size..(i + 1) * size` and is processed once the head is at
/// least `(i + 1) * size + confirms`. Finished sections are persisted under the indexer name,
/// so a restarted indexer continues where it left off.
#[derive(Debug, Clone)]
pub struct ChainIndexer {
    inner: Arc<IndexerInner>,
}

impl ChainIndexer {
    /// Creates an indexer and restores its progress.
    ///
    /// Finished sections whose last header is no longer canonical are rolled back.
    pub fn new(
        provider: ChainProvider,
        backend: Box<dyn ChainIndexerBackend>,
        name: impl Into<String>,
        section_size: u64,
        confirms: u64,
        metrics: SharedMetrics,
    ) -> Result<Self, IndexerError> {
        if section_size == 0 {
            return Err(IndexerError::InvalidSectionSize(section_size))
        }
        let inner = IndexerInner {
            name: name.into(),
            provider,
            backend: Mutex::new(backend),
            section_size,
            confirms,
            state: Mutex::default(),
            children: Mutex::default(),
            running: Mutex::default(),
            update: Notify::new(),
            metrics: IndexerMetrics::new(metrics),
        };
        let indexer = Self { inner: Arc::new(inner) };
        indexer.restore()?;
        Ok(indexer)
    }

    fn restore(&self) -> Result<(), IndexerError> {
        let stored = self.stored_count()?;
        let mut valid = stored;
        while valid > 0 {
            let last = valid * self.inner.section_size - 1;
            let head = self.section_head(valid - 1)?;
            if head.is_some() && self.inner.provider.canonical_hash(last)? == head {
                break
            }
            valid -= 1;
        }
        let mut state = self.inner.state.lock();
        state.stored = stored;
        if valid < stored {
            warn!(target: "chain::indexer", name = %self.inner.name, stored, valid, "Rolled back stale sections");
            self.set_valid_sections(&mut state, valid)?;
        } else {
            self.inner.metrics.set_stored(valid);
        }
        state.known = valid;
        debug!(target: "chain::indexer", name = %self.inner.name, sections = valid, "Restored indexer");
        Ok(())
    }

    /// Name of the indexer.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Number of blocks per section.
    pub fn section_size(&self) -> u64 {
        self.inner.section_size
    }

    /// Notifies the indexer about a new canonical head.
    ///
    /// With `reorg` set, `head` is the last block shared with the previous canonical chain and
    /// every finished section above it is rolled back, children included.
    pub fn new_head(&self, head: BlockNumber, reorg: bool) -> Result<(), IndexerError> {
        if reorg {
            return self.rollback(head.saturating_add(1))
        }
        let confirmed = self.confirmed_sections(head);
        let mut state = self.inner.state.lock();
        if confirmed > state.known {
            trace!(target: "chain::indexer", name = %self.inner.name, head, sections = confirmed, "New confirmed sections");
            state.known = confirmed;
            drop(state);
            self.inner.update.notify_one();
        }
        Ok(())
    }

    fn confirmed_sections(&self, head: BlockNumber) -> u64 {
        head.checked_sub(self.inner.confirms).map_or(0, |confirmed| confirmed / self.inner.section_size)
    }

    /// Keeps only the sections entirely inside the first `valid_blocks` blocks.
    fn rollback(&self, valid_blocks: u64) -> Result<(), IndexerError> {
        let valid = valid_blocks / self.inner.section_size;
        let stored = {
            let mut state = self.inner.state.lock();
            state.known = state.known.min(valid);
            if valid < state.stored {
                let rolled_back = state.stored - valid;
                self.set_valid_sections(&mut state, valid)?;
                self.inner.metrics.sections_rolled_back(rolled_back);
                debug!(target: "chain::indexer", name = %self.inner.name, rolled_back, sections = valid, "Rolled back sections");
            }
            state.stored
        };
        let children = self.inner.children.lock().clone();
        for child in children {
            child.rollback(stored * self.inner.section_size)?;
        }
        Ok(())
    }

    /// Registers an indexer that processes the sections finished by this one.
    ///
    /// The child sees the end of the last finished section as its head and should not require
    /// confirmations of its own.
    pub fn add_child_indexer(&self, child: ChainIndexer) -> Result<(), IndexerError> {
        let stored = self.inner.state.lock().stored;
        child.rollback(stored * self.inner.section_size)?;
        child.new_head(stored * self.inner.section_size, false)?;
        if let Some(cancel) = self.inner.running.lock().clone() {
            child.spawn_update_loops(&cancel);
        }
        self.inner.children.lock().push(child);
        Ok(())
    }

    /// Progress of the indexer.
    pub fn sections(&self) -> Result<SectionsInfo, IndexerError> {
        let count = self.inner.state.lock().stored;
        if count == 0 {
            return Ok(SectionsInfo { count, last_head_number: None, processed_head: None })
        }
        Ok(SectionsInfo {
            count,
            last_head_number: Some(count * self.inner.section_size - 1),
            processed_head: self.section_head(count - 1)?,
        })
    }

    /// Hash of the last header of a finished section.
    pub fn section_head(&self, section: u64) -> Result<Option<B256>, IndexerError> {
        let raw = self.inner.provider.db().get(&self.section_head_key(section))?;
        Ok(raw.filter(|raw| raw.len() == 32).map(|raw| B256::from_slice(&raw)))
    }

    /// Starts following the chain events and processing sections, for this indexer and all its
    /// children.
    pub fn start(
        &self,
        mut events: UnboundedReceiver<ChainEvent>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        self.spawn_update_loops(&cancel);
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    event = events.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };
                if let Err(error) = this.on_event(event) {
                    warn!(target: "chain::indexer", name = %this.inner.name, %error, "Failed to handle chain event");
                }
            }
            debug!(target: "chain::indexer", name = %this.inner.name, "Stopped following the chain");
        })
    }

    fn on_event(&self, event: ChainEvent) -> Result<(), IndexerError> {
        match event {
            ChainEvent::Head(head) => self.new_head(head, false),
            ChainEvent::Reorg { ancestor, head } => {
                self.new_head(ancestor, true)?;
                self.new_head(head, false)
            }
        }
    }

    fn spawn_update_loops(&self, cancel: &CancellationToken) {
        *self.inner.running.lock() = Some(cancel.clone());
        tokio::spawn(self.clone().update_loop(cancel.clone()));
        let children = self.inner.children.lock().clone();
        for child in children {
            child.spawn_update_loops(cancel);
        }
    }

    async fn update_loop(self, cancel: CancellationToken) {
        loop {
            loop {
                match self.process_next() {
                    Ok(true) => tokio::task::yield_now().await,
                    Ok(false) => break,
                    Err(error) => {
                        // retried on the next head
                        warn!(target: "chain::indexer", name = %self.inner.name, %error, "Section processing failed");
                        break
                    }
                }
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                _ = self.inner.update.notified() => {}
            }
        }
    }

    /// Processes the next confirmed section, if any.
    ///
    /// Returns false if every confirmed section is finished.
    pub(crate) fn process_next(&self) -> Result<bool, IndexerError> {
        let section = {
            let state = self.inner.state.lock();
            if state.stored >= state.known {
                return Ok(false)
            }
            state.stored
        };
        let head = self.process_section(section)?;

        {
            let mut state = self.inner.state.lock();
            let last = (section + 1) * self.inner.section_size - 1;
            // a rollback or reorg while processing makes the result stale
            if state.stored != section ||
                state.known <= section ||
                self.inner.provider.canonical_hash(last)? != Some(head)
            {
                debug!(target: "chain::indexer", name = %self.inner.name, section, "Discarded stale section");
                return Ok(true)
            }
            self.inner.provider.db().put(&self.section_head_key(section), head.as_slice())?;
            self.set_valid_sections(&mut state, section + 1)?;
        }
        self.inner.metrics.section_processed();
        debug!(target: "chain::indexer", name = %self.inner.name, section, %head, "Processed section");

        let children = self.inner.children.lock().clone();
        for child in children {
            child.new_head((section + 1) * self.inner.section_size, false)?;
        }
        Ok(true)
    }

    /// Feeds the section to the backend and returns the hash of its last header.
    fn process_section(&self, section: u64) -> Result<B256, IndexerError> {
        let provider = &self.inner.provider;
        let prev_head = match section {
            0 => B256::ZERO,
            _ => self
                .section_head(section - 1)?
                .ok_or(IndexerError::MissingSectionHead { section: section - 1 })?,
        };
        let mut backend = self.inner.backend.lock();
        backend.reset(section, prev_head)?;
        let mut last = prev_head;
        let first = section * self.inner.section_size;
        for number in first..first + self.inner.section_size {
            let hash = provider.canonical_hash(number)?.ok_or(IndexerError::MissingHeader { number })?;
            let header =
                provider.header(number, hash)?.ok_or(IndexerError::MissingHeader { number })?;
            if header.parent_hash != last {
                return Err(IndexerError::Reorged { number })
            }
            backend.process(&header)?;
            last = hash;
        }
        backend.commit()?;
        Ok(last)
    }

    fn stored_count(&self) -> Result<u64, IndexerError> {
        let raw = self.inner.provider.db().get(&self.key(b"-count"))?;
        Ok(raw
            .and_then(|raw| <[u8; 8]>::try_from(raw.as_slice()).ok())
            .map(u64::from_be_bytes)
            .unwrap_or_default())
    }

    /// Persists the number of finished sections and drops the heads of the sections above.
    fn set_valid_sections(&self, state: &mut SectionState, sections: u64) -> Result<(), IndexerError> {
        let db = self.inner.provider.db();
        db.put(&self.key(b"-count"), &sections.to_be_bytes())?;
        for section in sections..state.stored {
            db.delete(&self.section_head_key(section))?;
        }
        state.stored = sections;
        self.inner.metrics.set_stored(sections);
        Ok(())
    }

    fn key(&self, suffix: &[u8]) -> Vec<u8> {
        let mut key = b"chainIndex-".to_vec();
        key.extend_from_slice(self.inner.name.as_bytes());
        key.extend_from_slice(suffix);
        key
    }

    fn section_head_key(&self, section: u64) -> Vec<u8> {
        let mut key = self.key(b"-shead-");
        key.extend_from_slice(&section.to_be_bytes());
        key
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use dos_interfaces::{db::MemoryDatabase, test_utils::TestChain};
    use dos_metrics::CountingMetrics;

    #[derive(Debug, Default, Clone)]
    struct Recorded {
        resets: Vec<(u64, B256)>,
        processed: Vec<BlockNumber>,
        commits: usize,
    }

    #[derive(Debug)]
    struct RecordingBackend(Arc<Mutex<Recorded>>);

    impl ChainIndexerBackend for RecordingBackend {
        fn reset(&mut self, section: u64, prev_head: B256) -> Result<(), IndexerError> {
            self.0.lock().resets.push((section, prev_head));
            Ok(())
        }

        fn process(&mut self, header: &SealedHeader) -> Result<(), IndexerError> {
            self.0.lock().processed.push(header.number);
            Ok(())
        }

        fn commit(&mut self) -> Result<(), IndexerError> {
            self.0.lock().commits += 1;
            Ok(())
        }
    }

    fn provider(chain: &TestChain) -> ChainProvider {
        let provider = ChainProvider::new(Arc::new(MemoryDatabase::new()));
        provider.init_genesis(chain.genesis()).unwrap();
        insert(&provider, chain, 1);
        provider
    }

    fn insert(provider: &ChainProvider, chain: &TestChain, from: u64) {
        let headers: Vec<SealedHeader> =
            chain.blocks()[from as usize..].iter().map(|block| block.header.clone()).collect();
        provider.insert_headers(&headers).unwrap();
    }

    fn indexer(
        provider: &ChainProvider,
        name: &str,
        size: u64,
        confirms: u64,
        metrics: Arc<CountingMetrics>,
    ) -> (ChainIndexer, Arc<Mutex<Recorded>>) {
        let recorded = Arc::new(Mutex::new(Recorded::default()));
        let backend = Box::new(RecordingBackend(recorded.clone()));
        let indexer =
            ChainIndexer::new(provider.clone(), backend, name, size, confirms, metrics).unwrap();
        (indexer, recorded)
    }

    fn drain(indexer: &ChainIndexer) {
        while indexer.process_next().unwrap() {}
    }

    #[test]
    fn sections_wait_for_confirmations() {
        let chain = TestChain::new(20);
        let provider = provider(&chain);
        let metrics = Arc::new(CountingMetrics::default());
        let (indexer, recorded) = indexer(&provider, "test", 4, 2, metrics.clone());

        indexer.new_head(5, false).unwrap();
        drain(&indexer);
        assert_eq!(indexer.sections().unwrap().count, 0);
        assert!(recorded.lock().processed.is_empty());

        indexer.new_head(6, false).unwrap();
        drain(&indexer);
        assert_eq!(recorded.lock().processed, vec![0, 1, 2, 3]);

        indexer.new_head(13, false).unwrap();
        drain(&indexer);
        let info = indexer.sections().unwrap();
        assert_eq!(info.count, 2);
        assert_eq!(info.last_head_number, Some(7));
        assert_eq!(info.processed_head, Some(chain.header(7).unwrap().hash()));
        assert_eq!(indexer.section_head(0).unwrap(), Some(chain.header(3).unwrap().hash()));

        let recorded = recorded.lock();
        assert_eq!(recorded.processed, (0..8).collect::<Vec<_>>());
        assert_eq!(
            recorded.resets,
            vec![(0, B256::ZERO), (1, chain.header(3).unwrap().hash())]
        );
        assert_eq!(recorded.commits, 2);
        assert_eq!(metrics.counter("indexer.sections.processed"), 2);
        assert_eq!(metrics.gauge("indexer.sections.stored"), Some(2.0));
    }

    #[test]
    fn reorg_rolls_back_and_reprocesses() {
        let chain = TestChain::new(20);
        let provider = provider(&chain);
        let metrics = Arc::new(CountingMetrics::default());
        let (indexer, recorded) = indexer(&provider, "test", 4, 2, metrics.clone());
        indexer.new_head(14, false).unwrap();
        drain(&indexer);
        assert_eq!(indexer.sections().unwrap().count, 3);

        let fork = chain.fork(6, 16, 1);
        insert(&provider, &fork, 7);
        // blocks up to 6 are shared, only section 0 survives
        indexer.new_head(6, true).unwrap();
        assert_eq!(indexer.sections().unwrap().count, 1);
        assert_eq!(indexer.section_head(1).unwrap(), None);
        assert_eq!(metrics.counter("indexer.sections.rolled_back"), 2);

        recorded.lock().processed.clear();
        indexer.new_head(fork.head_number(), false).unwrap();
        drain(&indexer);
        let info = indexer.sections().unwrap();
        assert_eq!(info.count, 5);
        assert_eq!(indexer.section_head(1).unwrap(), Some(fork.header(7).unwrap().hash()));
        assert_eq!(recorded.lock().processed, (4..20).collect::<Vec<_>>());
    }

    #[test]
    fn children_follow_finished_sections() {
        let chain = TestChain::new(24);
        let provider = provider(&chain);
        let metrics = Arc::new(CountingMetrics::default());
        let (parent, _) = indexer(&provider, "parent", 4, 2, metrics.clone());
        let (child, recorded) = indexer(&provider, "child", 8, 0, metrics);
        parent.add_child_indexer(child.clone()).unwrap();

        // four parent sections cover two child sections
        parent.new_head(18, false).unwrap();
        drain(&parent);
        assert_eq!(parent.sections().unwrap().count, 4);
        drain(&child);
        assert_eq!(child.sections().unwrap().count, 2);
        assert_eq!(recorded.lock().processed, (0..16).collect::<Vec<_>>());

        // the reorg takes out parent section 3 and with it child section 1
        parent.new_head(13, true).unwrap();
        assert_eq!(parent.sections().unwrap().count, 3);
        assert_eq!(child.sections().unwrap().count, 1);
    }

    #[test]
    fn progress_survives_restart() {
        let chain = TestChain::new(20);
        let provider = provider(&chain);
        let metrics = Arc::new(CountingMetrics::default());
        let (indexer, _) = indexer(&provider, "test", 4, 0, metrics.clone());
        indexer.new_head(20, false).unwrap();
        drain(&indexer);
        assert_eq!(indexer.sections().unwrap().count, 5);
        drop(indexer);

        let (restarted, recorded) = self::indexer(&provider, "test", 4, 0, metrics.clone());
        assert_eq!(restarted.sections().unwrap().count, 5);
        restarted.new_head(20, false).unwrap();
        drain(&restarted);
        assert!(recorded.lock().processed.is_empty());

        // another name starts from scratch
        let (other, _) = self::indexer(&provider, "other", 4, 0, metrics);
        assert_eq!(other.sections().unwrap().count, 0);
    }

    #[test]
    fn reorg_while_stopped_is_detected_on_restart() {
        let chain = TestChain::new(20);
        let provider = provider(&chain);
        let metrics = Arc::new(CountingMetrics::default());
        let (indexer, _) = indexer(&provider, "test", 4, 0, metrics.clone());
        indexer.new_head(20, false).unwrap();
        drain(&indexer);
        drop(indexer);

        insert(&provider, &chain.fork(9, 14, 1), 10);
        let (restarted, _) = self::indexer(&provider, "test", 4, 0, metrics);
        let info = restarted.sections().unwrap();
        assert_eq!(info.count, 2);
        assert_eq!(info.processed_head, Some(chain.header(7).unwrap().hash()));
        assert_eq!(restarted.section_head(2).unwrap(), None);
    }

    #[test]
    fn missing_headers_fail_the_section() {
        let chain = TestChain::new(20);
        let provider = ChainProvider::new(Arc::new(MemoryDatabase::new()));
        provider.init_genesis(chain.genesis()).unwrap();
        let headers: Vec<SealedHeader> =
            chain.blocks()[1..6].iter().map(|block| block.header.clone()).collect();
        provider.insert_headers(&headers).unwrap();

        let (indexer, _) = indexer(&provider, "test", 4, 0, Arc::new(CountingMetrics::default()));
        indexer.new_head(12, false).unwrap();
        assert!(indexer.process_next().unwrap());
        assert_matches!(indexer.process_next(), Err(IndexerError::MissingHeader { number: 6 }));
        assert_eq!(indexer.sections().unwrap().count, 1);
    }

    #[test]
    fn zero_section_size_is_rejected() {
        let provider = ChainProvider::new(Arc::new(MemoryDatabase::new()));
        let backend = Box::new(RecordingBackend(Arc::default()));
        assert_matches!(
            ChainIndexer::new(provider, backend, "test", 0, 0, dos_metrics::noop()),
            Err(IndexerError::InvalidSectionSize(0))
        );
    }
}
