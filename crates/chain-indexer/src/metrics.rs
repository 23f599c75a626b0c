use dos_metrics::SharedMetrics;
use std::fmt;

/// Measurements of the chain indexers.
#[derive(Clone)]
pub struct IndexerMetrics {
    sink: SharedMetrics,
}

impl fmt::Debug for IndexerMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IndexerMetrics").finish_non_exhaustive()
    }
}

impl IndexerMetrics {
    /// Wraps the sink.
    pub fn new(sink: SharedMetrics) -> Self {
        Self { sink }
    }

    pub(crate) fn section_processed(&self) {
        self.sink.increment_counter("indexer.sections.processed", 1);
    }

    pub(crate) fn sections_rolled_back(&self, count: u64) {
        self.sink.increment_counter("indexer.sections.rolled_back", count);
    }

    pub(crate) fn set_stored(&self, stored: u64) {
        self.sink.set_gauge("indexer.sections.stored", stored as f64);
    }
}
