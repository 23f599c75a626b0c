use dos_interfaces::p2p::error::DownloadError;
use dos_metrics::SharedMetrics;
use dos_peers::RequestKind;
use std::fmt;

/// Measurements of the bulk downloader.
#[derive(Clone)]
pub struct DownloaderMetrics {
    sink: SharedMetrics,
}

impl fmt::Debug for DownloaderMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DownloaderMetrics").finish_non_exhaustive()
    }
}

impl DownloaderMetrics {
    /// Wraps the sink.
    pub fn new(sink: SharedMetrics) -> Self {
        Self { sink }
    }

    const fn names(kind: RequestKind) -> (&'static str, &'static str, &'static str) {
        match kind {
            RequestKind::Headers => {
                ("downloader.headers.in", "downloader.headers.drop", "downloader.headers.timeout")
            }
            RequestKind::Bodies => {
                ("downloader.bodies.in", "downloader.bodies.drop", "downloader.bodies.timeout")
            }
            RequestKind::Receipts => (
                "downloader.receipts.in",
                "downloader.receipts.drop",
                "downloader.receipts.timeout",
            ),
            RequestKind::NodeData => {
                ("downloader.states.in", "downloader.states.drop", "downloader.states.timeout")
            }
        }
    }

    /// Items accepted from a delivery.
    pub(crate) fn delivered(&self, kind: RequestKind, count: usize) {
        self.sink.increment_counter(Self::names(kind).0, count as u64);
    }

    /// Items dropped because the delivery was invalid, late or unsolicited.
    pub(crate) fn dropped(&self, kind: RequestKind, count: usize) {
        self.sink.increment_counter(Self::names(kind).1, count as u64);
    }

    /// A request that expired.
    pub(crate) fn timed_out(&self, kind: RequestKind) {
        self.sink.increment_counter(Self::names(kind).2, 1);
    }

    /// Blocks written to storage.
    pub(crate) fn committed(&self, count: usize) {
        self.sink.increment_counter("downloader.blocks.committed", count as u64);
    }

    /// Progress of the current run.
    pub(crate) fn set_progress(&self, current: u64, highest: u64) {
        self.sink.set_gauge("downloader.sync.current", current as f64);
        self.sink.set_gauge("downloader.sync.highest", highest as f64);
    }

    /// Outcome of a failed run.
    pub(crate) fn increment_errors(&self, error: &DownloadError) {
        let name = match error {
            DownloadError::Timeout { .. } => "downloader.errors.timeout",
            DownloadError::Stalled | DownloadError::NoPeers => "downloader.errors.stalled",
            DownloadError::Cancelled | DownloadError::Terminated => "downloader.errors.cancelled",
            error if error.is_protocol_fault() => "downloader.errors.protocol",
            _ => "downloader.errors.unexpected",
        };
        self.sink.increment_counter(name, 1);
    }
}

/// Measurements of the block fetcher.
#[derive(Clone)]
pub struct FetcherMetrics {
    sink: SharedMetrics,
}

impl fmt::Debug for FetcherMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetcherMetrics").finish_non_exhaustive()
    }
}

impl FetcherMetrics {
    /// Wraps the sink.
    pub fn new(sink: SharedMetrics) -> Self {
        Self { sink }
    }

    fn inc(&self, name: &'static str) {
        self.sink.increment_counter(name, 1);
    }

    pub(crate) fn announce_in(&self) {
        self.inc("fetcher.prop.announces.in");
    }

    pub(crate) fn announce_out(&self) {
        self.inc("fetcher.prop.announces.out");
    }

    pub(crate) fn announce_drop(&self) {
        self.inc("fetcher.prop.announces.drop");
    }

    pub(crate) fn announce_dos(&self) {
        self.inc("fetcher.prop.announces.dos");
    }

    pub(crate) fn broadcast_in(&self) {
        self.inc("fetcher.prop.broadcasts.in");
    }

    pub(crate) fn broadcast_out(&self) {
        self.inc("fetcher.prop.broadcasts.out");
    }

    pub(crate) fn broadcast_drop(&self) {
        self.inc("fetcher.prop.broadcasts.drop");
    }

    pub(crate) fn broadcast_dos(&self) {
        self.inc("fetcher.prop.broadcasts.dos");
    }

    pub(crate) fn header_fetch(&self) {
        self.inc("fetcher.fetch.headers");
    }

    pub(crate) fn body_fetch(&self) {
        self.inc("fetcher.fetch.bodies");
    }

    pub(crate) fn filter_headers(&self, received: usize, passed: usize) {
        self.sink.increment_counter("fetcher.filter.headers.in", received as u64);
        self.sink.increment_counter("fetcher.filter.headers.out", passed as u64);
    }

    pub(crate) fn filter_bodies(&self, received: usize, passed: usize) {
        self.sink.increment_counter("fetcher.filter.bodies.in", received as u64);
        self.sink.increment_counter("fetcher.filter.bodies.out", passed as u64);
    }
}
