use dos_metrics::SharedMetrics;
use std::fmt;

/// Measurements of the light client path.
#[derive(Clone)]
pub struct LesMetrics {
    sink: SharedMetrics,
}

impl fmt::Debug for LesMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LesMetrics").finish_non_exhaustive()
    }
}

impl LesMetrics {
    /// Wraps the sink.
    pub fn new(sink: SharedMetrics) -> Self {
        Self { sink }
    }

    fn inc(&self, name: &'static str) {
        self.sink.increment_counter(name, 1);
    }

    pub(crate) fn retrieve_success(&self) {
        self.inc("les.retrieve.success");
    }

    pub(crate) fn retrieve_timeout(&self) {
        self.inc("les.retrieve.timeout");
    }

    pub(crate) fn retrieve_invalid(&self) {
        self.inc("les.retrieve.invalid");
    }

    pub(crate) fn retrieve_exhausted(&self) {
        self.inc("les.retrieve.exhausted");
    }

    pub(crate) fn distributor_queued(&self) {
        self.inc("les.distributor.queued");
    }

    pub(crate) fn distributor_assigned(&self) {
        self.inc("les.distributor.assigned");
    }

    pub(crate) fn distributor_expired(&self) {
        self.inc("les.distributor.expired");
    }

    pub(crate) fn set_pending(&self, pending: usize) {
        self.sink.set_gauge("les.distributor.pending", pending as f64);
    }

    pub(crate) fn record_latency(&self, latency: std::time::Duration) {
        self.sink.record_histogram("les.retrieve.latency", latency.as_secs_f64());
    }

    pub(crate) fn set_known_servers(&self, known: usize) {
        self.sink.set_gauge("les.serverpool.known", known as f64);
    }
}
