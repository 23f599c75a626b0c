#![warn(missing_docs, unreachable_pub)]
#![deny(unused_must_use, rust_2018_idioms)]
#![doc(test(
    no_crate_inject,
    attr(deny(warnings, rust_2018_idioms), allow(dead_code, unused_variables))
))]

//! Collection of metrics utilities.
//!
//! Components never talk to a process wide registry directly. They receive an
//! `Arc<dyn MetricsSink>` at construction and wrap it in their own typed metrics struct, which
//! keeps tests isolated from each other and lets the node decide where measurements go.

use parking_lot::Mutex;
use std::{collections::BTreeMap, fmt::Debug, sync::Arc};

/// Re-export core metrics crate.
pub use metrics;

/// A destination for measurements.
pub trait MetricsSink: Debug + Send + Sync {
    /// Increment the counter with the given name.
    fn increment_counter(&self, name: &'static str, value: u64);

    /// Set the gauge with the given name.
    fn set_gauge(&self, name: &'static str, value: f64);

    /// Record a sample of the histogram with the given name.
    fn record_histogram(&self, name: &'static str, value: f64);
}

/// Shared handle to a [`MetricsSink`].
pub type SharedMetrics = Arc<dyn MetricsSink>;

/// Returns a sink that drops every measurement.
pub fn noop() -> SharedMetrics {
    Arc::new(NoopMetrics)
}

/// A [`MetricsSink`] that drops every measurement.
#[derive(Debug, Default, Clone, Copy)]
#[non_exhaustive]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn increment_counter(&self, _name: &'static str, _value: u64) {}

    fn set_gauge(&self, _name: &'static str, _value: f64) {}

    fn record_histogram(&self, _name: &'static str, _value: f64) {}
}

/// A [`MetricsSink`] forwarding to the globally installed [`metrics`] recorder.
#[derive(Debug, Default, Clone, Copy)]
#[non_exhaustive]
pub struct RecorderMetrics;

impl MetricsSink for RecorderMetrics {
    fn increment_counter(&self, name: &'static str, value: u64) {
        metrics::counter!(name).increment(value);
    }

    fn set_gauge(&self, name: &'static str, value: f64) {
        metrics::gauge!(name).set(value);
    }

    fn record_histogram(&self, name: &'static str, value: f64) {
        metrics::histogram!(name).record(value);
    }
}

/// A [`MetricsSink`] that keeps everything in memory, used to assert on measurements.
#[derive(Debug, Default)]
pub struct CountingMetrics {
    counters: Mutex<BTreeMap<&'static str, u64>>,
    gauges: Mutex<BTreeMap<&'static str, f64>>,
    histograms: Mutex<BTreeMap<&'static str, Vec<f64>>>,
}

impl CountingMetrics {
    /// Current value of the counter, zero if it was never incremented.
    pub fn counter(&self, name: &str) -> u64 {
        self.counters.lock().get(name).copied().unwrap_or_default()
    }

    /// Last value of the gauge.
    pub fn gauge(&self, name: &str) -> Option<f64> {
        self.gauges.lock().get(name).copied()
    }

    /// All samples recorded for the histogram.
    pub fn samples(&self, name: &str) -> Vec<f64> {
        self.histograms.lock().get(name).cloned().unwrap_or_default()
    }
}

impl MetricsSink for CountingMetrics {
    fn increment_counter(&self, name: &'static str, value: u64) {
        *self.counters.lock().entry(name).or_default() += value;
    }

    fn set_gauge(&self, name: &'static str, value: f64) {
        self.gauges.lock().insert(name, value);
    }

    fn record_histogram(&self, name: &'static str, value: f64) {
        self.histograms.lock().entry(name).or_default().push(value);
    }
}
