// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = "Counters and histograms for admission, queue, and negotiation outcomes."]
#![deny(unsafe_code)]
#![warn(missing_docs)]

//! Process-wide metrics registry.
//!
//! Counters are labelled monotonic u64s; histograms record millisecond
//! durations and summarise as mean/p50/p99. Everything lives behind one
//! mutex and serialises deterministically (BTreeMap ordering) for the admin
//! surface.

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

/// Aggregated view of one histogram.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct HistogramSummary {
    /// Number of recorded samples.
    pub count: usize,
    /// Mean of all samples in milliseconds.
    pub mean_ms: f64,
    /// Median sample.
    pub p50_ms: f64,
    /// 99th-percentile sample.
    pub p99_ms: f64,
}

/// Serializable snapshot of the whole registry.
#[derive(Debug, Clone, Serialize, Default)]
pub struct MetricsSnapshot {
    /// Counter values by name.
    pub counters: BTreeMap<String, u64>,
    /// Gauge values by name.
    pub gauges: BTreeMap<String, i64>,
    /// Histogram summaries by name.
    pub histograms: BTreeMap<String, HistogramSummary>,
}

#[derive(Default)]
struct Inner {
    counters: BTreeMap<String, u64>,
    gauges: BTreeMap<String, i64>,
    histograms: BTreeMap<String, Vec<u64>>,
}

/// Thread-safe metrics registry. Clones share storage.
#[derive(Clone, Default)]
pub struct Metrics {
    inner: Arc<Mutex<Inner>>,
}

/// Compute a percentile value from a **sorted** slice.
fn percentile(sorted: &[u64], pct: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    if sorted.len() == 1 {
        return sorted[0] as f64;
    }
    let rank = pct / 100.0 * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    let frac = rank - lower as f64;
    sorted[lower] as f64 * (1.0 - frac) + sorted[upper] as f64 * frac
}

impl Metrics {
    /// New empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment a counter by one.
    pub fn incr(&self, name: &str) {
        self.incr_by(name, 1);
    }

    /// Increment a counter by `delta`.
    pub fn incr_by(&self, name: &str, delta: u64) {
        let mut inner = self.inner.lock().expect("metrics lock poisoned");
        *inner.counters.entry(name.to_string()).or_insert(0) += delta;
    }

    /// Increment a counter with one label, e.g.
    /// `admission_rejected{code=replay_detected}`.
    pub fn incr_labeled(&self, name: &str, label: &str, value: &str) {
        self.incr(&format!("{name}{{{label}={value}}}"));
    }

    /// Set a gauge to an absolute value.
    pub fn gauge(&self, name: &str, value: i64) {
        let mut inner = self.inner.lock().expect("metrics lock poisoned");
        inner.gauges.insert(name.to_string(), value);
    }

    /// Record one histogram sample in milliseconds.
    pub fn observe_ms(&self, name: &str, ms: u64) {
        let mut inner = self.inner.lock().expect("metrics lock poisoned");
        inner.histograms.entry(name.to_string()).or_default().push(ms);
    }

    /// Current value of a counter, zero when never incremented.
    pub fn counter(&self, name: &str) -> u64 {
        let inner = self.inner.lock().expect("metrics lock poisoned");
        inner.counters.get(name).copied().unwrap_or(0)
    }

    /// Snapshot everything for the admin surface.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let inner = self.inner.lock().expect("metrics lock poisoned");
        let histograms = inner
            .histograms
            .iter()
            .map(|(name, samples)| {
                let mut sorted = samples.clone();
                sorted.sort_unstable();
                let count = sorted.len();
                let mean_ms = if count == 0 {
                    0.0
                } else {
                    sorted.iter().sum::<u64>() as f64 / count as f64
                };
                (
                    name.clone(),
                    HistogramSummary {
                        count,
                        mean_ms,
                        p50_ms: percentile(&sorted, 50.0),
                        p99_ms: percentile(&sorted, 99.0),
                    },
                )
            })
            .collect();
        MetricsSnapshot {
            counters: inner.counters.clone(),
            gauges: inner.gauges.clone(),
            histograms,
        }
    }
}
