//! In-memory metrics facade: labelled counters and histograms, injected
//! via a shared [`Registry`] rather than global mutable state.
//!
//! The registry has no external sink — it is a pluggable observation point
//! a caller can drain (or wire into its own exporter); shipping one is
//! explicitly out of scope.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

/// A label set, sorted for stable keying (`{env, table, symbol}` etc).
pub type Labels = Vec<(&'static str, String)>;

fn key(name: &str, labels: &Labels) -> String {
    let mut sorted = labels.clone();
    sorted.sort_by(|a, b| a.0.cmp(b.0));
    let mut out = String::from(name);
    for (k, v) in sorted {
        out.push('{');
        out.push_str(k);
        out.push('=');
        out.push_str(&v);
        out.push('}');
    }
    out
}

#[derive(Debug, Default, Clone, Copy)]
pub struct HistogramSummary {
    pub count: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
}

impl HistogramSummary {
    fn observe(&mut self, value: f64) {
        if self.count == 0 {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
        self.count += 1;
        self.sum += value;
    }

    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }
}

#[derive(Default)]
struct Inner {
    counters: HashMap<String, u64>,
    histograms: HashMap<String, HistogramSummary>,
}

/// Shared, cloneable handle to the in-memory counter/histogram store.
#[derive(Clone, Default)]
pub struct Registry(Arc<Mutex<Inner>>);

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr_counter(&self, name: &str, labels: &Labels) {
        self.add_counter(name, labels, 1);
    }

    pub fn add_counter(&self, name: &str, labels: &Labels, delta: u64) {
        let mut inner = self.0.lock();
        *inner.counters.entry(key(name, labels)).or_insert(0) += delta;
    }

    pub fn observe_histogram(&self, name: &str, labels: &Labels, value: f64) {
        let mut inner = self.0.lock();
        inner
            .histograms
            .entry(key(name, labels))
            .or_default()
            .observe(value);
    }

    pub fn counter(&self, name: &str, labels: &Labels) -> u64 {
        self.0.lock().counters.get(&key(name, labels)).copied().unwrap_or(0)
    }

    pub fn histogram(&self, name: &str, labels: &Labels) -> HistogramSummary {
        self.0
            .lock()
            .histograms
            .get(&key(name, labels))
            .copied()
            .unwrap_or_default()
    }
}
