// SPDX-License-Identifier: MIT OR Apache-2.0
//! Structured telemetry for ASAP servers: labeled counters and histograms,
//! a process-wide registry, and minimal Prometheus text exposition.
//!
//! This is deliberately not a general metrics client: no push gateway, no
//! exemplars, no background exporter. It covers exactly what the server
//! needs to answer `GET /asap/metrics`.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, RwLock};

use serde::{Deserialize, Serialize};
use tracing::info;

/// A label set, sorted for deterministic exposition and hashing.
pub type Labels = BTreeMap<String, String>;

/// A monotonically increasing counter with a fixed label set.
#[derive(Debug, Clone)]
pub struct Counter {
    inner: Arc<Mutex<u64>>,
}

impl Counter {
    fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(0)),
        }
    }

    /// Increment by one.
    pub fn inc(&self) {
        self.add(1);
    }

    /// Increment by `delta`.
    pub fn add(&self, delta: u64) {
        let mut value = self.inner.lock().expect("counter lock poisoned");
        *value += delta;
    }

    /// Current value.
    pub fn get(&self) -> u64 {
        *self.inner.lock().expect("counter lock poisoned")
    }
}

/// A bucketed histogram with a fixed label set and bucket bounds.
#[derive(Debug, Clone)]
pub struct Histogram {
    bounds: Arc<Vec<f64>>,
    inner: Arc<Mutex<HistogramState>>,
}

#[derive(Debug, Default)]
struct HistogramState {
    bucket_counts: Vec<u64>,
    sum: f64,
    count: u64,
}

/// Default bucket bounds, suited to millisecond-scale request latencies.
pub const DEFAULT_BUCKETS: &[f64] = &[5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0];

impl Histogram {
    fn new(bounds: Vec<f64>) -> Self {
        let bucket_counts = vec![0; bounds.len() + 1];
        Self {
            bounds: Arc::new(bounds),
            inner: Arc::new(Mutex::new(HistogramState {
                bucket_counts,
                sum: 0.0,
                count: 0,
            })),
        }
    }

    /// Record one observation.
    pub fn observe(&self, value: f64) {
        let mut state = self.inner.lock().expect("histogram lock poisoned");
        let idx = self.bounds.iter().position(|b| value <= *b).unwrap_or(self.bounds.len());
        state.bucket_counts[idx] += 1;
        state.sum += value;
        state.count += 1;
    }

    /// Total number of observations.
    pub fn count(&self) -> u64 {
        self.inner.lock().expect("histogram lock poisoned").count
    }

    /// Sum of all observed values.
    pub fn sum(&self) -> f64 {
        self.inner.lock().expect("histogram lock poisoned").sum
    }

    /// Cumulative counts per bucket upper bound, plus the `+Inf` bucket.
    fn cumulative_buckets(&self) -> Vec<(String, u64)> {
        let state = self.inner.lock().expect("histogram lock poisoned");
        let mut running = 0u64;
        let mut out = Vec::with_capacity(self.bounds.len() + 1);
        for (i, bound) in self.bounds.iter().enumerate() {
            running += state.bucket_counts[i];
            out.push((format_bound(*bound), running));
        }
        running += state.bucket_counts[self.bounds.len()];
        out.push(("+Inf".to_string(), running));
        out
    }
}

fn format_bound(b: f64) -> String {
    if b.fract() == 0.0 {
        format!("{b:.0}")
    } else {
        b.to_string()
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum MetricKind {
    Counter,
    Histogram,
}

enum MetricInstance {
    Counter(Counter),
    Histogram(Histogram),
}

struct MetricFamily {
    kind: MetricKind,
    help: String,
    instances: BTreeMap<Labels, MetricInstance>,
}

/// A process-wide registry of named, labeled counters and histograms.
///
/// Families are created on first use and shared across callers that ask
/// for the same name.
#[derive(Clone, Default)]
pub struct Registry {
    families: Arc<RwLock<BTreeMap<String, MetricFamily>>>,
}

impl Registry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create a counter named `name` with `labels`, registering the
    /// family with `help` the first time `name` is seen.
    pub fn counter(&self, name: &str, help: &str, labels: Labels) -> Counter {
        let mut families = self.families.write().expect("registry lock poisoned");
        let family = families.entry(name.to_string()).or_insert_with(|| MetricFamily {
            kind: MetricKind::Counter,
            help: help.to_string(),
            instances: BTreeMap::new(),
        });
        match family.instances.entry(labels).or_insert_with(|| MetricInstance::Counter(Counter::new())) {
            MetricInstance::Counter(c) => c.clone(),
            MetricInstance::Histogram(_) => panic!("metric '{name}' already registered as a histogram"),
        }
    }

    /// Get or create a histogram named `name` with `labels` and `buckets`,
    /// registering the family with `help` the first time `name` is seen.
    pub fn histogram(&self, name: &str, help: &str, labels: Labels, buckets: &[f64]) -> Histogram {
        let mut families = self.families.write().expect("registry lock poisoned");
        let family = families.entry(name.to_string()).or_insert_with(|| MetricFamily {
            kind: MetricKind::Histogram,
            help: help.to_string(),
            instances: BTreeMap::new(),
        });
        match family
            .instances
            .entry(labels)
            .or_insert_with(|| MetricInstance::Histogram(Histogram::new(buckets.to_vec())))
        {
            MetricInstance::Histogram(h) => h.clone(),
            MetricInstance::Counter(_) => panic!("metric '{name}' already registered as a counter"),
        }
    }

    /// Render every registered metric as Prometheus text exposition
    /// format.
    pub fn render_text(&self) -> String {
        let families = self.families.read().expect("registry lock poisoned");
        let mut out = String::new();
        for (name, family) in families.iter() {
            let type_str = match family.kind {
                MetricKind::Counter => "counter",
                MetricKind::Histogram => "histogram",
            };
            out.push_str(&format!("# HELP {name} {}\n", family.help));
            out.push_str(&format!("# TYPE {name} {type_str}\n"));
            for (labels, instance) in family.instances.iter() {
                match instance {
                    MetricInstance::Counter(c) => {
                        out.push_str(&format!("{name}{} {}\n", render_labels(labels), c.get()));
                    }
                    MetricInstance::Histogram(h) => {
                        for (bound, count) in h.cumulative_buckets() {
                            let mut bucket_labels = labels.clone();
                            bucket_labels.insert("le".to_string(), bound);
                            out.push_str(&format!("{name}_bucket{} {}\n", render_labels(&bucket_labels), count));
                        }
                        out.push_str(&format!("{name}_sum{} {}\n", render_labels(labels), h.sum()));
                        out.push_str(&format!("{name}_count{} {}\n", render_labels(labels), h.count()));
                    }
                }
            }
        }
        out
    }
}

fn render_labels(labels: &Labels) -> String {
    if labels.is_empty() {
        return String::new();
    }
    let rendered = labels
        .iter()
        .map(|(k, v)| format!("{k}=\"{}\"", escape_label_value(v)))
        .collect::<Vec<_>>()
        .join(",");
    format!("{{{rendered}}}")
}

/// Escape a label value per the Prometheus text exposition spec: backslash
/// first, then double quote, then newline.
fn escape_label_value(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"").replace('\n', "\\n")
}

/// A structured span for tracing integration: a name plus deterministic
/// key-value attributes, emitted via `tracing::info!`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetrySpan {
    /// Span name / operation.
    pub name: String,
    /// Arbitrary key-value attributes (deterministic ordering).
    pub attributes: BTreeMap<String, String>,
}

impl TelemetrySpan {
    /// Create a new span with the given name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attributes: BTreeMap::new(),
        }
    }

    /// Insert an attribute.
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Emit the span via `tracing::info!`.
    pub fn emit(&self) {
        info!(
            span_name = %self.name,
            attributes = ?self.attributes,
            "telemetry_span"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> Labels {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn counter_increments() {
        let registry = Registry::new();
        let c = registry.counter("asap_requests_total", "total requests", Labels::new());
        c.inc();
        c.add(4);
        assert_eq!(c.get(), 5);
    }

    #[test]
    fn counter_same_labels_share_instance() {
        let registry = Registry::new();
        let a = registry.counter("asap_requests_total", "total requests", labels(&[("method", "dispatch")]));
        let b = registry.counter("asap_requests_total", "total requests", labels(&[("method", "dispatch")]));
        a.inc();
        assert_eq!(b.get(), 1);
    }

    #[test]
    fn counter_distinct_labels_are_independent() {
        let registry = Registry::new();
        let a = registry.counter("asap_requests_total", "total requests", labels(&[("status", "ok")]));
        let b = registry.counter("asap_requests_total", "total requests", labels(&[("status", "error")]));
        a.inc();
        assert_eq!(a.get(), 1);
        assert_eq!(b.get(), 0);
    }

    #[test]
    fn histogram_buckets_observations() {
        let h = Histogram::new(vec![10.0, 50.0, 100.0]);
        h.observe(5.0);
        h.observe(30.0);
        h.observe(500.0);
        assert_eq!(h.count(), 3);
        assert_eq!(h.sum(), 535.0);
        let buckets = h.cumulative_buckets();
        assert_eq!(buckets[0], ("10".to_string(), 1));
        assert_eq!(buckets[1], ("50".to_string(), 2));
        assert_eq!(buckets[2], ("100".to_string(), 2));
        assert_eq!(buckets[3], ("+Inf".to_string(), 3));
    }

    #[test]
    fn render_text_includes_help_and_type() {
        let registry = Registry::new();
        registry.counter("asap_requests_total", "total requests processed", Labels::new()).inc();
        let text = registry.render_text();
        assert!(text.contains("# HELP asap_requests_total total requests processed"));
        assert!(text.contains("# TYPE asap_requests_total counter"));
        assert!(text.contains("asap_requests_total 1"));
    }

    #[test]
    fn render_text_escapes_label_values() {
        let registry = Registry::new();
        registry
            .counter("asap_errors_total", "errors", labels(&[("message", "bad \"quote\"\nand backslash \\")]))
            .inc();
        let text = registry.render_text();
        assert!(text.contains(r#"message="bad \"quote\"\nand backslash \\""#));
    }

    #[test]
    fn render_text_includes_histogram_bucket_sum_count() {
        let registry = Registry::new();
        let h = registry.histogram("asap_dispatch_duration_ms", "dispatch latency", Labels::new(), DEFAULT_BUCKETS);
        h.observe(12.0);
        let text = registry.render_text();
        assert!(text.contains("asap_dispatch_duration_ms_bucket"));
        assert!(text.contains("asap_dispatch_duration_ms_sum 12"));
        assert!(text.contains("asap_dispatch_duration_ms_count 1"));
    }

    #[test]
    fn telemetry_span_attributes() {
        let span = TelemetrySpan::new("op").with_attribute("key", "val").with_attribute("another", "thing");
        assert_eq!(span.name, "op");
        assert_eq!(span.attributes.len(), 2);
        assert_eq!(span.attributes["key"], "val");
    }

    #[test]
    fn telemetry_span_serde_roundtrip() {
        let span = TelemetrySpan::new("run").with_attribute("backend", "mock");
        let json = serde_json::to_string(&span).unwrap();
        let span2: TelemetrySpan = serde_json::from_str(&json).unwrap();
        assert_eq!(span2.name, "run");
        assert_eq!(span2.attributes["backend"], "mock");
    }
}
