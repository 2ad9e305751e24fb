//! Prometheus metrics for kaiku
//!
//! Two collectors share one [`Registry`]:
//!
//! - [`MetricsAggregator`] - replay latency histograms, one per label shape
//! - [`PipelineMetrics`] - counters for the ingest/dispatch loop
//!
//! Both are built explicitly and handed to the pipeline; nothing here is
//! process-global.

use crate::error::{GatewayError, Result};
use parking_lot::RwLock;
use prometheus::core::Collector;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

/// Base name of the latency histograms
pub const LATENCY_METRIC: &str = "responses_latency_seconds";

const LATENCY_HELP: &str = "Response time of replayed responses";

/// Latency histograms keyed by the *set* of label names
///
/// Metrics backends need a fixed label schema per metric, but handler
/// chains may attach different labels to different observations. The first
/// observation with a new set of label names registers a new histogram;
/// later observations with the same names (in any order) land in it,
/// sub-keyed by label values. Shapes are never merged.
///
/// ```text
/// {http_method, http_status}            ──► responses_latency_seconds_by_http_method_http_status
/// {http_method, http_path, http_status} ──► responses_latency_seconds_by_http_method_http_path_http_status
/// ```
///
/// # Example
///
/// ```
/// use kaiku_gateway::MetricsAggregator;
///
/// let latency = MetricsAggregator::new();
/// latency.record(0.25, &[("http_status", "200"), ("http_method", "GET")]).unwrap();
/// latency.record(0.50, &[("http_method", "GET"), ("http_status", "200")]).unwrap();
///
/// assert_eq!(latency.shape_count(), 1);
/// assert_eq!(latency.sample_count(&[("http_method", "GET"), ("http_status", "200")]), Some(2));
/// ```
pub struct MetricsAggregator {
    registry: Registry,
    base_name: String,
    buckets: Vec<f64>,
    /// Sorted label names joined by ',' -> histogram
    histograms: RwLock<HashMap<String, HistogramVec>>,
}

impl MetricsAggregator {
    /// Create an aggregator with its own registry
    pub fn new() -> Self {
        Self::with_registry(Registry::new())
    }

    /// Create an aggregator registering into `registry`
    pub fn with_registry(registry: Registry) -> Self {
        Self {
            registry,
            base_name: LATENCY_METRIC.to_string(),
            buckets: prometheus::DEFAULT_BUCKETS.to_vec(),
            histograms: RwLock::new(HashMap::new()),
        }
    }

    /// Override the histogram base name
    pub fn base_name(mut self, name: impl Into<String>) -> Self {
        self.base_name = name.into();
        self
    }

    /// Override the histogram buckets (seconds)
    pub fn buckets(mut self, buckets: Vec<f64>) -> Self {
        self.buckets = buckets;
        self
    }

    /// Record one latency sample
    ///
    /// Label order does not matter. A repeated label name keeps the last
    /// value.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Metrics`] when a new shape cannot be
    /// registered (invalid label name, or a metric name collision).
    pub fn record(&self, latency_seconds: f64, labels: &[(&str, &str)]) -> Result<()> {
        let labels: BTreeMap<&str, &str> = labels.iter().copied().collect();
        let names: Vec<&str> = labels.keys().copied().collect();
        let values: Vec<&str> = labels.values().copied().collect();
        let key = names.join(",");

        if let Some(histogram) = self.histograms.read().get(&key) {
            histogram.with_label_values(&values).observe(latency_seconds);
            return Ok(());
        }

        let mut histograms = self.histograms.write();
        let histogram = match histograms.entry(key) {
            // Registered by another worker between the two locks
            Entry::Occupied(e) => e.into_mut(),
            Entry::Vacant(e) => {
                let name = self.metric_name(&names);
                let opts = HistogramOpts::new(name.clone(), LATENCY_HELP)
                    .buckets(self.buckets.clone());
                let histogram = HistogramVec::new(opts, &names)?;
                self.registry
                    .register(Box::new(histogram.clone()))
                    .map_err(|err| GatewayError::Metrics(format!("{name}: {err}")))?;
                debug!(metric = %name, labels = ?names, "Registered latency histogram");
                e.insert(histogram)
            }
        };
        histogram.with_label_values(&values).observe(latency_seconds);
        Ok(())
    }

    /// Number of distinct label shapes seen so far
    pub fn shape_count(&self) -> usize {
        self.histograms.read().len()
    }

    /// Number of samples recorded for exactly these labels
    ///
    /// `None` when the shape or the value combination was never recorded.
    pub fn sample_count(&self, labels: &[(&str, &str)]) -> Option<u64> {
        let labels: BTreeMap<&str, &str> = labels.iter().copied().collect();
        let key = labels.keys().copied().collect::<Vec<_>>().join(",");

        let histograms = self.histograms.read();
        let histogram = histograms.get(&key)?;
        histogram
            .collect()
            .iter()
            .flat_map(|family| family.get_metric())
            .find(|metric| {
                metric
                    .get_label()
                    .iter()
                    .all(|pair| labels.get(pair.get_name()) == Some(&pair.get_value()))
            })
            .map(|metric| metric.get_histogram().get_sample_count())
    }

    /// Prometheus text exposition of the aggregator's registry
    pub fn gather(&self) -> Result<String> {
        gather(&self.registry)
    }

    /// Registry the histograms are registered in
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    fn metric_name(&self, names: &[&str]) -> String {
        if names.is_empty() {
            self.base_name.clone()
        } else {
            format!("{}_by_{}", self.base_name, names.join("_"))
        }
    }
}

impl Default for MetricsAggregator {
    fn default() -> Self {
        Self::new()
    }
}

/// Counters for the ingest/dispatch loop
pub struct PipelineMetrics {
    /// Lines read from the input channel
    pub lines_read: IntCounter,

    /// Decoded messages (by stage)
    pub messages: IntCounterVec,

    /// Lines or messages dropped (by reason)
    pub dropped: IntCounterVec,

    /// Lines written to the output channel
    pub lines_written: IntCounter,

    /// Continuations waiting for a later stage
    pub pending_continuations: IntGauge,
}

impl PipelineMetrics {
    /// Create the counters and register them in `registry`
    pub fn new(registry: &Registry) -> Result<Self> {
        let metrics = Self {
            lines_read: IntCounter::new("kaiku_lines_read_total", "Lines read from the input channel")?,
            messages: IntCounterVec::new(
                Opts::new("kaiku_messages_total", "Decoded messages by stage"),
                &["stage"],
            )?,
            dropped: IntCounterVec::new(
                Opts::new("kaiku_messages_dropped_total", "Dropped lines and messages by reason"),
                &["reason"],
            )?,
            lines_written: IntCounter::new(
                "kaiku_lines_written_total",
                "Lines written to the output channel",
            )?,
            pending_continuations: IntGauge::new(
                "kaiku_pending_continuations",
                "Continuations waiting for a later stage",
            )?,
        };

        registry.register(Box::new(metrics.lines_read.clone()))?;
        registry.register(Box::new(metrics.messages.clone()))?;
        registry.register(Box::new(metrics.dropped.clone()))?;
        registry.register(Box::new(metrics.lines_written.clone()))?;
        registry.register(Box::new(metrics.pending_continuations.clone()))?;

        Ok(metrics)
    }

    /// Record a decoded message
    pub fn record_message(&self, stage: kaiku_core::Stage) {
        self.messages.with_label_values(&[stage.as_str()]).inc();
    }

    /// Record a dropped line or message
    pub fn record_dropped(&self, reason: &str) {
        self.dropped.with_label_values(&[reason]).inc();
    }

    /// Current drop count for `reason`
    pub fn dropped_count(&self, reason: &str) -> u64 {
        self.dropped.with_label_values(&[reason]).get()
    }
}

/// Encode everything in `registry` as Prometheus text format
pub fn gather(registry: &Registry) -> Result<String> {
    let mut buffer = Vec::new();
    TextEncoder::new().encode(&registry.gather(), &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| GatewayError::Metrics(e.to_string()))
}
