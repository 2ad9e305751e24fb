//! Pipeline - the ingest/dispatch loop builder
//!
//! # Example
//!
//! ```no_run
//! use kaiku_gateway::{LatencyRecorder, MetricsAggregator, Pipeline};
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), kaiku_gateway::GatewayError> {
//! let latency = Arc::new(MetricsAggregator::new());
//!
//! let outcome = Pipeline::new()
//!     .concurrency(4)
//!     .handler(LatencyRecorder::new(latency))
//!     .build()
//!     .run(
//!         tokio::io::BufReader::new(tokio::io::stdin()),
//!         tokio::io::stdout(),
//!         async {
//!             let _ = tokio::signal::ctrl_c().await;
//!         },
//!     )
//!     .await?;
//! # Ok(())
//! # }
//! ```

mod runner;

pub use runner::PipelineRunner;

use crate::bus::EventBus;
use crate::config::Config;
use crate::error::GatewayError;
use crate::metrics::PipelineMetrics;
use kaiku_core::RequestHandler;
use std::sync::Arc;

/// Errors surfaced by [`PipelineRunner::run`]
pub type PipelineError = GatewayError;

/// How a pipeline run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Input reached end of stream and every line was processed
    Completed,
    /// Shutdown was requested or the input failed; queued lines were drained
    Interrupted,
}

/// Pipeline builder
///
/// Connects the input channel to the handler chain and the output channel.
///
/// ```text
/// input ──► reader ──► bounded queue ──► N workers ──► EventBus ──► reorder ──► output
/// ```
pub struct Pipeline {
    /// Worker count
    concurrency: usize,
    /// Bounded queue size between reader and workers
    queue_capacity: usize,
    /// Bootstrap request handlers, in chain order
    handlers: Vec<Arc<dyn RequestHandler>>,
    metrics: Option<Arc<PipelineMetrics>>,
}

impl Pipeline {
    /// Create a pipeline with default settings and no handlers
    pub fn new() -> Self {
        Self {
            concurrency: 2,
            queue_capacity: 1024,
            handlers: Vec::new(),
            metrics: None,
        }
    }

    /// Create a pipeline sized from `config`
    pub fn from_config(config: &Config) -> Self {
        Self::new()
            .concurrency(config.concurrency)
            .queue_capacity(config.queue_capacity)
    }

    /// Set the worker count
    ///
    /// Default is 2. Values below 1 are raised to 1.
    pub fn concurrency(mut self, workers: usize) -> Self {
        self.concurrency = workers.max(1);
        self
    }

    /// Set the queue capacity
    ///
    /// Default is 1024 lines. A full queue suspends the reader.
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    /// Append a bootstrap request handler
    pub fn handler<H: RequestHandler + 'static>(mut self, handler: H) -> Self {
        self.handlers.push(Arc::new(handler));
        self
    }

    /// Append a shared bootstrap request handler
    pub fn handler_arc(mut self, handler: Arc<dyn RequestHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    /// Report pipeline counters to `metrics`
    pub fn metrics(mut self, metrics: Arc<PipelineMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Build the runner
    pub fn build(self) -> PipelineRunner {
        let mut bus = EventBus::new(self.handlers);
        if let Some(metrics) = &self.metrics {
            bus = bus.with_metrics(Arc::clone(metrics));
        }
        PipelineRunner {
            bus: Arc::new(bus),
            concurrency: self.concurrency,
            queue_capacity: self.queue_capacity,
            metrics: self.metrics,
        }
    }
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new()
    }
}
