//! KAIKU Runtime: process bootstrap for replay middleware
//!
//! Provides [`run()`] for zero-boilerplate middleware startup, and
//! [`RuntimeBuilder`] for users who need control over the metrics server,
//! configuration or the input/output channels.
//!
//! The replay engine owns stdin and stdout; every log line goes to stderr.
//!
//! # Quick start
//!
//! ```ignore
//! use kaiku_runtime::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> std::process::ExitCode {
//!     kaiku_runtime::run(|pipeline, ctx| async move {
//!         Ok(pipeline.handler(LatencyRecorder::new(ctx.latency)))
//!     })
//!     .await
//! }
//! ```

#![deny(unsafe_code)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::panic)]

pub mod prelude;
pub mod stdin;

use kaiku_gateway::config::{Config, LogFormat};
use kaiku_gateway::metrics::{MetricsAggregator, PipelineMetrics};
use kaiku_gateway::metrics_server::MetricsServer;
use kaiku_gateway::pipeline::{Pipeline, RunOutcome};
use prometheus::Registry;
use stdin::ThreadReader;
use std::future::Future;
use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncWrite, BufReader};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Exit status after the input ended cleanly
pub const EXIT_COMPLETED: u8 = 0;
/// Exit status after a handler fault or a startup failure
pub const EXIT_FAILURE: u8 = 1;
/// Exit status after an interruption (EINTR)
pub const EXIT_INTERRUPTED: u8 = 4;

/// Collaborators handed to the configure closure
#[derive(Clone)]
pub struct Context {
    /// Loaded configuration
    pub config: Config,
    /// Replay latency histograms, registered in [`Context::registry`]
    pub latency: Arc<MetricsAggregator>,
    /// Registry served by the metrics endpoint
    pub registry: Registry,
}

/// Run the middleware on stdin/stdout with default settings.
///
/// Loads configuration from environment variables, initialises tracing and
/// metrics, calls your closure to wire up the pipeline, then runs it until
/// the replay engine closes stdin or a shutdown signal arrives.
///
/// Never fails: the outcome is mapped to the process exit status.
///
/// # Example
///
/// ```ignore
/// kaiku_runtime::run(|pipeline, ctx| async move {
///     Ok(pipeline
///         .concurrency(4)
///         .handler(LatencyRecorder::new(ctx.latency)))
/// }).await
/// ```
pub async fn run<F, Fut>(configure: F) -> ExitCode
where
    F: FnOnce(Pipeline, Context) -> Fut,
    Fut: Future<Output = anyhow::Result<Pipeline>>,
{
    ExitCode::from(exit_status(&RuntimeBuilder::new().configure(configure).await))
}

/// Map a run result to the process exit status
pub fn exit_status(result: &anyhow::Result<RunOutcome>) -> u8 {
    match result {
        Ok(RunOutcome::Completed) => EXIT_COMPLETED,
        Ok(RunOutcome::Interrupted) => EXIT_INTERRUPTED,
        Err(e) => {
            error!(error = %e, "KAIKU failed");
            EXIT_FAILURE
        }
    }
}

/// Power-user builder for controlling runtime behaviour.
///
/// # Example
///
/// ```ignore
/// RuntimeBuilder::new()
///     .metrics_addr("127.0.0.1:9091".parse()?)
///     .configure(|pipeline, _ctx| async move { Ok(pipeline) })
///     .await
/// ```
pub struct RuntimeBuilder {
    config: Option<Config>,
    metrics_addr: Option<SocketAddr>,
    metrics_enabled: Option<bool>,
}

impl RuntimeBuilder {
    /// Create a new builder with defaults from environment variables.
    pub fn new() -> Self {
        Self {
            config: None,
            metrics_addr: None,
            metrics_enabled: None,
        }
    }

    /// Use `config` instead of reading the environment.
    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    /// Override the metrics HTTP server address (implies enabled).
    ///
    /// Default: loaded from `KAIKU_METRICS_ADDR`, or `0.0.0.0:8000`.
    pub fn metrics_addr(mut self, addr: SocketAddr) -> Self {
        self.metrics_addr = Some(addr);
        self.metrics_enabled = Some(true);
        self
    }

    /// Never start the metrics HTTP server.
    pub fn disable_metrics(mut self) -> Self {
        self.metrics_enabled = Some(false);
        self
    }

    /// Configure the pipeline and run it on stdin/stdout.
    ///
    /// This is the terminal method; it returns when the run ends. Stdin is
    /// read on a detached thread, so an interrupted run does not keep the
    /// process alive while the replay engine holds the pipe open.
    pub async fn configure<F, Fut>(self, configure: F) -> anyhow::Result<RunOutcome>
    where
        F: FnOnce(Pipeline, Context) -> Fut,
        Fut: Future<Output = anyhow::Result<Pipeline>>,
    {
        self.serve(
            configure,
            BufReader::new(ThreadReader::stdin()?),
            tokio::io::stdout(),
            shutdown_signal(),
        )
        .await
    }

    /// Configure the pipeline and run it on the given channels.
    pub async fn serve<F, Fut, R, W, S>(
        self,
        configure: F,
        input: R,
        output: W,
        shutdown: S,
    ) -> anyhow::Result<RunOutcome>
    where
        F: FnOnce(Pipeline, Context) -> Fut,
        Fut: Future<Output = anyhow::Result<Pipeline>>,
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
        S: Future<Output = ()>,
    {
        // ── 1. Load config ───────────────────────────────────────
        let config = match self.config {
            Some(config) => config,
            None => match Config::from_env() {
                Ok(config) => config,
                Err(e) => {
                    // Still report the failure on stderr
                    init_tracing(&Config::default());
                    return Err(e.into());
                }
            },
        };

        // ── 2. Init tracing ──────────────────────────────────────
        init_tracing(&config);

        let metrics_enabled = self.metrics_enabled.unwrap_or(config.metrics_enabled);
        let metrics_addr = self.metrics_addr.unwrap_or(config.metrics_addr);
        info!(
            workers = config.concurrency,
            queue_capacity = config.queue_capacity,
            metrics = metrics_enabled,
            "Starting KAIKU"
        );

        // ── 3. Metrics ───────────────────────────────────────────
        let registry = Registry::new();
        let pipeline_metrics = Arc::new(PipelineMetrics::new(&registry)?);
        let latency = Arc::new(MetricsAggregator::with_registry(registry.clone()));

        // ── 4. Pre-configure Pipeline from config ────────────────
        let pipeline = Pipeline::from_config(&config).metrics(pipeline_metrics);

        // ── 5. User configures the Pipeline ──────────────────────
        let context = Context {
            config,
            latency,
            registry: registry.clone(),
        };
        let runner = configure(pipeline, context).await?.build();

        // ── 6. Metrics HTTP server ───────────────────────────────
        let metrics_handle = metrics_enabled
            .then(|| MetricsServer::start(metrics_addr, registry, Some(Arc::clone(runner.bus()))));

        // ── 7. Run until end of input, signal or fault ───────────
        let result = runner.run(input, output, shutdown).await;

        // ── 8. Shutdown ──────────────────────────────────────────
        if let Some(handle) = metrics_handle {
            handle.abort();
        }
        let outcome = result?;
        info!(?outcome, "KAIKU shutdown complete");
        Ok(outcome)
    }
}

impl Default for RuntimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Initialise the tracing subscriber based on config.
///
/// Logs go to stderr; stdout carries the protocol. A subscriber that is
/// already installed is kept.
fn init_tracing(config: &Config) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level));

    let registry = tracing_subscriber::registry().with(env_filter);

    let _ = match config.log_format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .try_init(),
        LogFormat::Pretty => registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .try_init(),
    };
}

/// Resolve on the first SIGINT or SIGTERM
///
/// A handler that fails to install is logged and never fires; the other
/// one still does.
async fn shutdown_signal() {
    let received = tokio::select! {
        () = interrupt() => "SIGINT",
        () = terminate() => "SIGTERM",
    };
    info!(signal = received, "Interrupted, stopping input");
}

async fn interrupt() {
    if let Err(e) = signal::ctrl_c().await {
        warn!(error = %e, "SIGINT handler unavailable");
        std::future::pending::<()>().await;
    }
}

#[cfg(unix)]
async fn terminate() {
    match signal::unix::signal(signal::unix::SignalKind::terminate()) {
        Ok(mut stream) => {
            stream.recv().await;
        }
        Err(e) => {
            warn!(error = %e, "SIGTERM handler unavailable");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate() {
    std::future::pending::<()>().await
}
