//! KAIKU - replay middleware gateway
//!
//! Sits between a traffic replay engine and its target. The engine streams
//! recorded requests, their recorded responses and the live replayed
//! responses as hex-framed lines; kaiku dispatches each one to the handlers
//! following that transaction and writes the (possibly rewritten) requests
//! back.
//!
//! # Staged pipeline
//!
//! ```text
//! stdin ──► Pipeline ──► EventBus ──► RequestHandler ──► Continuation(s) ──► stdout
//!                          │
//!                          ├─► TokenStore        (session token correlation)
//!                          └─► MetricsAggregator (replay latency histograms)
//! ```
//!
//! Handlers are plain trait objects from `kaiku-core`; stateful
//! collaborators are constructed by the caller and shared through `Arc`.

#![deny(unsafe_code)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::panic)]

pub mod bus;
pub mod config;
pub mod error;
pub mod metrics;
pub mod metrics_server;
pub mod pipeline;
pub mod stats;
pub mod tokens;

pub use bus::EventBus;
pub use config::{Config, LogFormat};
pub use error::{GatewayError, Result};
pub use metrics::{MetricsAggregator, PipelineMetrics};
pub use metrics_server::MetricsServer;
pub use pipeline::{Pipeline, PipelineError, PipelineRunner, RunOutcome};
pub use stats::LatencyRecorder;
pub use tokens::TokenStore;

// Handler-facing types, so handler crates need only one dependency
pub use kaiku_core::{
    Continuation, DecodeError, HandlerError, Message, MessageId, Outcome, RequestHandler, Stage,
    codec, http,
};
