//! Convenience re-exports for middleware authors.
//!
//! ```rust
//! use kaiku_runtime::prelude::*;
//! ```

// Core types
pub use kaiku_core::{Message, MessageId, Stage};

// Handler interface
pub use kaiku_core::{Continuation, HandlerError, Outcome, RequestHandler};

// HTTP accessors and wire codec
pub use kaiku_core::{codec, http};

// Pipeline builder
pub use kaiku_gateway::{EventBus, Pipeline, PipelineRunner, RunOutcome};

// Stateful collaborators
pub use kaiku_gateway::{LatencyRecorder, MetricsAggregator, TokenStore};

// Configuration
pub use kaiku_gateway::{Config, LogFormat};

// Error types
pub use kaiku_gateway::{GatewayError, PipelineError};

// Zero-copy payload
pub use bytes::Bytes;

// Runtime
pub use crate::{Context, RuntimeBuilder};
