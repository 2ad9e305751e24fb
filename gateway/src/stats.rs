//! Replay latency recorder
//!
//! Follows each transaction from its request straight to its replay and
//! records the replay latency in a [`MetricsAggregator`], labelled by
//! `http_method`, `http_path` (request) and `http_status` (replay).

use crate::metrics::MetricsAggregator;
use async_trait::async_trait;
use kaiku_core::{Continuation, HandlerError, Message, Outcome, RequestHandler, Stage, http};
use std::sync::Arc;
use tracing::debug;

const NAME: &str = "latency-recorder";

/// Request handler recording replay latency
pub struct LatencyRecorder {
    latency: Arc<MetricsAggregator>,
}

impl LatencyRecorder {
    /// Record into `latency`
    pub fn new(latency: Arc<MetricsAggregator>) -> Self {
        Self { latency }
    }
}

#[async_trait]
impl RequestHandler for LatencyRecorder {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn on_request(&self, msg: &Message) -> Result<Outcome, HandlerError> {
        let payload = msg.payload();
        let (Some(method), Some(path)) = (http::method(payload), http::path(payload)) else {
            debug!(id = %msg.id(), "Request line unreadable, not timing");
            return Ok(Outcome::pass());
        };

        Ok(Outcome::pass().then(
            Stage::Replay,
            AwaitReplay {
                latency: Arc::clone(&self.latency),
                method: method.to_string(),
                path: base_path(path).to_string(),
            },
        ))
    }
}

struct AwaitReplay {
    latency: Arc<MetricsAggregator>,
    method: String,
    path: String,
}

#[async_trait]
impl Continuation for AwaitReplay {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn resume(self: Box<Self>, msg: &Message) -> Result<Outcome, HandlerError> {
        let (Some(latency), Some(status)) = (msg.latency(), http::status(msg.payload())) else {
            debug!(id = %msg.id(), "Replay without latency or status, not recording");
            return Ok(Outcome::pass());
        };

        let status = status.to_string();
        self.latency
            .record(
                latency.as_secs_f64(),
                &[
                    ("http_status", status.as_str()),
                    ("http_method", self.method.as_str()),
                    ("http_path", self.path.as_str()),
                ],
            )
            .map_err(|e| HandlerError::failed(NAME, e))?;
        Ok(Outcome::pass())
    }
}

/// First path segment: `/api/users/7` -> `/api`
///
/// The query string is ignored. A path with a single segment is kept whole.
pub fn base_path(path: &str) -> &str {
    let path = path.split('?').next().unwrap_or(path);
    match path.get(1..).and_then(|rest| rest.find('/')) {
        Some(end) => &path[..end + 1],
        None => path,
    }
}
