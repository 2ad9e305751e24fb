//! Staged event bus
//!
//! Routes each message to the handlers interested in its `(stage, id)`.
//!
//! ```text
//!                 ┌── lane 0: RequestHandler A ──► Outcome ──► pending[(Response, id, 0)]
//! request(id) ────┤
//!                 └── lane 1: RequestHandler B ──► Outcome ──► pending[(Replay, id, 1)]
//!
//! response(id) ──► take pending[(Response, id, *)] ──► resume ──► pending[(Replay, id, 0)]
//! replay(id)   ──► take pending[(Replay, id, *)]   ──► resume ──► done
//! ```
//!
//! Every bootstrap [`RequestHandler`] owns a lane, so two handler chains can
//! both wait for the replay of the same transaction without replacing each
//! other. Within a lane there is at most one pending continuation per
//! `(stage, id)`; a second registration replaces the first with a warning.
//!
//! # Cross-worker ordering
//!
//! Workers dequeue in arrival order but finish in any order, so a response
//! can start dispatching while its request handler is still running. A
//! message is *admitted* (marked in flight) before the next line is
//! dequeued. A later-stage message waits until no earlier stage of the same
//! id is in flight before taking continuations, so a slow lane cannot
//! register after a fast lane already fired. Only strictly earlier stages
//! are waited on, so waits cannot form a cycle.

use crate::metrics::PipelineMetrics;
use kaiku_core::{Continuation, HandlerError, Message, MessageId, Next, RequestHandler, Stage};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Notify;
use tracing::{debug, warn};

type Lane = usize;

/// Drop reason recorded for correlation misses
pub const CORRELATION_MISS: &str = "correlation_miss";

struct InFlight {
    count: usize,
    notify: Arc<Notify>,
}

/// Staged dispatcher for one pipeline
pub struct EventBus {
    handlers: Vec<Arc<dyn RequestHandler>>,
    pending: Mutex<HashMap<(Stage, MessageId, Lane), Box<dyn Continuation>>>,
    in_flight: Mutex<HashMap<(MessageId, Stage), InFlight>>,
    misses: AtomicU64,
    metrics: Option<Arc<PipelineMetrics>>,
}

impl EventBus {
    /// Create a bus with bootstrap request handlers, in chain order
    pub fn new(handlers: Vec<Arc<dyn RequestHandler>>) -> Self {
        Self {
            handlers,
            pending: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
            misses: AtomicU64::new(0),
            metrics: None,
        }
    }

    /// Report drops and pending continuations to `metrics`
    pub fn with_metrics(mut self, metrics: Arc<PipelineMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Number of bootstrap handlers
    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    /// Continuations waiting for a later stage
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Messages dropped because nothing was registered for them
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Dispatch a message
    ///
    /// Returns the (possibly rewritten) message, or `None` on a correlation
    /// miss. Handler errors are returned as-is; they are fatal to the
    /// pipeline.
    pub async fn emit(&self, msg: Message) -> Result<Option<Message>, HandlerError> {
        self.admit(msg).dispatch().await
    }

    /// Mark a message in flight without dispatching it yet
    ///
    /// Admission order is what later stages wait on: admit messages in
    /// arrival order, then dispatch them concurrently.
    pub fn admit(&self, msg: Message) -> Admitted<'_> {
        let key = (msg.id().clone(), msg.stage());
        self.in_flight
            .lock()
            .entry(key.clone())
            .or_insert_with(|| InFlight {
                count: 0,
                notify: Arc::new(Notify::new()),
            })
            .count += 1;
        Admitted {
            bus: self,
            msg: Some(msg),
            key,
        }
    }

    async fn dispatch_request(&self, msg: Message) -> Result<Option<Message>, HandlerError> {
        let mut current = msg;
        for (lane, handler) in self.handlers.iter().enumerate() {
            let (rewritten, next) = handler.on_request(&current).await?.into_parts();
            if let Some(rewritten) = rewritten {
                current = rewritten;
            }
            if let Some(next) = next {
                self.register(lane, handler.name(), Stage::Request, current.id(), next)?;
            }
        }
        Ok(Some(current))
    }

    async fn dispatch_later(&self, msg: Message) -> Result<Option<Message>, HandlerError> {
        let stage = msg.stage();
        // Every lane must have had its chance to register first
        while self.wait_for_earlier(msg.id(), stage).await {}
        let continuations = self.take(stage, msg.id());
        if continuations.is_empty() {
            self.record_miss(&msg);
            return Ok(None);
        }

        let mut current = msg;
        for (lane, continuation) in continuations {
            let name = continuation.name();
            let (rewritten, next) = continuation.resume(&current).await?.into_parts();
            if let Some(rewritten) = rewritten {
                current = rewritten;
            }
            if let Some(next) = next {
                self.register(lane, name, stage, current.id(), next)?;
            }
        }
        Ok(Some(current))
    }

    fn register(
        &self,
        lane: Lane,
        handler: &str,
        from: Stage,
        id: &MessageId,
        next: Next,
    ) -> Result<(), HandlerError> {
        if next.stage <= from {
            return Err(HandlerError::InvalidTransition {
                handler: handler.to_string(),
                from,
                to: next.stage,
            });
        }

        let mut pending = self.pending.lock();
        if pending
            .insert((next.stage, id.clone(), lane), next.continuation)
            .is_some()
        {
            warn!(%id, stage = %next.stage, handler, "Replaced pending continuation");
        }
        if let Some(metrics) = &self.metrics {
            metrics.pending_continuations.set(pending.len() as i64);
        }
        Ok(())
    }

    /// Remove every lane's continuation for `(stage, id)`, in lane order
    fn take(&self, stage: Stage, id: &MessageId) -> Vec<(Lane, Box<dyn Continuation>)> {
        let mut pending = self.pending.lock();
        let mut found = Vec::new();
        for lane in 0..self.handlers.len() {
            if let Some(c) = pending.remove(&(stage, id.clone(), lane)) {
                found.push((lane, c));
            }
        }
        if let Some(metrics) = &self.metrics {
            metrics.pending_continuations.set(pending.len() as i64);
        }
        found
    }

    /// Wait for one earlier-stage dispatch of `id` to finish
    ///
    /// Returns `false` when nothing earlier is in flight.
    async fn wait_for_earlier(&self, id: &MessageId, stage: Stage) -> bool {
        let Some(notify) = self.earlier_in_flight(id, stage) else {
            return false;
        };
        let notified = notify.notified();
        // The dispatch may have finished between the lookup and `notified()`
        if self.earlier_in_flight(id, stage).is_none() {
            return true;
        }
        debug!(%id, %stage, "Waiting for earlier stage");
        notified.await;
        true
    }

    fn earlier_in_flight(&self, id: &MessageId, stage: Stage) -> Option<Arc<Notify>> {
        let in_flight = self.in_flight.lock();
        Stage::ALL
            .iter()
            .filter(|earlier| **earlier < stage)
            .find_map(|earlier| in_flight.get(&(id.clone(), *earlier)))
            .map(|entry| Arc::clone(&entry.notify))
    }

    fn finish(&self, key: &(MessageId, Stage)) {
        let mut in_flight = self.in_flight.lock();
        if let Some(entry) = in_flight.get_mut(key) {
            entry.count -= 1;
            entry.notify.notify_waiters();
            if entry.count == 0 {
                in_flight.remove(key);
            }
        }
    }

    fn record_miss(&self, msg: &Message) {
        self.misses.fetch_add(1, Ordering::Relaxed);
        if let Some(metrics) = &self.metrics {
            metrics.record_dropped(CORRELATION_MISS);
        }
        debug!(id = %msg.id(), stage = %msg.stage(), "No handler registered, dropping");
    }
}

/// A message marked in flight on an [`EventBus`]
///
/// The in-flight mark is cleared when this value is dropped, whether the
/// dispatch finished, failed, panicked or never ran.
pub struct Admitted<'a> {
    bus: &'a EventBus,
    msg: Option<Message>,
    key: (MessageId, Stage),
}

impl Admitted<'_> {
    /// Stage of the admitted message
    pub fn stage(&self) -> Stage {
        self.key.1
    }

    /// Run the handlers for the admitted message
    pub async fn dispatch(mut self) -> Result<Option<Message>, HandlerError> {
        let Some(msg) = self.msg.take() else {
            return Ok(None);
        };
        match msg.stage() {
            Stage::Request => self.bus.dispatch_request(msg).await,
            Stage::Response | Stage::Replay => self.bus.dispatch_later(msg).await,
        }
    }
}

impl Drop for Admitted<'_> {
    fn drop(&mut self) {
        self.bus.finish(&self.key);
    }
}
