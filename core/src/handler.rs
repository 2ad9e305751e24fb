//! Handler traits for kaiku
//!
//! Handlers observe and rewrite messages as a transaction moves through
//! its stages. A transaction starts at a [`RequestHandler`], which is
//! registered once and sees every request. To follow the same transaction
//! into a later stage, the handler returns an [`Outcome`] carrying a
//! [`Continuation`]: a one-shot value that owns whatever context the next
//! stage needs and is fired when the message with the same id arrives at
//! that stage.
//!
//! ```text
//! request ──► RequestHandler::on_request ──► Outcome { message, next: (Response, C1) }
//! response ─► C1::resume ──────────────────► Outcome { next: (Replay, C2) }
//! replay ───► C2::resume ──────────────────► Outcome { next: None }   (done)
//! ```
//!
//! # Example
//!
//! ```
//! use async_trait::async_trait;
//! use kaiku_core::{Continuation, HandlerError, Message, Outcome, RequestHandler, Stage};
//!
//! struct LogReplay;
//!
//! struct AwaitReplay {
//!     request: Message,
//! }
//!
//! #[async_trait]
//! impl RequestHandler for LogReplay {
//!     fn name(&self) -> &'static str {
//!         "log-replay"
//!     }
//!
//!     async fn on_request(&self, msg: &Message) -> Result<Outcome, HandlerError> {
//!         Ok(Outcome::pass().then(Stage::Replay, AwaitReplay { request: msg.clone() }))
//!     }
//! }
//!
//! #[async_trait]
//! impl Continuation for AwaitReplay {
//!     async fn resume(self: Box<Self>, msg: &Message) -> Result<Outcome, HandlerError> {
//!         println!("{} replayed ({} bytes)", self.request.id(), msg.payload().len());
//!         Ok(Outcome::pass())
//!     }
//! }
//! ```

use crate::error::HandlerError;
use crate::message::{Message, Stage};
use async_trait::async_trait;
use std::fmt;

/// Entry point of a handler chain, invoked for every request-stage message
///
/// Handlers must be `Send + Sync`: workers call them concurrently for
/// different transactions.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    /// Handler name for logging
    fn name(&self) -> &'static str;

    /// Handle a request
    ///
    /// Return [`Outcome::rewrite`] to replace the request written to the
    /// output, and [`Outcome::then`] to follow the transaction into a
    /// later stage.
    async fn on_request(&self, msg: &Message) -> Result<Outcome, HandlerError>;
}

/// One-shot handler for a later stage of a single transaction
///
/// The value itself is the captured context: it is created by the previous
/// stage, stored by the bus under `(stage, id)`, and consumed when fired.
#[async_trait]
pub trait Continuation: Send {
    /// Name for logging
    fn name(&self) -> &'static str {
        "continuation"
    }

    /// Handle the message for the stage this continuation was registered for
    async fn resume(self: Box<Self>, msg: &Message) -> Result<Outcome, HandlerError>;
}

/// Stage transition requested by a handler
pub struct Next {
    /// Stage to wait for
    pub stage: Stage,
    /// Handler to fire when the message arrives
    pub continuation: Box<dyn Continuation>,
}

impl fmt::Debug for Next {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Next")
            .field("stage", &self.stage)
            .field("continuation", &self.continuation.name())
            .finish()
    }
}

/// Result of a handler invocation
///
/// - `message`: replacement message, `None` to propagate the input unmodified
/// - `next`: continuation to register for a later stage, `None` to end the chain
#[derive(Debug, Default)]
pub struct Outcome {
    message: Option<Message>,
    next: Option<Next>,
}

impl Outcome {
    /// Propagate the message unmodified
    pub fn pass() -> Self {
        Self::default()
    }

    /// Propagate `msg` instead of the input message
    pub fn rewrite(msg: Message) -> Self {
        Self {
            message: Some(msg),
            next: None,
        }
    }

    /// Follow the transaction into `stage`
    pub fn then<C: Continuation + 'static>(mut self, stage: Stage, continuation: C) -> Self {
        self.next = Some(Next {
            stage,
            continuation: Box::new(continuation),
        });
        self
    }

    /// Replacement message, if any
    pub fn message(&self) -> Option<&Message> {
        self.message.as_ref()
    }

    /// Requested transition, if any
    pub fn next(&self) -> Option<&Next> {
        self.next.as_ref()
    }

    /// Split into replacement message and transition
    pub fn into_parts(self) -> (Option<Message>, Option<Next>) {
        (self.message, self.next)
    }
}
