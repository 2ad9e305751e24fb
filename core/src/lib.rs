//! kaiku-core - Core types for the kaiku replay middleware
//!
//! This crate provides the types shared between the kaiku gateway and
//! handler crates:
//!
//! - [`Message`] / [`Stage`] / [`MessageId`] - one observed traffic event
//! - [`codec`] - the hex line protocol spoken by the replay engine
//! - [`http`] - pure accessors over raw HTTP payloads (cookies, status, path)
//! - [`RequestHandler`] / [`Continuation`] / [`Outcome`] - the handler interface
//! - [`DecodeError`] / [`HandlerError`] - error types
//!
//! # Why this crate exists
//!
//! Handler crates (like `kaiku-session`) implement the handler traits and
//! use the message accessors without pulling in the pipeline runtime.
//!
//! ```text
//! kaiku-core ◄── kaiku-gateway ◄── kaiku-runtime
//!     ▲               ▲
//!     └───────────────┴──── kaiku-session
//! ```

#![deny(unsafe_code)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::panic)]
#![warn(missing_docs)]

/// Hex line protocol
pub mod codec;
mod error;
mod handler;
/// HTTP field accessors
pub mod http;
/// The message envelope
pub mod message;

pub use error::{DecodeError, HandlerError};
pub use handler::{Continuation, Next, Outcome, RequestHandler};
pub use message::{Message, MessageId, Meta, Stage};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_error_display() {
        assert_eq!(DecodeError::MissingSeparator.to_string(), "missing separator between meta and payload");
        assert_eq!(DecodeError::MissingField("id").to_string(), "missing meta field: id");
        assert_eq!(DecodeError::UnknownStage("9".into()).to_string(), "unknown stage code: 9");
    }

    #[test]
    fn test_handler_error_display() {
        let err = HandlerError::InvalidTransition {
            handler: "stats".to_string(),
            from: Stage::Replay,
            to: Stage::Response,
        };
        assert_eq!(err.to_string(), "handler 'stats' cannot continue from replay to response");
    }

    #[test]
    fn test_errors_are_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<DecodeError>();
        assert_send_sync::<HandlerError>();
        assert_send_sync::<Message>();
    }
}
