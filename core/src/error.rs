//! Error types for kaiku handlers and the wire codec

use crate::message::Stage;
use thiserror::Error;

/// Error returned when a wire line cannot be turned into a [`Message`](crate::Message)
///
/// Decode errors are local to a single line: the pipeline logs them, drops
/// the line and keeps going.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    /// The line contained nothing but whitespace
    #[error("empty line")]
    Empty,

    /// The line is not valid hex
    #[error("invalid hex: {0}")]
    InvalidHex(#[from] hex::FromHexError),

    /// The decoded frame has no separator between meta and payload
    #[error("missing separator between meta and payload")]
    MissingSeparator,

    /// A required meta field is absent
    #[error("missing meta field: {0}")]
    MissingField(&'static str),

    /// The stage code is not one of `1`, `2`, `3`
    #[error("unknown stage code: {0}")]
    UnknownStage(String),

    /// A meta field is empty or contains a separator, so no line can carry it
    #[error("meta field cannot be framed: {0}")]
    InvalidField(&'static str),
}

/// Error escaping a registered handler
///
/// Handler errors are fatal: the pipeline stops and the process exits
/// non-zero rather than keep running with partial correlation state.
///
/// # Example
///
/// ```
/// use kaiku_core::HandlerError;
///
/// let err = HandlerError::failed("token-correlator", "store poisoned");
/// assert_eq!(err.to_string(), "handler 'token-correlator' failed: store poisoned");
/// ```
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// The handler reported a failure
    #[error("handler '{handler}' failed: {message}")]
    Failed {
        /// Name of the failing handler
        handler: String,
        /// What went wrong
        message: String,
    },

    /// The handler asked to continue at a stage that is not after the current one
    #[error("handler '{handler}' cannot continue from {from} to {to}")]
    InvalidTransition {
        /// Name of the offending handler
        handler: String,
        /// Stage being dispatched
        from: Stage,
        /// Stage the handler tried to register for
        to: Stage,
    },

    /// The handler panicked
    #[error("handler panicked: {0}")]
    Panicked(String),
}

impl HandlerError {
    /// Shorthand for [`HandlerError::Failed`]
    pub fn failed(handler: impl Into<String>, message: impl ToString) -> Self {
        Self::Failed {
            handler: handler.into(),
            message: message.to_string(),
        }
    }
}
