//! Message type for kaiku
//!
//! A [`Message`] is one observed traffic event: a recorded request, the
//! recorded response to it, or the live replay of that response. The three
//! share a [`MessageId`], which is what lets handlers correlate them.
//!
//! # Frame layout
//!
//! ```text
//! meta:    "<stage> <id> <timestamp> [<latency>] ..."   (space separated)
//! payload: raw HTTP bytes (headers + body), never parsed here
//! ```
//!
//! `meta[0]` is the stage code and `meta[1]` the correlation id. The
//! `stage` and `id` fields are derived from them and always agree with them.
//!
//! # Zero-Copy
//!
//! Meta fields and payload are `Bytes` slices of the decoded frame, so
//! cloning a message only bumps reference counts.

use crate::error::DecodeError;
use bytes::Bytes;
use smallvec::SmallVec;
use std::fmt;
use std::time::Duration;

/// Meta fields, inline up to the four GoReplay emits
pub type Meta = SmallVec<[Bytes; 4]>;

/// Index of the stage code in the meta fields
pub const META_STAGE: usize = 0;
/// Index of the correlation id in the meta fields
pub const META_ID: usize = 1;
/// Index of the capture timestamp in the meta fields
pub const META_TIMESTAMP: usize = 2;
/// Index of the latency (decimal microseconds) in the meta fields
pub const META_LATENCY: usize = 3;

/// Pipeline stage of a message
///
/// Ordered: `Request < Response < Replay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    /// Recorded request (stage code `1`)
    Request,
    /// Recorded response to the request (stage code `2`)
    Response,
    /// Live response obtained by replaying the request (stage code `3`)
    Replay,
}

impl Stage {
    /// All stages in pipeline order
    pub const ALL: [Stage; 3] = [Stage::Request, Stage::Response, Stage::Replay];

    /// Wire code for this stage
    pub fn code(self) -> &'static [u8] {
        match self {
            Stage::Request => b"1",
            Stage::Response => b"2",
            Stage::Replay => b"3",
        }
    }

    /// Parse a wire stage code
    pub fn from_code(code: &[u8]) -> Option<Self> {
        match code {
            b"1" => Some(Stage::Request),
            b"2" => Some(Stage::Response),
            b"3" => Some(Stage::Replay),
            _ => None,
        }
    }

    /// Lowercase name, used as a metric label
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Request => "request",
            Stage::Response => "response",
            Stage::Replay => "replay",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque correlation identifier
///
/// Stable across the request/response/replay triple of one transaction.
/// GoReplay ids are hex strings, but nothing here relies on that.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(Bytes);

impl MessageId {
    /// Wrap raw id bytes
    pub fn new(id: impl Into<Bytes>) -> Self {
        Self(id.into())
    }

    /// Raw id bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// The id as text, if it is valid UTF-8
    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.0).ok()
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageId({})", self)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.0))
    }
}

impl From<&str> for MessageId {
    fn from(s: &str) -> Self {
        Self(Bytes::copy_from_slice(s.as_bytes()))
    }
}

impl From<String> for MessageId {
    fn from(s: String) -> Self {
        Self(Bytes::from(s))
    }
}

impl From<Bytes> for MessageId {
    fn from(b: Bytes) -> Self {
        Self(b)
    }
}

impl PartialEq<str> for MessageId {
    fn eq(&self, other: &str) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

impl PartialEq<&str> for MessageId {
    fn eq(&self, other: &&str) -> bool {
        self == *other
    }
}

/// One observed traffic event
///
/// # Example
///
/// ```
/// use bytes::Bytes;
/// use kaiku_core::{Message, Stage};
///
/// let msg = Message::new(
///     Stage::Replay,
///     "7",
///     [Bytes::from_static(b"1700000000"), Bytes::from_static(b"250000")],
///     Bytes::from_static(b"HTTP/1.1 200 OK\r\n\r\n"),
/// ).unwrap();
/// assert_eq!(msg.stage(), Stage::Replay);
/// assert_eq!(msg.id(), &"7");
/// assert_eq!(msg.latency().map(|d| d.as_secs_f64()), Some(0.25));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    id: MessageId,
    stage: Stage,
    meta: Meta,
    payload: Bytes,
}

impl Message {
    /// Build a message from its stage, id, trailing meta fields and payload
    ///
    /// `extra` holds the fields after the id (timestamp, latency, ...).
    ///
    /// # Errors
    ///
    /// [`DecodeError::InvalidField`] when the id or an extra field is empty
    /// or contains a space or newline: the line protocol could not carry it.
    pub fn new(
        stage: Stage,
        id: impl Into<MessageId>,
        extra: impl IntoIterator<Item = Bytes>,
        payload: Bytes,
    ) -> Result<Self, DecodeError> {
        let id = id.into();
        if !is_frameable(&id.0) {
            return Err(DecodeError::InvalidField("id"));
        }
        let mut meta: Meta = SmallVec::new();
        meta.push(Bytes::from_static(stage.code()));
        meta.push(id.0.clone());
        for field in extra {
            if !is_frameable(&field) {
                return Err(DecodeError::InvalidField("extra"));
            }
            meta.push(field);
        }
        Ok(Self {
            id,
            stage,
            meta,
            payload,
        })
    }

    /// Build a message from already split meta fields
    ///
    /// Fails when the stage code or id is missing, or the stage code is
    /// unknown.
    pub fn from_parts(meta: Meta, payload: Bytes) -> Result<Self, DecodeError> {
        let code = meta
            .get(META_STAGE)
            .ok_or(DecodeError::MissingField("stage"))?;
        let stage = Stage::from_code(code)
            .ok_or_else(|| DecodeError::UnknownStage(String::from_utf8_lossy(code).into_owned()))?;
        let id = meta
            .get(META_ID)
            .cloned()
            .map(MessageId)
            .ok_or(DecodeError::MissingField("id"))?;
        Ok(Self {
            id,
            stage,
            meta,
            payload,
        })
    }

    /// Correlation id
    #[inline]
    pub fn id(&self) -> &MessageId {
        &self.id
    }

    /// Pipeline stage
    #[inline]
    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// All meta fields, including stage code and id
    #[inline]
    pub fn meta(&self) -> &[Bytes] {
        &self.meta
    }

    /// Raw HTTP payload
    #[inline]
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Same message with a different payload
    ///
    /// This is how handlers rewrite a request: the original value is left
    /// untouched.
    pub fn with_payload(&self, payload: impl Into<Bytes>) -> Self {
        Self {
            id: self.id.clone(),
            stage: self.stage,
            meta: self.meta.clone(),
            payload: payload.into(),
        }
    }

    /// Capture timestamp from the meta fields, if present and numeric
    pub fn timestamp(&self) -> Option<i64> {
        parse_ascii(self.meta.get(META_TIMESTAMP)?)
    }

    /// Round-trip latency recorded by the replay engine
    ///
    /// The engine writes decimal microseconds at [`META_LATENCY`].
    pub fn latency(&self) -> Option<Duration> {
        parse_ascii::<u64>(self.meta.get(META_LATENCY)?).map(Duration::from_micros)
    }

    /// Payload as text, for logging
    ///
    /// Payloads are arbitrary bytes; callers that only want to log should
    /// fall back to a lossy rendering on error instead of failing.
    pub fn payload_str(&self) -> Result<&str, std::str::Utf8Error> {
        std::str::from_utf8(&self.payload)
    }
}

/// A meta field survives encoding only if it is non-empty and holds no
/// field or frame separator
fn is_frameable(field: &[u8]) -> bool {
    !field.is_empty() && !field.iter().any(|&b| b == b' ' || b == b'\n')
}

fn parse_ascii<T: std::str::FromStr>(field: &[u8]) -> Option<T> {
    std::str::from_utf8(field).ok()?.parse().ok()
}
