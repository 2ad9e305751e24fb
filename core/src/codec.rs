//! Wire codec for the replay engine's line protocol
//!
//! Every record is one line:
//!
//! ```text
//! line := hex( meta SEP payload ) TERM
//! meta := field (' ' field)*
//! ```
//!
//! `SEP` and `TERM` are both `\n`. Because the whole frame is hex-encoded,
//! payload bytes (including newlines and NULs) never collide with the line
//! terminator.

use crate::error::DecodeError;
use crate::message::{Message, Meta};
use bytes::{BufMut, Bytes, BytesMut};
use smallvec::SmallVec;

/// Separator between meta and payload inside the frame
pub const SEPARATOR: u8 = b'\n';
/// Outer line terminator
pub const TERMINATOR: u8 = b'\n';
/// Separator between meta fields
pub const FIELD_SEPARATOR: u8 = b' ';

/// Decode one wire line into a [`Message`]
///
/// Surrounding whitespace (including the terminator and a `\r`) is ignored.
///
/// # Errors
///
/// - [`DecodeError::Empty`] for a blank line
/// - [`DecodeError::InvalidHex`] when the line is not hex
/// - [`DecodeError::MissingSeparator`] when the frame has no meta/payload split
/// - [`DecodeError::MissingField`] / [`DecodeError::UnknownStage`] for a bad meta prefix
pub fn decode(line: &[u8]) -> Result<Message, DecodeError> {
    let line = line.trim_ascii();
    if line.is_empty() {
        return Err(DecodeError::Empty);
    }

    let frame = Bytes::from(hex::decode(line)?);
    let split = frame
        .iter()
        .position(|&b| b == SEPARATOR)
        .ok_or(DecodeError::MissingSeparator)?;

    let meta = split_fields(frame.slice(..split));
    let payload = frame.slice(split + 1..);

    Message::from_parts(meta, payload)
}

/// Encode a [`Message`] as one wire line, terminator included
pub fn encode(msg: &Message) -> Bytes {
    let meta_len: usize = msg.meta().iter().map(|f| f.len() + 1).sum();
    let mut frame = BytesMut::with_capacity(meta_len + msg.payload().len());

    for (i, field) in msg.meta().iter().enumerate() {
        if i > 0 {
            frame.put_u8(FIELD_SEPARATOR);
        }
        frame.extend_from_slice(field);
    }
    frame.put_u8(SEPARATOR);
    frame.extend_from_slice(msg.payload());

    let mut line = hex::encode(&frame).into_bytes();
    line.push(TERMINATOR);
    Bytes::from(line)
}

/// Split the meta section on spaces, skipping empty fields
fn split_fields(meta: Bytes) -> Meta {
    let mut fields: Meta = SmallVec::new();
    let mut start = 0;
    for end in meta
        .iter()
        .enumerate()
        .filter(|(_, b)| **b == FIELD_SEPARATOR)
        .map(|(i, _)| i)
        .chain(std::iter::once(meta.len()))
    {
        if end > start {
            fields.push(meta.slice(start..end));
        }
        start = end + 1;
    }
    fields
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::message::Stage;

    fn frame(raw: &[u8]) -> Vec<u8> {
        let mut line = hex::encode(raw).into_bytes();
        line.push(b'\n');
        line
    }

    #[test]
    fn test_decode_request() {
        let line = frame(b"1 a1b2 1700000000\nGET /login HTTP/1.1\r\nHost: x\r\n\r\n");
        let msg = decode(&line).unwrap();

        assert_eq!(msg.stage(), Stage::Request);
        assert_eq!(msg.id(), &"a1b2");
        assert_eq!(msg.timestamp(), Some(1_700_000_000));
        assert_eq!(msg.payload().as_ref(), b"GET /login HTTP/1.1\r\nHost: x\r\n\r\n");
    }

    #[test]
    fn test_decode_replay_latency() {
        let line = frame(b"3 a1b2 1700000000 125000\nHTTP/1.1 200 OK\r\n\r\n");
        let msg = decode(&line).unwrap();

        assert_eq!(msg.stage(), Stage::Replay);
        assert_eq!(msg.latency().map(|d| d.as_secs_f64()), Some(0.125));
    }

    #[test]
    fn test_round_trip_binary_payload() {
        // Payload full of separators, terminators and NULs
        let payload = Bytes::from_static(b"\n\n \x00\xff\r\nHTTP/1.1 200 OK\n\x00");
        let msg = Message::new(
            Stage::Response,
            "0f0f",
            [Bytes::from_static(b"1"), Bytes::from_static(b"99")],
            payload,
        )
        .unwrap();

        assert_eq!(decode(&encode(&msg)).unwrap(), msg);
    }

    #[test]
    fn test_round_trip_every_stage_and_empty_payload() {
        for stage in Stage::ALL {
            let msg = Message::new(stage, "id-1", [], Bytes::new()).unwrap();
            assert_eq!(decode(&encode(&msg)).unwrap(), msg);
        }
    }

    #[test]
    fn test_round_trip_holds_for_every_constructible_message() {
        // Fields that would split or vanish on the wire are refused up front
        assert!(Message::new(Stage::Request, "a b", [], Bytes::new()).is_err());
        assert!(Message::new(Stage::Request, "a", [Bytes::new()], Bytes::new()).is_err());

        // Anything short of a separator survives
        let msg = Message::new(
            Stage::Replay,
            "a\tb",
            [Bytes::from_static(b"x\ry"), Bytes::from_static(&[0xff])],
            Bytes::new(),
        )
        .unwrap();
        assert_eq!(decode(&encode(&msg)).unwrap(), msg);
    }

    #[test]
    fn test_encode_is_one_line() {
        let msg = Message::new(Stage::Request, "1", [], Bytes::from_static(b"a\nb\nc")).unwrap();
        let line = encode(&msg);

        assert_eq!(line.last(), Some(&TERMINATOR));
        assert_eq!(line.iter().filter(|&&b| b == b'\n').count(), 1);
    }

    #[test]
    fn test_decode_tolerates_crlf_and_padding() {
        let mut line = b"  ".to_vec();
        line.extend_from_slice(hex::encode(b"2 x 1\nbody").as_bytes());
        line.extend_from_slice(b"\r\n");

        let msg = decode(&line).unwrap();
        assert_eq!(msg.stage(), Stage::Response);
        assert_eq!(msg.payload().as_ref(), b"body");
    }

    #[test]
    fn test_decode_uppercase_hex() {
        let line = hex::encode_upper(b"1 x\nGET / HTTP/1.1\r\n\r\n");
        assert!(decode(line.as_bytes()).is_ok());
    }

    #[test]
    fn test_decode_rejects_bad_hex() {
        assert!(matches!(
            decode(b"zz00\n"),
            Err(DecodeError::InvalidHex(_))
        ));
        // Odd length
        assert!(matches!(
            decode(b"abc\n"),
            Err(DecodeError::InvalidHex(_))
        ));
    }

    #[test]
    fn test_decode_rejects_missing_separator() {
        let line = frame(b"1 abc 123");
        assert_eq!(decode(&line), Err(DecodeError::MissingSeparator));
    }

    #[test]
    fn test_decode_rejects_bad_meta() {
        assert_eq!(decode(&frame(b"1\nGET /")), Err(DecodeError::MissingField("id")));
        assert_eq!(decode(&frame(b"\nGET /")), Err(DecodeError::MissingField("stage")));
        assert_eq!(
            decode(&frame(b"7 abc\nGET /")),
            Err(DecodeError::UnknownStage("7".to_string()))
        );
    }

    #[test]
    fn test_decode_empty_line() {
        assert_eq!(decode(b"\n"), Err(DecodeError::Empty));
        assert_eq!(decode(b""), Err(DecodeError::Empty));
    }

    #[test]
    fn test_split_fields_skips_repeated_spaces() {
        let fields = split_fields(Bytes::from_static(b"1  abc 5 "));
        let fields: Vec<&[u8]> = fields.iter().map(|f| f.as_ref()).collect();
        assert_eq!(fields, vec![&b"1"[..], &b"abc"[..], &b"5"[..]]);
    }
}
