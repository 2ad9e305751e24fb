//! HTTP field accessors over raw payload bytes
//!
//! The pipeline never parses HTTP itself. Handlers that need a cookie, a
//! status code or a path call these pure functions on a message payload.
//! Only the head (start line + headers) is inspected; the body is opaque.
//!
//! Header names compare case-insensitively. Header values that are not
//! valid UTF-8 are treated as absent.

use bytes::{Bytes, BytesMut};

/// Request header carrying cookies
pub const COOKIE: &str = "Cookie";
/// Response header setting cookies
pub const SET_COOKIE: &str = "Set-Cookie";

const MAX_HEADERS: usize = 128;

/// Request method (`GET`, `POST`, ...)
pub fn method(payload: &[u8]) -> Option<&str> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);
    // A partial parse still fills the start line
    req.parse(payload).ok()?;
    req.method
}

/// Request target (`/login?next=/`)
pub fn path(payload: &[u8]) -> Option<&str> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);
    req.parse(payload).ok()?;
    req.path
}

/// Response status code
pub fn status(payload: &[u8]) -> Option<u16> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut resp = httparse::Response::new(&mut headers);
    resp.parse(payload).ok()?;
    resp.code
}

/// First value of header `name`
pub fn header<'a>(payload: &'a [u8], name: &str) -> Option<&'a str> {
    header_lines(payload)
        .find(|h| h.name.eq_ignore_ascii_case(name))
        .map(|h| h.value)
}

/// Payload after the head, empty when there is none
pub fn body(payload: &[u8]) -> &[u8] {
    match head_end(payload) {
        Some(end) => &payload[end..],
        None => &[],
    }
}

/// Value of cookie `name` as carried by header `header_name`
///
/// Use [`COOKIE`] for requests and [`SET_COOKIE`] for responses. Every
/// header with that name is searched, in order.
///
/// # Example
///
/// ```
/// use kaiku_core::http;
///
/// let req = b"GET / HTTP/1.1\r\nCookie: theme=dark; JSESSIONID=abc\r\n\r\n";
/// assert_eq!(http::cookie(req, "JSESSIONID", http::COOKIE).as_deref(), Some("abc"));
///
/// let resp = b"HTTP/1.1 200 OK\r\nSet-Cookie: JSESSIONID=xyz; Path=/\r\n\r\n";
/// assert_eq!(http::cookie(resp, "JSESSIONID", http::SET_COOKIE).as_deref(), Some("xyz"));
/// ```
pub fn cookie(payload: &[u8], name: &str, header_name: &str) -> Option<String> {
    header_lines(payload)
        .filter(|h| h.name.eq_ignore_ascii_case(header_name))
        .find_map(|h| cookie_pairs(h.value).find(|(k, _)| *k == name).map(|(_, v)| v))
        .map(str::to_string)
}

/// Set cookie `name` to `value` in the request's `Cookie` header
///
/// Replaces the existing pair, appends to an existing `Cookie` header, or
/// adds the header when there is none. Returns a new payload.
pub fn set_cookie(payload: &[u8], name: &str, value: &str) -> Bytes {
    let rebuilt = match header(payload, COOKIE) {
        Some(existing) => {
            let mut found = false;
            let mut pairs: Vec<String> = cookie_pairs(existing)
                .map(|(k, v)| {
                    if k == name {
                        found = true;
                        format!("{k}={value}")
                    } else {
                        format!("{k}={v}")
                    }
                })
                .collect();
            if !found {
                pairs.push(format!("{name}={value}"));
            }
            pairs.join("; ")
        }
        None => format!("{name}={value}"),
    };
    set_header(payload, COOKIE, &rebuilt)
}

/// Set header `name` to `value`
///
/// Rewrites the first matching header in place (keeping its original name
/// spelling) or appends a new one at the end of the head. A payload with no
/// head terminator is treated as all head.
pub fn set_header(payload: &[u8], name: &str, value: &str) -> Bytes {
    let head_len = head_end(payload).unwrap_or(payload.len());
    let mut out = BytesMut::with_capacity(payload.len() + name.len() + value.len() + 4);

    let target = header_lines(payload).find(|h| h.name.eq_ignore_ascii_case(name));
    match target {
        Some(h) => {
            out.extend_from_slice(&payload[..h.start]);
            out.extend_from_slice(h.name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(&payload[h.end..]);
        }
        None => {
            let insert_at = blank_line_start(payload, head_len);
            out.extend_from_slice(&payload[..insert_at]);
            if insert_at > 0 && !payload[..insert_at].ends_with(b"\n") {
                out.extend_from_slice(b"\r\n");
            }
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
            out.extend_from_slice(&payload[insert_at..]);
        }
    }
    out.freeze()
}

/// One header line inside the head
struct HeaderLine<'a> {
    name: &'a str,
    value: &'a str,
    /// Offset of the first byte of the line
    start: usize,
    /// Offset just past the value (before the line ending)
    end: usize,
}

/// Iterate header lines, skipping the start line and stopping at the blank line
fn header_lines(payload: &[u8]) -> impl Iterator<Item = HeaderLine<'_>> {
    let head_len = head_end(payload).unwrap_or(payload.len());
    let head = &payload[..head_len];

    let mut offset = 0;
    let mut lines = Vec::new();
    for raw in head.split(|&b| b == b'\n') {
        let start = offset;
        offset += raw.len() + 1;
        let line = raw.strip_suffix(b"\r").unwrap_or(raw);
        if start == 0 || line.is_empty() {
            continue;
        }
        let Some(colon) = line.iter().position(|&b| b == b':') else {
            continue;
        };
        let (Ok(name), Ok(value)) = (
            std::str::from_utf8(&line[..colon]),
            std::str::from_utf8(&line[colon + 1..]),
        ) else {
            continue;
        };
        lines.push(HeaderLine {
            name: name.trim(),
            value: value.trim(),
            start,
            end: start + line.len(),
        });
    }
    lines.into_iter()
}

/// `name=value` pairs of a cookie header value
fn cookie_pairs(value: &str) -> impl Iterator<Item = (&str, &str)> {
    value
        .split(';')
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| (k.trim(), v.trim()))
}

/// Offset just past the blank line ending the head
fn head_end(payload: &[u8]) -> Option<usize> {
    let crlf = find(payload, b"\r\n\r\n").map(|i| (i, i + 4));
    let lf = find(payload, b"\n\n").map(|i| (i, i + 2));
    // The body may contain either terminator; the earliest one ends the head
    match (crlf, lf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a.1 } else { b.1 }),
        (a, b) => a.or(b).map(|(_, end)| end),
    }
}

/// Offset where the blank line ending the head starts
fn blank_line_start(payload: &[u8], head_len: usize) -> usize {
    let head = &payload[..head_len];
    if head.ends_with(b"\r\n\r\n") {
        head_len - 2
    } else if head.ends_with(b"\n\n") {
        head_len - 1
    } else {
        head_len
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}
