//! Bounded-memory byte queue and request-line/header parser.
//!
//! Zero-copy scanning (`memchr`-driven, byte-slice views rather than
//! per-token allocation) built around three primitives: `search` for a byte
//! pattern from a saved cursor, a `contiguous_view` of the first N bytes,
//! and `drain` of the first N bytes. The queue never copies the body unless
//! a caller asks for a drained, owned copy.

use crate::router::is_hex_byte;

/// Growable input buffer for one connection. Bytes are appended by socket
/// reads and removed from the front by `drain`; no user-space copy happens
/// on append or search, only on `drain`'s internal shift.
#[derive(Default)]
pub struct ByteQueue {
    buf: Vec<u8>,
}

impl ByteQueue {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Space to append into: callers read directly into the tail via
    /// `extend_from_slice`, keeping the queue a single contiguous `Vec`
    /// (trivially "zero-copy" in the sense that no intermediate buffer is
    /// needed before a `contiguous_view`).
    pub fn extend_from_slice(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// First `n` bytes, always contiguous since the queue is backed by one
    /// `Vec`. Panics if `n > len()` — callers must check first.
    pub fn contiguous_view(&self, n: usize) -> &[u8] {
        &self.buf[..n]
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    /// Search for `pattern` starting at byte offset `from`. Returns the
    /// absolute offset of the first match, or `None`.
    pub fn search(&self, pattern: &[u8], from: usize) -> Option<usize> {
        if from >= self.buf.len() {
            return None;
        }
        memchr::memmem::find(&self.buf[from..], pattern).map(|pos| pos + from)
    }

    /// Remove the first `n` bytes, shifting the remainder to the front.
    pub fn drain(&mut self, n: usize) -> Vec<u8> {
        let n = n.min(self.buf.len());
        self.buf.drain(..n).collect()
    }
}

/// The four-byte header terminator.
const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Advance the header-scan cursor after a failed search: `max(0, available
/// - 3)` so the pattern can never be missed when it straddles two reads.
pub fn next_scan_cursor(available: usize) -> usize {
    available.saturating_sub(3)
}

/// Search `queue` for the header terminator, resuming from `scanned`.
/// Returns `Some(offset_of_terminator_start)` or `None` plus the cursor the
/// caller should save for the next call.
pub fn scan_headers(queue: &ByteQueue, scanned: usize) -> (Option<usize>, usize) {
    match queue.search(HEADER_TERMINATOR, scanned) {
        Some(pos) => (Some(pos), pos),
        None => (None, next_scan_cursor(queue.len())),
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum ParseError {
    /// No space found on the request line, or method exceeds 15 bytes.
    BadRequestLine,
}

/// One parsed HTTP/1.1 request line plus the headers of interest. Owns its
/// `method`/`path`/connection state; everything else in the header block is
/// discarded once scanned (only `Content-Length` and `Connection` are
/// headers of interest).
#[derive(Debug, Clone)]
pub struct ParsedRequest {
    pub method: String,
    pub path: String,
    pub content_length: usize,
    pub keep_alive: bool,
}

const MAX_METHOD_LEN: usize = 15;

/// Parse the header block `headers` (bytes up to but excluding the
/// terminator). `http11` selects the keep-alive default (`true` for
/// HTTP/1.1, `false` otherwise) absent an explicit `Connection` header.
pub fn parse_headers(headers: &[u8], http11: bool) -> Result<ParsedRequest, ParseError> {
    let line_end = memchr::memchr(b'\r', headers).unwrap_or(headers.len());
    let line = &headers[..line_end];

    let first_space = memchr::memchr(b' ', line).ok_or(ParseError::BadRequestLine)?;
    if first_space > MAX_METHOD_LEN {
        return Err(ParseError::BadRequestLine);
    }
    let method = &line[..first_space];

    let rest = &line[first_space + 1..];
    let second_space = memchr::memchr(b' ', rest).unwrap_or(rest.len());
    let path = &rest[..second_space];

    let mut content_length = 0usize;
    let mut keep_alive = http11;

    for header_line in headers[line_end..].split(|&b| b == b'\n') {
        let header_line = trim_cr(header_line);
        if header_line.is_empty() {
            continue;
        }
        let Some(colon) = memchr::memchr(b':', header_line) else { continue };
        let name = &header_line[..colon];
        let value = trim_ascii(&header_line[colon + 1..]);

        if eq_ignore_case(name, b"content-length") {
            content_length = parse_content_length(value);
        } else if eq_ignore_case(name, b"connection") {
            if eq_ignore_case(value, b"close") {
                keep_alive = false;
            } else if eq_ignore_case(value, b"keep-alive") {
                keep_alive = true;
            }
        }
    }

    Ok(ParsedRequest {
        method: String::from_utf8_lossy(method).into_owned(),
        path: String::from_utf8_lossy(path).into_owned(),
        content_length,
        keep_alive,
    })
}

fn trim_cr(s: &[u8]) -> &[u8] {
    if s.last() == Some(&b'\r') { &s[..s.len() - 1] } else { s }
}

fn trim_ascii(s: &[u8]) -> &[u8] {
    let s = s.iter().position(|b| !b.is_ascii_whitespace()).map_or(&s[..0], |start| &s[start..]);
    let end = s.iter().rposition(|b| !b.is_ascii_whitespace()).map_or(0, |end| end + 1);
    &s[..end]
}

fn eq_ignore_case(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.to_ascii_lowercase() == y.to_ascii_lowercase())
}

/// `Content-Length` of `-1`, `+1`, `1abc`, or anything else unparseable
/// yields `0` and the caller proceeds without a body.
fn parse_content_length(value: &[u8]) -> usize {
    if value.is_empty() || !value[0].is_ascii_digit() {
        return 0;
    }
    let s = match std::str::from_utf8(value) {
        Ok(s) => s,
        Err(_) => return 0,
    };
    s.parse::<usize>().unwrap_or(0)
}

/// Incremental early path validation. Paths over 64 bytes that
/// are not `tx/`-prefixed must be entirely hex; this is checked as bytes
/// arrive, using the router's branch-free hex lookup table.
pub fn early_validate_path(path: &[u8]) -> bool {
    if path.len() <= 64 || path.starts_with(b"tx/") || path.starts_with(b"/tx/") {
        return true;
    }
    path.iter().all(|&b| is_hex_byte(b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminator_straddling_two_chunks() {
        let mut q = ByteQueue::new();
        q.extend_from_slice(b"GET / HTTP/1.1\r\nHost: x\r\n\r");
        let (found, cursor) = scan_headers(&q, 0);
        assert_eq!(found, None);
        q.extend_from_slice(b"\n");
        let (found, _) = scan_headers(&q, cursor);
        assert!(found.is_some());
    }

    #[test]
    fn content_length_edge_cases() {
        assert_eq!(parse_content_length(b"-1"), 0);
        assert_eq!(parse_content_length(b"+1"), 0);
        assert_eq!(parse_content_length(b"1abc"), 0);
        assert_eq!(parse_content_length(b"42"), 42);
    }

    #[test]
    fn parses_request_line_and_headers() {
        let req = parse_headers(b"GET /health HTTP/1.1\r\nHost: x\r\nContent-Length: 5\r\n", true).unwrap();
        assert_eq!(req.method, "GET");
        assert_eq!(req.path, "/health");
        assert_eq!(req.content_length, 5);
        assert!(req.keep_alive);
    }

    #[test]
    fn connection_close_overrides_default() {
        let req = parse_headers(b"GET / HTTP/1.1\r\nConnection: close\r\n", true).unwrap();
        assert!(!req.keep_alive);
    }

    #[test]
    fn method_over_15_bytes_is_rejected() {
        let line = b"THIS-METHOD-IS-WAY-TOO-LONG /x HTTP/1.1\r\n\r\n";
        assert_eq!(parse_headers(line, true), Err(ParseError::BadRequestLine));
    }

    #[test]
    fn missing_space_is_rejected() {
        assert_eq!(parse_headers(b"GET\r\n\r\n", true), Err(ParseError::BadRequestLine));
    }

    #[test]
    fn early_validation_exempts_short_and_tx_prefixed_paths() {
        assert!(early_validate_path(b"/short"));
        assert!(early_validate_path(b"/tx/not-hex-but-exempt"));
    }

    #[test]
    fn early_validation_requires_hex_past_64_bytes() {
        let hex: Vec<u8> = std::iter::repeat(b'a').take(65).collect();
        assert!(early_validate_path(&hex));
        let mut bad = hex.clone();
        bad[64] = b'z';
        assert!(!early_validate_path(&bad));
    }

    #[test]
    fn drain_removes_front_bytes() {
        let mut q = ByteQueue::new();
        q.extend_from_slice(b"abcdef");
        let drained = q.drain(3);
        assert_eq!(drained, b"abc");
        assert_eq!(q.as_slice(), b"def");
    }
}
