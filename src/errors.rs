//! Per-request error kinds and their pre-formatted HTTP responses.
//!
//! An `ErrorKind` enum plus a `http_errors!` macro that maps `(self)` to
//! literal response byte slices computed at compile time, so the hot path
//! never formats a status line. Slowloris kills have no variant here —
//! no response is sent for that kind, only a counter bump and a close.

use std::{error, fmt};

/// One JSON-RPC chain's upstream failure modes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamErrorKind {
    Connect(String),
    Auth,
    Timeout,
    Parse(String),
    NodeError(String),
    CookieRead(String),
}

impl fmt::Display for UpstreamErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connect(msg) => write!(f, "upstream connect failed: {msg}"),
            Self::Auth => write!(f, "upstream rejected credentials"),
            Self::Timeout => write!(f, "upstream call timed out"),
            Self::Parse(msg) => write!(f, "upstream response unparseable: {msg}"),
            Self::NodeError(msg) => write!(f, "node returned error: {msg}"),
            Self::CookieRead(msg) => write!(f, "cookie file unreadable: {msg}"),
        }
    }
}

/// A per-connection error kind. Every fatal state-machine
/// transition carries one of these; [`ErrorKind::as_http`] renders the
/// fixed-text response the connection state machine queues for writing
/// before closing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    ClientParse,
    ClientTooLarge,
    ClientTimeout,
    ServerOverload,
    ServerBlocked,
    ServerRated,
    TlsError,
    Upstream(UpstreamErrorKind),
}

macro_rules! http_errors {
    ($($name:ident => $status_line:literal, $json:literal;)*) => {
        /// Render the fixed HTTP/1.1 response body for this error kind.
        /// `request_id` is spliced in as `X-Request-ID`; callers append
        /// `Connection: close` themselves since every error response forces it.
        /// `Content-Length` is computed from the literal's actual byte length
        /// rather than a hand-maintained constant, so it can never drift.
        pub fn as_http(&self, request_id: &str) -> Vec<u8> {
            let (status_line, json): (&str, &str) = match self {
                $(Self::$name => ($status_line, $json),)*
                Self::Upstream(_) => unreachable!("upstream errors render via JSON, not as_http"),
            };
            let len = json.len();
            let mut out = Vec::with_capacity(len + 160);
            out.extend_from_slice(b"HTTP/1.1 ");
            out.extend_from_slice(status_line.as_bytes());
            out.extend_from_slice(b"\r\nconnection: close\r\ncontent-type: application/json\r\ncontent-length: ");
            out.extend_from_slice(len.to_string().as_bytes());
            out.extend_from_slice(b"\r\nx-request-id: ");
            out.extend_from_slice(request_id.as_bytes());
            out.extend_from_slice(b"\r\n\r\n");
            out.extend_from_slice(json.as_bytes());
            out
        }
    };
}

impl ErrorKind {
    http_errors! {
        ClientParse => "400 Bad Request", r#"{"error":"malformed request"}"#;
        ClientTooLarge => "413 Payload Too Large", r#"{"error":"request too large"}"#;
        ClientTimeout => "408 Request Timeout", r#"{"error":"read timeout"}"#;
        ServerOverload => "503 Service Unavailable", r#"{"error":"overloaded"}"#;
        ServerBlocked => "403 Forbidden", r#"{"error":"forbidden"}"#;
        ServerRated => "429 Too Many Requests", r#"{"error":"rate limited"}"#;
        TlsError => "400 Bad Request", r#"{"error":"tls error"}"#;
    }

    /// HTTP status code carried by this error, for counters and logging.
    pub fn status(&self) -> u16 {
        match self {
            Self::ClientParse | Self::TlsError => 400,
            Self::ClientTimeout => 408,
            Self::ClientTooLarge => 413,
            Self::ServerBlocked => 403,
            Self::ServerRated => 429,
            Self::ServerOverload => 503,
            Self::Upstream(_) => 502,
        }
    }
}

impl error::Error for ErrorKind {}
impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Upstream(u) => write!(f, "{u}"),
            other => write!(f, "{other:?}"),
        }
    }
}

impl From<UpstreamErrorKind> for ErrorKind {
    fn from(u: UpstreamErrorKind) -> Self {
        ErrorKind::Upstream(u)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_request_id_and_status_line() {
        let body = ErrorKind::ServerRated.as_http("w0-1-1");
        let text = String::from_utf8(body).unwrap();
        assert!(text.starts_with("HTTP/1.1 429 Too Many Requests\r\n"));
        assert!(text.contains("x-request-id: w0-1-1\r\n"));
        assert!(text.ends_with(r#"{"error":"rate limited"}"#));
    }

    #[test]
    fn status_codes_map_to_expected_http_status() {
        assert_eq!(ErrorKind::ClientParse.status(), 400);
        assert_eq!(ErrorKind::ClientTooLarge.status(), 413);
        assert_eq!(ErrorKind::ClientTimeout.status(), 408);
        assert_eq!(ErrorKind::ServerOverload.status(), 503);
        assert_eq!(ErrorKind::ServerBlocked.status(), 403);
        assert_eq!(ErrorKind::ServerRated.status(), 429);
    }
}
