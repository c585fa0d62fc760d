//! Synchronous JSON-RPC broadcast client.
//!
//! A known bottleneck by design: each call opens a fresh blocking
//! `std::net::TcpStream`, applies read/write timeouts, and parses the
//! response with `serde_json` rather than hand-tracking brace/string state —
//! the envelope we send is fixed shape, but the node's response body is
//! untrusted and `serde_json::Value` already rejects anything malformed
//! before we look at `result`/`error`. The call runs synchronously, inline
//! on the worker's single `current_thread` runtime: a broadcast in flight
//! blocks that worker from accepting or servicing any other connection for
//! its duration. `tokio::task::spawn_blocking` isn't an option here — the
//! manager is reached through `Rc<RefCell<_>>`, which isn't `Send`, and the
//! worker has no secondary thread to hand blocking work to anyway. This is
//! an accepted trade-off for a single-chain broadcast endpoint, not an
//! oversight.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use base64::Engine;

use crate::config::RpcChain;
use crate::errors::UpstreamErrorKind;

const MAX_RESPONSE_BYTES: usize = 4 * 1024 * 1024;

/// One configured chain's client: connection parameters plus per-client
/// request/error counters.
pub struct RpcClient {
    host: String,
    port: u16,
    wallet: Option<String>,
    timeout: Duration,
    auth: AuthSource,
    pub requests: u64,
    pub errors: u64,
}

enum AuthSource {
    UserPass { user: String, password: String },
    CookieFile { path: String },
}

impl RpcClient {
    pub fn new(chain: &RpcChain) -> Result<Self, UpstreamErrorKind> {
        let auth = match (&chain.user, &chain.password, &chain.cookie_path) {
            (Some(user), Some(password), _) => {
                AuthSource::UserPass { user: user.clone(), password: password.clone() }
            }
            (_, _, Some(path)) => AuthSource::CookieFile { path: path.clone() },
            _ => return Err(UpstreamErrorKind::Auth),
        };
        Ok(Self {
            host: chain.host.clone(),
            port: chain.port,
            wallet: chain.wallet.clone(),
            timeout: Duration::from_secs(chain.timeout_secs),
            auth,
            requests: 0,
            errors: 0,
        })
    }

    fn basic_auth_header(&self) -> Result<String, UpstreamErrorKind> {
        let (user, secret) = match &self.auth {
            AuthSource::UserPass { user, password } => (user.clone(), password.clone()),
            AuthSource::CookieFile { path } => {
                let text = std::fs::read_to_string(path)
                    .map_err(|e| UpstreamErrorKind::CookieRead(e.to_string()))?;
                let (user, secret) = text
                    .trim()
                    .split_once(':')
                    .ok_or_else(|| UpstreamErrorKind::CookieRead("malformed cookie file".into()))?;
                (user.to_string(), secret.to_string())
            }
        };
        let token = base64::engine::general_purpose::STANDARD.encode(format!("{user}:{secret}"));
        Ok(format!("Basic {token}"))
    }

    fn path(&self) -> String {
        match &self.wallet {
            Some(name) => format!("/wallet/{name}"),
            None => "/".to_string(),
        }
    }

    /// Broadcast `hex` and return the node's txid, retrying once on a 401/403
    /// when cookie auth is used (the cookie may have rotated).
    pub fn sendrawtransaction(&mut self, hex: &str) -> Result<String, UpstreamErrorKind> {
        self.requests += 1;
        match self.call_once(hex) {
            Ok(txid) => Ok(txid),
            Err(UpstreamErrorKind::Auth) if matches!(self.auth, AuthSource::CookieFile { .. }) => {
                match self.call_once(hex) {
                    Ok(txid) => Ok(txid),
                    Err(e) => {
                        self.errors += 1;
                        Err(e)
                    }
                }
            }
            Err(e) => {
                self.errors += 1;
                Err(e)
            }
        }
    }

    fn call_once(&self, hex: &str) -> Result<String, UpstreamErrorKind> {
        let auth_header = self.basic_auth_header()?;
        let body = serde_json::json!({
            "jsonrpc": "1.0",
            "id": 1,
            "method": "sendrawtransaction",
            "params": [hex],
        })
        .to_string();

        let addr = format!("{}:{}", self.host, self.port);
        let mut stream = TcpStream::connect(&addr).map_err(|e| UpstreamErrorKind::Connect(e.to_string()))?;
        stream.set_read_timeout(Some(self.timeout)).ok();
        stream.set_write_timeout(Some(self.timeout)).ok();

        let request = format!(
            "POST {path} HTTP/1.1\r\nHost: {host}\r\nAuthorization: {auth}\r\nContent-Type: application/json\r\nContent-Length: {len}\r\nConnection: close\r\n\r\n{body}",
            path = self.path(),
            host = self.host,
            auth = auth_header,
            len = body.len(),
        );
        stream.write_all(request.as_bytes()).map_err(map_io_timeout)?;

        let mut buf = Vec::with_capacity(4096);
        let mut chunk = [0u8; 4096];
        loop {
            let n = stream.read(&mut chunk).map_err(map_io_timeout)?;
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
            if buf.len() > MAX_RESPONSE_BYTES {
                return Err(UpstreamErrorKind::Parse("response exceeded 4 MiB bound".into()));
            }
        }

        let (status, response_body) = split_http_response(&buf)
            .ok_or_else(|| UpstreamErrorKind::Parse("malformed HTTP response".into()))?;

        if status == 401 || status == 403 {
            return Err(UpstreamErrorKind::Auth);
        }

        extract_result_or_error(response_body)
    }
}

fn map_io_timeout(e: std::io::Error) -> UpstreamErrorKind {
    if matches!(e.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut) {
        UpstreamErrorKind::Timeout
    } else {
        UpstreamErrorKind::Connect(e.to_string())
    }
}

/// Split a raw HTTP/1.1 response into `(status_code, body_bytes)`.
fn split_http_response(raw: &[u8]) -> Option<(u16, &[u8])> {
    let header_end = memchr::memmem::find(raw, b"\r\n\r\n")? + 4;
    let status_line_end = memchr::memchr(b'\r', raw)?;
    let status_line = std::str::from_utf8(&raw[..status_line_end]).ok()?;
    let status: u16 = status_line.split_whitespace().nth(1)?.parse().ok()?;
    Some((status, &raw[header_end..]))
}

/// Extract `result` or `error.message` from a JSON-RPC envelope.
fn extract_result_or_error(body: &[u8]) -> Result<String, UpstreamErrorKind> {
    let value: serde_json::Value = serde_json::from_slice(body)
        .map_err(|e| UpstreamErrorKind::Parse(e.to_string()))?;

    if let Some(err) = value.get("error") {
        if !err.is_null() {
            let message = err
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("unknown node error")
                .to_string();
            return Err(UpstreamErrorKind::NodeError(message));
        }
    }
    value
        .get("result")
        .and_then(|r| r.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| UpstreamErrorKind::Parse("missing result field".into()))
}

/// One manager per process: owns one `RpcClient` per configured chain and
/// aggregate total/success/failure counters.
pub struct RpcManager {
    clients: Vec<(String, RpcClient)>,
    pub total: u64,
    pub success: u64,
    pub failure: u64,
}

impl RpcManager {
    pub fn new(chains: &[RpcChain]) -> Result<Self, UpstreamErrorKind> {
        let mut clients = Vec::with_capacity(chains.len());
        for chain in chains {
            clients.push((chain.name.clone(), RpcClient::new(chain)?));
        }
        Ok(Self { clients, total: 0, success: 0, failure: 0 })
    }

    /// Name of the first configured chain, used as the implicit broadcast
    /// target — one upstream per deployment.
    pub fn default_chain_name(&self) -> Option<String> {
        self.clients.first().map(|(name, _)| name.clone())
    }

    pub fn broadcast(&mut self, chain_name: &str, hex: &str) -> Result<String, UpstreamErrorKind> {
        self.total += 1;
        let Some((_, client)) = self.clients.iter_mut().find(|(name, _)| name == chain_name) else {
            self.failure += 1;
            return Err(UpstreamErrorKind::Connect(format!("unknown chain `{chain_name}`")));
        };
        match client.sendrawtransaction(hex) {
            Ok(txid) => {
                self.success += 1;
                Ok(txid)
            }
            Err(e) => {
                self.failure += 1;
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_response_extracts_status_and_body() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 13\r\n\r\n{\"ok\":true}\r\n";
        let (status, body) = split_http_response(raw).unwrap();
        assert_eq!(status, 200);
        assert!(body.starts_with(b"{\"ok\":true}"));
    }

    #[test]
    fn extract_result_from_success_envelope() {
        let body = br#"{"result":"abc123","error":null,"id":1}"#;
        assert_eq!(extract_result_or_error(body).unwrap(), "abc123");
    }

    #[test]
    fn extract_error_message_from_node_error() {
        let body = br#"{"result":null,"error":{"code":-25,"message":"bad-txns"},"id":1}"#;
        match extract_result_or_error(body) {
            Err(UpstreamErrorKind::NodeError(msg)) => assert_eq!(msg, "bad-txns"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn wallet_path_segment() {
        let chain = RpcChain {
            name: "main".into(),
            host: "127.0.0.1".into(),
            port: 8332,
            user: Some("u".into()),
            password: Some("p".into()),
            cookie_path: None,
            wallet: Some("mywallet".into()),
            timeout_secs: 5,
        };
        let client = RpcClient::new(&chain).unwrap();
        assert_eq!(client.path(), "/wallet/mywallet");
    }
}
