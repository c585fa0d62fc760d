//! HTTP/1.1 connection state machine: read → parse → validate → process →
//! write → (reset | close), plus the slowloris policer.
//!
//! Driven as one tokio task per accepted connection — the task's `run` loop
//! *is* the state machine; each `match` arm below corresponds to one
//! transition. State is tracked explicitly in [`ConnState`] so logging and
//! tests can assert on it directly.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;

use crate::acl::Verdict;
use crate::errors::ErrorKind;
use crate::io_stream::IoStream;
use crate::metrics::Counters;
use crate::parser::{self, ByteQueue};
use crate::ratelimit::RateLimiter;
use crate::router::{self, RouteTag};
use crate::rpc::RpcManager;
use crate::slots::{SlotPool, Tier};
use crate::static_files::StaticSet;

const READ_CHUNK: usize = 16 * 1024;
const READ_TIMEOUT: Duration = Duration::from_secs(30);
const TOTAL_DURATION_LIMIT: Duration = Duration::from_secs(120);
const THROUGHPUT_WINDOW: Duration = Duration::from_secs(5);
const MIN_BYTES_PER_WINDOW: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    ReadingHeaders,
    ReadingBody,
    Processing,
    WritingResponse,
    Closing,
}

/// Everything a worker shares across all of its connections. Single-threaded
///: plain `RefCell`/`Cell`, no atomics, no locks.
pub struct WorkerShared {
    pub worker_id: u32,
    pub slots: RefCell<SlotPool>,
    pub ratelimiter: RefCell<RateLimiter>,
    pub acl: RefCell<crate::acl::Acl>,
    pub counters: RefCell<Counters>,
    pub statics: StaticSet,
    pub rpc: RefCell<RpcManager>,
    pub max_buffer_size: usize,
    pub large_threshold: usize,
    pub huge_threshold: usize,
    pub acme_dir: Option<std::path::PathBuf>,
    pub draining: Cell<bool>,
    pub active_connections: Cell<u64>,
    pub(crate) request_counter: Cell<u64>,
    pub(crate) clock_start: Instant,
    /// Notified every time a connection or stream closes, so the worker's
    /// event loop can wake up and re-check the drain-complete condition
    /// even when no new accept or signal event would otherwise do so.
    pub drain_notify: tokio::sync::Notify,
}

impl WorkerShared {
    fn next_request_id(&self) -> String {
        let counter = self.request_counter.get();
        self.request_counter.set(counter.wrapping_add(1));
        let micros = self.clock_start.elapsed().as_micros() as u64;
        format!("{}-{:x}-{:x}", self.worker_id, micros, counter)
    }
}

pub struct Connection {
    shared: Rc<WorkerShared>,
    io: IoStream,
    peer_addr: String,

    input: ByteQueue,
    output: Vec<u8>,
    state: ConnState,

    tier: Tier,
    slot_held: bool,
    keep_alive: bool,

    headers_scanned: usize,
    content_length: usize,
    body_received: usize,
    method: String,
    path: String,

    request_id: String,
    start_time: Instant,
    last_progress_time: Instant,
    bytes_at_last_check: usize,
    request_count: u64,
}

enum ReadOutcome {
    Progressed,
    Eof,
    TimedOut,
    Io,
}

impl Connection {
    pub fn new(shared: Rc<WorkerShared>, io: IoStream, peer_addr: String) -> Self {
        let now = Instant::now();
        let request_id = shared.next_request_id();
        shared.active_connections.set(shared.active_connections.get() + 1);
        Self {
            shared,
            io,
            peer_addr,
            input: ByteQueue::new(),
            output: Vec::new(),
            state: ConnState::ReadingHeaders,
            tier: Tier::Normal,
            slot_held: true, // caller already acquired the NORMAL slot at accept
            keep_alive: true,
            headers_scanned: 0,
            content_length: 0,
            body_received: 0,
            method: String::new(),
            path: String::new(),
            request_id,
            start_time: now,
            last_progress_time: now,
            bytes_at_last_check: 0,
            request_count: 0,
        }
    }

    /// Drive the connection to completion. Returns once the socket is
    /// closed for any reason (clean close, fatal error, slowloris kill,
    /// EOF, or worker drain).
    pub async fn run(mut self) {
        loop {
            match self.state {
                ConnState::ReadingHeaders | ConnState::ReadingBody => {
                    if !self.read_tick().await {
                        break;
                    }
                }
                ConnState::Processing => self.process(),
                ConnState::WritingResponse => {
                    if !self.write_tick().await {
                        break;
                    }
                }
                ConnState::Closing => break,
            }
        }
        self.shared.active_connections.set(self.shared.active_connections.get().saturating_sub(1));
        if self.slot_held {
            self.shared.slots.borrow_mut().release(self.tier);
        }
        self.shared.drain_notify.notify_one();
    }

    /// One read event: slowloris checks, socket read, header/body scan,
    /// tier promotion. Returns `false` when the connection must close.
    async fn read_tick(&mut self) -> bool {
        if let Some(kind) = self.check_slowloris() {
            let _ = kind;
            self.shared.counters.borrow_mut().slowloris_kills += 1;
            return false;
        }

        match self.read_more().await {
            ReadOutcome::Eof => false,
            ReadOutcome::TimedOut => {
                self.shared.counters.borrow_mut().errors_timeout += 1;
                if self.request_count > 0 || self.state == ConnState::Processing {
                    self.queue_error(ErrorKind::ClientTimeout);
                    self.state = ConnState::WritingResponse;
                    true
                } else {
                    false
                }
            }
            ReadOutcome::Io => false,
            ReadOutcome::Progressed => self.after_read(),
        }
    }

    async fn read_more(&mut self) -> ReadOutcome {
        let mut chunk = [0u8; READ_CHUNK];
        match timeout(READ_TIMEOUT, self.io.read(&mut chunk)).await {
            Err(_) => ReadOutcome::TimedOut,
            Ok(Ok(0)) => ReadOutcome::Eof,
            Ok(Ok(n)) => {
                self.input.extend_from_slice(&chunk[..n]);
                self.last_progress_time = Instant::now();
                ReadOutcome::Progressed
            }
            Ok(Err(_)) => ReadOutcome::Io,
        }
    }

    /// Two independent slowloris checks: total connection
    /// duration, and windowed throughput. Runs on every read event.
    fn check_slowloris(&mut self) -> Option<()> {
        if self.start_time.elapsed() > TOTAL_DURATION_LIMIT {
            return Some(());
        }
        if self.last_progress_time.elapsed() >= THROUGHPUT_WINDOW {
            let now_buffered = self.input.len();
            let accrued = now_buffered.checked_sub(self.bytes_at_last_check);
            self.bytes_at_last_check = now_buffered;
            self.last_progress_time = Instant::now();
            match accrued {
                Some(n) if n >= MIN_BYTES_PER_WINDOW => {}
                _ => return Some(()),
            }
        }
        None
    }

    /// Reset the throughput baseline after a drain so legitimate large
    /// requests (whose bytes were just consumed) aren't mistaken for
    /// slowloris on the next window.
    fn reset_throughput_baseline(&mut self) {
        self.bytes_at_last_check = 0;
    }

    fn after_read(&mut self) -> bool {
        if self.state == ConnState::ReadingBody {
            return self.after_body_read();
        }

        if self.input.len() > self.shared.max_buffer_size {
            self.queue_error(ErrorKind::ClientTooLarge);
            self.state = ConnState::WritingResponse;
            return true;
        }

        if !self.early_validate() {
            self.queue_error(ErrorKind::ClientParse);
            self.state = ConnState::WritingResponse;
            return true;
        }

        if !self.promote_tier() {
            self.queue_error(ErrorKind::ServerOverload);
            self.shared.counters.borrow_mut().slot_promotion_failures += 1;
            self.state = ConnState::WritingResponse;
            return true;
        }

        let (found, cursor) = parser::scan_headers(&self.input, self.headers_scanned);
        self.headers_scanned = cursor;
        let Some(term_pos) = found else {
            return true; // more bytes needed
        };

        let header_bytes = self.input.contiguous_view(term_pos).to_vec();
        let parsed = match parser::parse_headers(&header_bytes, true) {
            Ok(p) => p,
            Err(_) => {
                self.queue_error(ErrorKind::ClientParse);
                self.state = ConnState::WritingResponse;
                return true;
            }
        };

        if parsed.content_length > self.shared.max_buffer_size {
            self.queue_error(ErrorKind::ClientTooLarge);
            self.state = ConnState::WritingResponse;
            return true;
        }

        self.method = parsed.method;
        self.path = parsed.path;
        self.content_length = parsed.content_length;
        self.keep_alive = parsed.keep_alive;

        self.input.drain(term_pos + 4);
        self.reset_throughput_baseline();
        self.demote_to_normal();

        if self.content_length == 0 {
            self.state = ConnState::Processing;
        } else {
            self.body_received = self.input.len().min(self.content_length);
            if self.body_received >= self.content_length {
                self.input.drain(self.content_length);
                self.reset_throughput_baseline();
                self.demote_to_normal();
                self.state = ConnState::Processing;
            } else {
                self.state = ConnState::ReadingBody;
            }
        }
        true
    }

    fn after_body_read(&mut self) -> bool {
        let remaining = self.content_length.saturating_sub(self.body_received);
        let available = self.input.len().min(remaining);
        self.body_received += available;
        if self.body_received < self.content_length {
            if !self.promote_tier() {
                self.queue_error(ErrorKind::ServerOverload);
                self.shared.counters.borrow_mut().slot_promotion_failures += 1;
                self.state = ConnState::WritingResponse;
            }
            return true;
        }
        self.input.drain(available);
        self.reset_throughput_baseline();
        self.demote_to_normal();
        self.state = ConnState::Processing;
        true
    }

    fn early_validate(&self) -> bool {
        let Some(end) = self.input.search(b" ", 0) else { return true };
        let Some(second) = self.input.search(b" ", end + 1) else { return true };
        let path = &self.input.contiguous_view(second)[end + 1..];
        parser::early_validate_path(path)
    }

    /// `promote(current_tier, T(bytes_buffered))`. Failure does
    /// not mutate the current slot — caller responds 503 and closes.
    fn promote_tier(&mut self) -> bool {
        let target = crate::slots::classify(self.input.len(), self.shared.large_threshold, self.shared.huge_threshold);
        if target == self.tier {
            return true;
        }
        let ok = self.shared.slots.borrow_mut().promote(self.tier, target);
        if ok {
            self.tier = target;
        }
        ok
    }

    /// Demote to NORMAL once headers (and any body) are fully consumed, so
    /// expensive slots free before the (possibly slow) processing/write
    /// phase. If NORMAL is full, the connection loses its slot
    /// entirely and must close.
    fn demote_to_normal(&mut self) {
        if self.tier == Tier::Normal {
            return;
        }
        let mut slots = self.shared.slots.borrow_mut();
        slots.release(self.tier);
        if slots.acquire(Tier::Normal) {
            self.tier = Tier::Normal;
        } else {
            self.slot_held = false;
        }
    }

    fn process(&mut self) {
        if !self.slot_held {
            self.state = ConnState::Closing;
            return;
        }
        let (status, body, content_type) = self.route_and_build();
        self.shared.counters.borrow_mut().record_status(status);
        self.write_response(status, content_type, &body);
        self.state = ConnState::WritingResponse;
    }

    fn route_and_build(&mut self) -> (u16, Vec<u8>, &'static str) {
        let tag = router::route(self.path.as_bytes());
        match tag {
            RouteTag::Health | RouteTag::Ready | RouteTag::Alive => {
                let active = self.shared.active_connections.get();
                (200, self.shared.counters.borrow().render_health_json(true, active).into_bytes(), "application/json")
            }
            RouteTag::Version => (200, env!("CARGO_PKG_VERSION").as_bytes().to_vec(), "text/plain"),
            RouteTag::Metrics => {
                let active = self.shared.active_connections.get();
                (200, self.shared.counters.borrow().render_prometheus_text(active).into_bytes(), "text/plain")
            }
            RouteTag::AcmeChallenge { token_start, token_end } => self.serve_acme_challenge(token_start, token_end),
            RouteTag::Broadcast { hex_start } => self.serve_broadcast(hex_start),
            RouteTag::Result { .. } => {
                let body = self.shared.statics.body_for(&tag).unwrap_or(&[]).to_vec();
                (200, body, "text/html")
            }
            RouteTag::Home | RouteTag::Docs | RouteTag::Status | RouteTag::Logos => {
                let body = self.shared.statics.body_for(&tag).unwrap_or(&[]).to_vec();
                (200, body, "text/html")
            }
            RouteTag::Error => {
                let body = self.shared.statics.body_for(&tag).unwrap_or(b"not found").to_vec();
                (404, body, "text/html")
            }
        }
    }

    /// Serve a `.well-known/acme-challenge/{token}` file: token restricted to
    /// `[A-Za-z0-9_-]`, path traversal rejected, size-capped at 4 KiB, served
    /// as `text/plain`.
    fn serve_acme_challenge(&self, token_start: usize, token_end: usize) -> (u16, Vec<u8>, &'static str) {
        let token = &self.path[token_start..token_end];
        let valid = !token.is_empty()
            && !token.contains("..")
            && !token.contains('/')
            && !token.contains('\\')
            && token.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-');
        let Some(dir) = &self.shared.acme_dir else {
            return (404, b"not found".to_vec(), "text/plain");
        };
        if !valid {
            return (400, b"invalid token".to_vec(), "text/plain");
        }
        match std::fs::read(dir.join(token)) {
            Ok(bytes) if bytes.len() <= 4096 => (200, bytes, "text/plain"),
            Ok(_) => (413, b"challenge file too large".to_vec(), "text/plain"),
            Err(_) => (404, b"not found".to_vec(), "text/plain"),
        }
    }

    /// On success, renders the static broadcast page with the returned txid
    /// spliced in; on failure, surfaces a structured JSON body describing
    /// the `UPSTREAM_*` error kind.
    fn serve_broadcast(&self, hex_start: usize) -> (u16, Vec<u8>, &'static str) {
        let hex = &self.path[hex_start..];
        let mut rpc = self.shared.rpc.borrow_mut();
        // First configured chain is the default target; multi-chain
        // selection by path prefix is not supported — one upstream per
        // deployment, named implicitly via `[server]`.
        let Some(chain_name) = rpc.default_chain_name() else {
            let body = serde_json::json!({ "error": "no upstream chain configured" }).to_string();
            return (502, body.into_bytes(), "application/json");
        };
        let result = rpc.broadcast(&chain_name, hex);
        // Surface the manager's own per-chain totals rather than
        // re-deriving success/failure here, so there is one source of truth.
        let mut counters = self.shared.counters.borrow_mut();
        counters.rpc_requests_total = rpc.total;
        counters.rpc_success_total = rpc.success;
        counters.rpc_failure_total = rpc.failure;
        drop(counters);
        match result {
            Ok(txid) => (200, self.shared.statics.render_broadcast(&txid), "text/html"),
            Err(e) => {
                let body = serde_json::json!({ "error": e.to_string() }).to_string();
                (502, body.into_bytes(), "application/json")
            }
        }
    }

    fn queue_error(&mut self, kind: ErrorKind) {
        self.keep_alive = false;
        let mut counters = self.shared.counters.borrow_mut();
        counters.record_status(kind.status());
        if kind == ErrorKind::ClientParse {
            counters.errors_parse += 1;
        }
        drop(counters);
        self.output = kind.as_http(&self.request_id);
    }

    /// Assemble a response under a "cork" discipline: headers and
    /// body are appended to one buffer so a single `write_all` coalesces
    /// them into one segment. All responses carry
    /// `X-Request-ID` and a `Connection` header matching keep-alive state.
    fn write_response(&mut self, status: u16, content_type: &str, body: &[u8]) {
        let status_text = status_text(status);
        let connection = if self.keep_alive { "keep-alive" } else { "close" };
        let mut head = format!(
            "HTTP/1.1 {status} {status_text}\r\ncontent-type: {content_type}\r\ncontent-length: {}\r\ncache-control: no-store\r\nx-request-id: {}\r\nconnection: {connection}\r\n\r\n",
            body.len(),
            self.request_id,
        )
        .into_bytes();
        head.extend_from_slice(body);
        self.output = head;
    }

    async fn write_tick(&mut self) -> bool {
        if self.output.is_empty() {
            return self.finish_write();
        }
        match self.io.write_all(&self.output).await {
            Ok(()) => {
                self.output.clear();
                self.finish_write()
            }
            Err(_) => false,
        }
    }

    fn finish_write(&mut self) -> bool {
        self.request_count += 1;
        if self.keep_alive {
            // The first request on a connection establishes it, not reuses
            // it; only the second and later requests count as a reuse.
            if self.request_count > 1 {
                self.shared.counters.borrow_mut().keepalive_reuses += 1;
            }
            self.reset_for_keep_alive()
        } else {
            self.state = ConnState::Closing;
            true
        }
    }

    /// Keep-alive reset: free prior path, clear cursors,
    /// regenerate request_id, reset timing/throughput, ensure a NORMAL slot
    /// is held. If NORMAL cannot be re-acquired, the connection closes
    /// without a specific status code.
    fn reset_for_keep_alive(&mut self) -> bool {
        if self.tier != Tier::Normal {
            let mut slots = self.shared.slots.borrow_mut();
            slots.release(self.tier);
            if slots.acquire(Tier::Normal) {
                self.tier = Tier::Normal;
            } else {
                self.slot_held = false;
                self.state = ConnState::Closing;
                return true;
            }
        } else if !self.slot_held {
            if self.shared.slots.borrow_mut().acquire(Tier::Normal) {
                self.slot_held = true;
            } else {
                self.state = ConnState::Closing;
                return true;
            }
        }

        self.method.clear();
        self.path.clear();
        self.headers_scanned = 0;
        self.content_length = 0;
        self.body_received = 0;
        self.keep_alive = true;
        self.request_id = self.shared.next_request_id();
        self.start_time = Instant::now();
        self.last_progress_time = self.start_time;
        self.bytes_at_last_check = 0;
        self.state = ConnState::ReadingHeaders;
        true
    }
}

fn status_text(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        408 => "Request Timeout",
        413 => "Payload Too Large",
        429 => "Too Many Requests",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

/// Per-accept admission checks shared by the plain and TLS listeners: drain
/// state, ACL, rate limit, then a NORMAL slot, in that order. Returns
/// `Ok(())` if admitted (with a NORMAL slot already held), or the error kind
/// whose pre-formatted response the listener should write before closing.
pub fn admit(shared: &WorkerShared, peer_ip: &str) -> Result<(), ErrorKind> {
    if shared.draining.get() {
        return Err(ErrorKind::ServerOverload);
    }
    match shared.acl.borrow().check(peer_ip) {
        Verdict::Block => {
            shared.counters.borrow_mut().connections_rejected_blocked += 1;
            return Err(ErrorKind::ServerBlocked);
        }
        Verdict::Allow | Verdict::Neutral => {}
    }
    if !shared.ratelimiter.borrow_mut().allow(peer_ip) {
        shared.counters.borrow_mut().connections_rejected_rated += 1;
        return Err(ErrorKind::ServerRated);
    }
    if !shared.slots.borrow_mut().acquire(Tier::Normal) {
        shared.counters.borrow_mut().connections_rejected_overload += 1;
        return Err(ErrorKind::ServerOverload);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_shared() -> Rc<WorkerShared> {
        Rc::new(WorkerShared {
            worker_id: 0,
            slots: RefCell::new(SlotPool::new(2, 2, 2)),
            ratelimiter: RefCell::new(RateLimiter::new(0.0, None)),
            acl: RefCell::new(crate::acl::Acl::empty()),
            counters: RefCell::new(Counters::default()),
            statics: StaticSet::empty(),
            rpc: RefCell::new(RpcManager::new(&[]).unwrap()),
            max_buffer_size: 16 * 1024 * 1024,
            large_threshold: 8 * 1024,
            huge_threshold: 256 * 1024,
            acme_dir: None,
            draining: Cell::new(false),
            active_connections: Cell::new(0),
            request_counter: Cell::new(0),
            clock_start: Instant::now(),
            drain_notify: tokio::sync::Notify::new(),
        })
    }

    #[test]
    fn admit_rejects_when_draining() {
        let shared = test_shared();
        shared.draining.set(true);
        assert_eq!(admit(&shared, "1.2.3.4"), Err(ErrorKind::ServerOverload));
    }

    #[test]
    fn admit_acquires_normal_slot() {
        let shared = test_shared();
        assert!(admit(&shared, "1.2.3.4").is_ok());
        assert_eq!(shared.slots.borrow().current(Tier::Normal), 1);
    }

    #[test]
    fn admit_rejects_blocked_ip() {
        use std::io::Write;
        let shared = test_shared();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"1.2.3.4\n").unwrap();
        let blocked = crate::acl::AddrList::load_file(file.path()).unwrap();
        shared.acl.replace(crate::acl::Acl::new(blocked, crate::acl::AddrList::empty()));
        assert_eq!(admit(&shared, "1.2.3.4"), Err(ErrorKind::ServerBlocked));
        assert_eq!(shared.counters.borrow().connections_rejected_blocked, 1);
        assert!(admit(&shared, "5.6.7.8").is_ok());
    }

    #[test]
    fn request_id_format() {
        let shared = test_shared();
        let id = shared.next_request_id();
        let parts: Vec<&str> = id.split('-').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "0");
    }
}
