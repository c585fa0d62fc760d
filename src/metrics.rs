//! Worker-owned counters and their text/JSON emitters.
//!
//! Non-atomic: a worker is single-threaded, so these are plain `u64` fields
//! bumped directly from the event loop. `/metrics` and the health endpoints
//! format directly off this struct; the emitted format is intentionally
//! minimal rather than full Prometheus exposition-format compliant.

use std::fmt::Write as _;
use std::time::{SystemTime, UNIX_EPOCH};

/// One worker's counters. Never shared across workers or threads.
#[derive(Debug, Default)]
pub struct Counters {
    pub requests_total: u64,
    pub status_2xx: u64,
    pub status_3xx: u64,
    pub status_4xx: u64,
    pub status_5xx: u64,

    pub errors_parse: u64,
    pub errors_timeout: u64,
    pub errors_tls: u64,
    pub tls_handshake_errors: u64,

    pub slot_promotion_failures: u64,
    pub slowloris_kills: u64,

    pub connections_rejected_blocked: u64,
    pub connections_rejected_rated: u64,
    pub connections_rejected_overload: u64,

    pub keepalive_reuses: u64,

    pub streams_opened: u64,
    pub rst_stream_sent: u64,
    pub goaway_sent: u64,

    pub rpc_requests_total: u64,
    pub rpc_success_total: u64,
    pub rpc_failure_total: u64,

    /// Gauge: currently open HTTP/2 streams across this worker's sessions.
    pub active_streams: u64,

    /// Unix timestamp of TLS certificate expiry, for the `/metrics` gauge.
    /// `None` when TLS is disabled.
    pub tls_cert_expiry: Option<u64>,
}

impl Counters {
    pub fn record_status(&mut self, status: u16) {
        self.requests_total += 1;
        match status {
            200..=299 => self.status_2xx += 1,
            300..=399 => self.status_3xx += 1,
            400..=499 => self.status_4xx += 1,
            _ => self.status_5xx += 1,
        }
    }

    /// Plain `key value` lines, one metric per line — the minimal
    /// self-evidently-correct `/metrics` body. `active_connections` is
    /// passed in rather than stored here: the live count is the worker's
    /// own `WorkerShared::active_connections`, not a counter this struct
    /// tracks independently.
    pub fn render_prometheus_text(&self, active_connections: u64) -> String {
        let mut out = String::with_capacity(1024);
        macro_rules! line {
            ($name:literal, $value:expr) => {
                let _ = writeln!(out, concat!($name, " {}"), $value);
            };
        }
        line!("txrelayd_requests_total", self.requests_total);
        line!("txrelayd_status_2xx", self.status_2xx);
        line!("txrelayd_status_3xx", self.status_3xx);
        line!("txrelayd_status_4xx", self.status_4xx);
        line!("txrelayd_status_5xx", self.status_5xx);
        line!("txrelayd_errors_parse", self.errors_parse);
        line!("txrelayd_errors_timeout", self.errors_timeout);
        line!("txrelayd_errors_tls", self.errors_tls);
        line!("txrelayd_tls_handshake_errors", self.tls_handshake_errors);
        line!("txrelayd_slot_promotion_failures", self.slot_promotion_failures);
        line!("txrelayd_slowloris_kills", self.slowloris_kills);
        line!("txrelayd_connections_rejected_blocked", self.connections_rejected_blocked);
        line!("txrelayd_connections_rejected_rated", self.connections_rejected_rated);
        line!("txrelayd_connections_rejected_overload", self.connections_rejected_overload);
        line!("txrelayd_keepalive_reuses", self.keepalive_reuses);
        line!("txrelayd_streams_opened", self.streams_opened);
        line!("txrelayd_rst_stream_sent", self.rst_stream_sent);
        line!("txrelayd_goaway_sent", self.goaway_sent);
        line!("txrelayd_rpc_requests_total", self.rpc_requests_total);
        line!("txrelayd_rpc_success_total", self.rpc_success_total);
        line!("txrelayd_rpc_failure_total", self.rpc_failure_total);
        line!("txrelayd_active_connections", active_connections);
        line!("txrelayd_active_streams", self.active_streams);
        if let Some(expiry) = self.tls_cert_expiry {
            line!("txrelayd_tls_cert_expiry_seconds", expiry);
        }
        out
    }

    /// Small `serde_json`-backed object for `/health`, `/ready`, `/alive`.
    pub fn render_health_json(&self, ok: bool, active_connections: u64) -> String {
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
        serde_json::json!({
            "ok": ok,
            "timestamp": now,
            "active_connections": active_connections,
            "requests_total": self.requests_total,
        })
        .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_status_buckets_correctly() {
        let mut c = Counters::default();
        c.record_status(200);
        c.record_status(404);
        c.record_status(503);
        assert_eq!(c.requests_total, 3);
        assert_eq!(c.status_2xx, 1);
        assert_eq!(c.status_4xx, 1);
        assert_eq!(c.status_5xx, 1);
    }

    #[test]
    fn prometheus_text_contains_all_named_counters() {
        let mut c = Counters::default();
        c.slowloris_kills = 2;
        let text = c.render_prometheus_text(3);
        assert!(text.contains("txrelayd_slowloris_kills 2"));
        assert!(text.contains("txrelayd_requests_total 0"));
        assert!(text.contains("txrelayd_active_connections 3"));
    }

    #[test]
    fn health_json_is_parseable() {
        let c = Counters::default();
        let text = c.render_health_json(true, 5);
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["ok"], true);
        assert_eq!(value["active_connections"], 5);
    }
}
