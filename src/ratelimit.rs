//! Per-IP token-bucket rate limiter with TTL reclamation.
//!
//! Single-threaded per worker, no locking. Keys are 16-byte
//! addresses with IPv4 mapped into IPv6 space, matching the ACL's encoding
//! (`crate::acl`) so both components share one notion of "address".

use std::net::IpAddr;
use std::str::FromStr;
use std::time::Instant;

const TABLE_BUCKETS: usize = 4099;
const MAX_ENTRIES: usize = 10_000;
const TTL_SECS: u64 = 60;

pub fn ipv4_mapped(octets: [u8; 4]) -> [u8; 16] {
    let mut addr = [0u8; 16];
    addr[10] = 0xff;
    addr[11] = 0xff;
    addr[12..16].copy_from_slice(&octets);
    addr
}

/// Parse a textual IP address into its 16-byte key, mapping IPv4 into the
/// IPv4-mapped IPv6 range. Returns `None` on unparseable input so callers can
/// fail open rather than reject on a parse error.
pub fn parse_key(ip: &str) -> Option<[u8; 16]> {
    match IpAddr::from_str(ip).ok()? {
        IpAddr::V4(v4) => Some(ipv4_mapped(v4.octets())),
        IpAddr::V6(v6) => Some(v6.octets()),
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf29ce484222325;
    const PRIME: u64 = 0x100000001b3;
    let mut hash = OFFSET;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

struct Entry {
    addr: [u8; 16],
    tokens: f64,
    last_update: f64,
    last_request: u64,
}

/// Per-worker token-bucket table. `rate == 0.0` disables limiting entirely
/// (every `allow` call returns `true` without touching the table).
pub struct RateLimiter {
    rate: f64,
    burst: f64,
    buckets: Vec<Vec<Entry>>,
    count: usize,
    clock_start: Instant,
}

impl RateLimiter {
    /// `burst` defaults to `rate` when `None`.
    pub fn new(rate: f64, burst: Option<f64>) -> Self {
        Self {
            rate,
            burst: burst.unwrap_or(rate),
            buckets: (0..TABLE_BUCKETS).map(|_| Vec::new()).collect(),
            count: 0,
            clock_start: Instant::now(),
        }
    }

    fn now(&self) -> f64 {
        self.clock_start.elapsed().as_secs_f64()
    }

    fn bucket_index(addr: &[u8; 16]) -> usize {
        (fnv1a(addr) as usize) % TABLE_BUCKETS
    }

    /// `allow(ip)`: true if the request may proceed. Fails open on
    /// unparseable IPs and when the limiter is disabled (`rate == 0`).
    pub fn allow(&mut self, ip: &str) -> bool {
        if self.rate == 0.0 {
            return true;
        }
        let Some(addr) = parse_key(ip) else {
            return true;
        };
        self.allow_key(addr)
    }

    fn allow_key(&mut self, addr: [u8; 16]) -> bool {
        let now = self.now();
        let now_secs = now as u64;
        let idx = Self::bucket_index(&addr);

        if let Some(entry) = self.buckets[idx].iter_mut().find(|e| e.addr == addr) {
            entry.tokens = (entry.tokens + (now - entry.last_update) * self.rate).min(self.burst);
            entry.last_update = now;
            entry.last_request = now_secs;
            return if entry.tokens >= 1.0 {
                entry.tokens -= 1.0;
                true
            } else {
                false
            };
        }

        if self.count >= MAX_ENTRIES {
            self.cleanup();
            if self.count >= MAX_ENTRIES {
                // Fail-safe: table is saturated even after reclamation.
                return false;
            }
        }

        let mut tokens = self.burst;
        let allowed = tokens >= 1.0;
        if allowed {
            tokens -= 1.0;
        }
        self.buckets[idx].push(Entry {
            addr,
            tokens,
            last_update: now,
            last_request: now_secs,
        });
        self.count += 1;
        allowed
    }

    /// Remove entries whose `last_request` is older than the 60 s TTL.
    /// Invoked by the worker's periodic timer and, opportunistically, when
    /// the table is full.
    pub fn cleanup(&mut self) {
        let now_secs = self.now() as u64;
        for bucket in &mut self.buckets {
            let before = bucket.len();
            bucket.retain(|e| now_secs.saturating_sub(e.last_request) <= TTL_SECS);
            self.count -= before - bucket.len();
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_limiter_always_allows() {
        let mut rl = RateLimiter::new(0.0, None);
        for _ in 0..100 {
            assert!(rl.allow("1.2.3.4"));
        }
    }

    #[test]
    fn unparseable_ip_fails_open() {
        let mut rl = RateLimiter::new(1.0, Some(1.0));
        assert!(rl.allow("not-an-ip"));
    }

    #[test]
    fn burst_defaults_to_rate() {
        let rl = RateLimiter::new(7.0, None);
        assert_eq!(rl.burst, 7.0);
    }

    #[test]
    fn rate_5_burst_10_allows_ten_then_denies() {
        let mut rl = RateLimiter::new(5.0, Some(10.0));
        let addr = ipv4_mapped([10, 0, 0, 1]);
        for _ in 0..10 {
            assert!(rl.allow_key(addr));
        }
        assert!(!rl.allow_key(addr));
    }

    #[test]
    fn tokens_stay_within_bounds() {
        let mut rl = RateLimiter::new(5.0, Some(10.0));
        let addr = ipv4_mapped([10, 0, 0, 2]);
        for _ in 0..50 {
            rl.allow_key(addr);
        }
        let entry = rl.buckets[RateLimiter::bucket_index(&addr)]
            .iter()
            .find(|e| e.addr == addr)
            .unwrap();
        assert!(entry.tokens >= 0.0 && entry.tokens <= rl.burst);
    }

    #[test]
    fn cleanup_evicts_stale_entries() {
        let mut rl = RateLimiter::new(1.0, Some(1.0));
        let addr = ipv4_mapped([192, 0, 2, 1]);
        rl.allow_key(addr);
        assert_eq!(rl.len(), 1);
        // Force an entry into the past relative to "now" by rewinding last_request.
        rl.buckets[RateLimiter::bucket_index(&addr)][0].last_request = 0;
        rl.cleanup();
        assert_eq!(rl.len(), 0);
    }

    #[test]
    fn ipv4_mapped_encoding() {
        let mapped = ipv4_mapped([127, 0, 0, 1]);
        assert_eq!(&mapped[0..10], &[0u8; 10]);
        assert_eq!(&mapped[10..12], &[0xff, 0xff]);
        assert_eq!(&mapped[12..16], &[127, 0, 0, 1]);
    }

    #[test]
    fn parse_key_handles_v4_and_v6() {
        assert!(parse_key("10.0.0.1").is_some());
        assert!(parse_key("::1").is_some());
        assert!(parse_key("garbage").is_none());
    }
}
