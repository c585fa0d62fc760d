//! TLS terminator: handshake context, ALPN selection, hot cert reload.
//!
//! Built on `rustls` + `tokio-rustls`. Policy: minimum TLS 1.2, ALPN `h2`
//! preferred then `http/1.1`, atomic context swap on reload so in-flight
//! connections keep the `Arc` they accepted with.

use std::io;
use std::path::Path;
use std::sync::{Arc, RwLock};

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;

/// Preferred ALPN protocol ids, in priority order. `h2` wins when both the
/// client offers it and HTTP/2 is enabled; rustls negotiates in this order.
const ALPN_H2: &[u8] = b"h2";
const ALPN_HTTP11: &[u8] = b"http/1.1";

fn load_chain_and_key(cert_path: &Path, key_path: &Path) -> io::Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let cert_file = std::fs::read(cert_path)?;
    let key_file = std::fs::read(key_path)?;

    let certs = rustls_pemfile::certs(&mut &cert_file[..])
        .collect::<Result<Vec<_>, _>>()?;
    let key = rustls_pemfile::private_key(&mut &key_file[..])?
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "no private key found in key file"))?;

    Ok((certs, key))
}

/// Reads one DER TLV off the front of `buf`, returning (tag, content, rest).
/// Handles definite-length short and long form only — X.509 never emits
/// indefinite length.
fn der_read_tlv(buf: &[u8]) -> Option<(u8, &[u8], &[u8])> {
    let tag = *buf.first()?;
    let len_byte = *buf.get(1)?;
    let (len, header_len) = if len_byte & 0x80 == 0 {
        (len_byte as usize, 2usize)
    } else {
        let n = (len_byte & 0x7f) as usize;
        if n == 0 || n > 4 {
            return None;
        }
        let bytes = buf.get(2..2 + n)?;
        let len = bytes.iter().fold(0usize, |acc, b| (acc << 8) | *b as usize);
        (len, 2 + n)
    };
    let content = buf.get(header_len..header_len + len)?;
    let rest = &buf[header_len + len..];
    Some((tag, content, rest))
}

/// Days since the Unix epoch for a proleptic-Gregorian civil date, via
/// Howard Hinnant's `days_from_civil` algorithm.
fn days_from_civil(year: i64, month: i64, day: i64) -> i64 {
    let y = if month <= 2 { year - 1 } else { year };
    let era = if y >= 0 { y } else { y - 399 } / 400;
    let yoe = (y - era * 400) as i64;
    let mp = (month + 9) % 12;
    let doy = (153 * mp + 2) / 5 + day - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146097 + doe - 719468
}

/// Parses a DER UTCTime (`YYMMDDHHMMSSZ`) or GeneralizedTime
/// (`YYYYMMDDHHMMSSZ`) into a Unix timestamp. Only the `Z`-suffixed UTC
/// forms are accepted; X.509 never emits fractional seconds or offsets here.
fn parse_der_time(tag: u8, content: &[u8]) -> Option<u64> {
    let s = std::str::from_utf8(content).ok()?;
    let s = s.strip_suffix('Z')?;
    if !s.is_ascii() {
        return None;
    }
    let (year, rest) = match tag {
        0x17 => {
            if s.len() < 2 {
                return None;
            }
            let yy: i64 = s[0..2].parse().ok()?;
            (if yy < 50 { 2000 + yy } else { 1900 + yy }, &s[2..])
        }
        0x18 => {
            if s.len() < 4 {
                return None;
            }
            (s[0..4].parse().ok()?, &s[4..])
        }
        _ => return None,
    };
    if rest.len() != 10 {
        return None;
    }
    let month: i64 = rest[0..2].parse().ok()?;
    let day: i64 = rest[2..4].parse().ok()?;
    let hour: i64 = rest[4..6].parse().ok()?;
    let minute: i64 = rest[6..8].parse().ok()?;
    let second: i64 = rest[8..10].parse().ok()?;
    let days = days_from_civil(year, month, day);
    let secs = days * 86400 + hour * 3600 + minute * 60 + second;
    u64::try_from(secs).ok()
}

/// Walks the leaf certificate's TBSCertificate to find `validity.notAfter`,
/// skipping the optional `[0]` version, serialNumber, signature algorithm,
/// and issuer fields that precede it.
fn parse_not_after(der: &[u8]) -> Option<u64> {
    let (0x30, cert, _) = der_read_tlv(der)? else { return None };
    let (0x30, tbs, _) = der_read_tlv(cert)? else { return None };

    let (tag, _, next) = der_read_tlv(tbs)?;
    let rest = if tag == 0xa0 { next } else { tbs };
    let (_, _, rest) = der_read_tlv(rest)?; // serialNumber
    let (_, _, rest) = der_read_tlv(rest)?; // signature AlgorithmIdentifier
    let (_, _, rest) = der_read_tlv(rest)?; // issuer
    let (0x30, validity, _) = der_read_tlv(rest)? else { return None };

    let (_, _, after_not_before) = der_read_tlv(validity)?; // notBefore
    let (tag, content, _) = der_read_tlv(after_not_before)?; // notAfter
    parse_der_time(tag, content)
}

fn cert_expiry_unix(certs: &[CertificateDer<'static>]) -> Option<u64> {
    let leaf = certs.first()?;
    parse_not_after(leaf.as_ref())
}

fn build_server_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    http2_enabled: bool,
) -> io::Result<Arc<ServerConfig>> {
    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;

    config.alpn_protocols = if http2_enabled {
        vec![ALPN_H2.to_vec(), ALPN_HTTP11.to_vec()]
    } else {
        vec![ALPN_HTTP11.to_vec()]
    };

    Ok(Arc::new(config))
}

/// Owns the live `rustls::ServerConfig` behind a lock so `reload` can swap
/// it without disturbing handshakes already bound to the old one — existing
/// connections hold their own `Arc` clone taken at accept time.
pub struct TlsTerminator {
    current: RwLock<Arc<ServerConfig>>,
    cert_path: std::path::PathBuf,
    key_path: std::path::PathBuf,
    http2_enabled: bool,
    cert_expiry: RwLock<Option<u64>>,
}

impl TlsTerminator {
    pub fn load(cert_path: &Path, key_path: &Path, http2_enabled: bool) -> io::Result<Self> {
        let (certs, key) = load_chain_and_key(cert_path, key_path)?;
        let expiry = cert_expiry_unix(&certs);
        let config = build_server_config(certs, key, http2_enabled)?;
        Ok(Self {
            current: RwLock::new(config),
            cert_path: cert_path.to_path_buf(),
            key_path: key_path.to_path_buf(),
            http2_enabled,
            cert_expiry: RwLock::new(expiry),
        })
    }

    /// The config to bind the *next* accepted connection's handshake to.
    pub fn current(&self) -> Arc<ServerConfig> {
        self.current.read().expect("tls config lock poisoned").clone()
    }

    /// SIGUSR2: reload cert/key from disk and swap the pointer atomically.
    /// Connections mid-handshake or already established keep their old
    /// `Arc<ServerConfig>` clone and are unaffected.
    pub fn reload(&self) -> io::Result<()> {
        let (certs, key) = load_chain_and_key(&self.cert_path, &self.key_path)?;
        let expiry = cert_expiry_unix(&certs);
        let fresh = build_server_config(certs, key, self.http2_enabled)?;
        *self.current.write().expect("tls config lock poisoned") = fresh;
        *self.cert_expiry.write().expect("tls expiry lock poisoned") = expiry;
        tracing::info!("tls certificate reloaded");
        Ok(())
    }

    /// Unix timestamp of the currently loaded certificate's expiry, for the
    /// `/metrics` gauge.
    pub fn cert_expiry(&self) -> Option<u64> {
        *self.cert_expiry.read().expect("tls expiry lock poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_self_signed(dir: &Path) -> (std::path::PathBuf, std::path::PathBuf) {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let cert_path = dir.join("cert.pem");
        let key_path = dir.join("key.pem");
        std::fs::File::create(&cert_path).unwrap().write_all(cert.serialize_pem().unwrap().as_bytes()).unwrap();
        std::fs::File::create(&key_path).unwrap().write_all(cert.serialize_private_key_pem().as_bytes()).unwrap();
        (cert_path, key_path)
    }

    #[test]
    fn loads_and_selects_alpn_h2_when_enabled() {
        let dir = tempfile::tempdir().unwrap();
        let (cert_path, key_path) = write_self_signed(dir.path());
        let term = TlsTerminator::load(&cert_path, &key_path, true).unwrap();
        let config = term.current();
        assert_eq!(config.alpn_protocols, vec![ALPN_H2.to_vec(), ALPN_HTTP11.to_vec()]);
    }

    #[test]
    fn http2_disabled_only_advertises_http11() {
        let dir = tempfile::tempdir().unwrap();
        let (cert_path, key_path) = write_self_signed(dir.path());
        let term = TlsTerminator::load(&cert_path, &key_path, false).unwrap();
        assert_eq!(term.current().alpn_protocols, vec![ALPN_HTTP11.to_vec()]);
    }

    #[test]
    fn reload_swaps_config_without_error() {
        let dir = tempfile::tempdir().unwrap();
        let (cert_path, key_path) = write_self_signed(dir.path());
        let term = TlsTerminator::load(&cert_path, &key_path, true).unwrap();
        let before = term.current();
        term.reload().unwrap();
        let after = term.current();
        assert!(!Arc::ptr_eq(&before, &after));
    }

    #[test]
    fn cert_expiry_reflects_the_certificates_notafter_not_load_time() {
        let dir = tempfile::tempdir().unwrap();
        let (cert_path, key_path) = write_self_signed(dir.path());
        let term = TlsTerminator::load(&cert_path, &key_path, true).unwrap();
        let now = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap().as_secs();
        let expiry = term.cert_expiry().expect("leaf cert notAfter should parse");
        // rcgen's default self-signed cert validity extends well past a
        // month from issuance; a stamp-load-time bug would put this within
        // seconds of `now` instead.
        assert!(expiry > now + 60 * 60 * 24 * 30);
    }

    #[test]
    fn parses_utc_time_epoch() {
        assert_eq!(parse_der_time(0x17, b"700101000000Z"), Some(0));
    }

    #[test]
    fn parses_utc_time_two_digit_year_pivot_to_2000s() {
        // yy < 50 pivots to 20yy, per RFC 5280's UTCTime convention.
        assert_eq!(parse_der_time(0x17, b"300101000000Z"), Some(days_from_civil(2030, 1, 1) as u64 * 86400));
    }

    #[test]
    fn parses_generalized_time() {
        assert_eq!(parse_der_time(0x18, b"99991231235959Z"), Some(days_from_civil(9999, 12, 31) as u64 * 86400 + 86399));
    }

    #[test]
    fn rejects_malformed_time_strings() {
        assert_eq!(parse_der_time(0x17, b"not-a-time"), None);
        assert_eq!(parse_der_time(0x19, b"700101000000Z"), None);
    }
}
