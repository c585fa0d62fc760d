//! INI-style configuration loader.
//!
//! Hand-rolled rather than pulled from a generic `config` crate: the grammar
//! is small, read at most twice per process lifetime (start, SIGHUP), and
//! line-oriented byte scanning covers it without an external parser
//! dependency.

use std::fs;
use std::path::Path;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read { path: String, source: std::io::Error },
    #[error("unknown section [{0}] at line {1}")]
    UnknownSection(String, usize),
    #[error("key `{0}` outside any section at line {1}")]
    KeyOutsideSection(String, usize),
    #[error("unknown key `{0}` in section [{1}] at line {2}")]
    UnknownKey(String, String, usize),
    #[error("invalid value for `{0}` = `{1}` at line {2}: {3}")]
    InvalidValue(String, String, usize, String),
}

#[derive(Debug, Clone)]
pub struct ServerSection {
    pub plain_port: u16,
    pub tls_port: u16,
    pub workers: Option<u32>,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self { plain_port: 8080, tls_port: 8443, workers: None }
    }
}

#[derive(Debug, Clone)]
pub struct BufferSection {
    pub max_buffer_size: usize,
}

impl Default for BufferSection {
    fn default() -> Self {
        Self { max_buffer_size: 16 * 1024 * 1024 }
    }
}

#[derive(Debug, Clone)]
pub struct TiersSection {
    pub large_threshold: usize,
    pub huge_threshold: usize,
}

impl Default for TiersSection {
    fn default() -> Self {
        Self { large_threshold: 8 * 1024, huge_threshold: 256 * 1024 }
    }
}

#[derive(Debug, Clone)]
pub struct SlotsSection {
    pub normal: u32,
    pub large: u32,
    pub huge: u32,
}

impl Default for SlotsSection {
    fn default() -> Self {
        Self { normal: 4096, large: 512, huge: 64 }
    }
}

#[derive(Debug, Clone)]
pub struct RatelimitSection {
    pub rate: f64,
    pub burst: Option<f64>,
}

impl Default for RatelimitSection {
    fn default() -> Self {
        Self { rate: 20.0, burst: None }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TlsSection {
    pub enabled: bool,
    pub cert_path: Option<String>,
    pub key_path: Option<String>,
}

#[derive(Debug, Clone)]
pub struct LoggingSection {
    pub level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self { level: "info".to_string() }
    }
}

#[derive(Debug, Clone, Default)]
pub struct AcmeSection {
    pub challenge_dir: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct SecuritySection {
    pub block_list: Option<String>,
    pub allow_list: Option<String>,
    pub seccomp: bool,
}

#[derive(Debug, Clone, Default)]
pub struct StaticSection {
    pub dir: Option<String>,
    pub banner: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RpcChain {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub user: Option<String>,
    pub password: Option<String>,
    pub cookie_path: Option<String>,
    pub wallet: Option<String>,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Default)]
pub struct Config {
    pub server: ServerSectionWrap,
    pub buffer: BufferSection,
    pub tiers: TiersSection,
    pub static_: StaticSection,
    pub slots: SlotsSection,
    pub ratelimit: RatelimitSection,
    pub tls: TlsSection,
    pub logging: LoggingSection,
    pub acme: AcmeSection,
    pub security: SecuritySection,
    pub rpc_chains: Vec<RpcChain>,
}

// Wrapped so `Config` can derive `Default` while `ServerSection` keeps
// meaningful (non-zero) defaults.
#[derive(Debug, Clone)]
pub struct ServerSectionWrap(pub ServerSection);
impl Default for ServerSectionWrap {
    fn default() -> Self {
        Self(ServerSection::default())
    }
}
impl std::ops::Deref for ServerSectionWrap {
    type Target = ServerSection;
    fn deref(&self) -> &ServerSection {
        &self.0
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&text)
    }

    fn parse(text: &str) -> Result<Self, ConfigError> {
        let mut cfg = Config::default();
        let mut section = String::new();
        let mut rpc_chain: Option<RpcChain> = None;

        for (lineno, raw_line) in text.lines().enumerate() {
            let lineno = lineno + 1;
            let line = strip_comment(raw_line).trim();
            if line.is_empty() {
                continue;
            }
            if let Some(name) = parse_section_header(line) {
                if let Some(chain) = rpc_chain.take() {
                    cfg.rpc_chains.push(chain);
                }
                if let Some(chain_name) = name.strip_prefix("rpc:") {
                    rpc_chain = Some(RpcChain {
                        name: chain_name.to_string(),
                        host: "127.0.0.1".to_string(),
                        port: 8332,
                        user: None,
                        password: None,
                        cookie_path: None,
                        wallet: None,
                        timeout_secs: 30,
                    });
                    section = "rpc".to_string();
                    continue;
                }
                if !KNOWN_SECTIONS.contains(&name.as_str()) {
                    return Err(ConfigError::UnknownSection(name, lineno));
                }
                section = name;
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                return Err(ConfigError::KeyOutsideSection(line.to_string(), lineno));
            };
            let key = key.trim();
            let value = value.trim();
            if section.is_empty() {
                return Err(ConfigError::KeyOutsideSection(key.to_string(), lineno));
            }

            if section == "rpc" {
                apply_rpc_key(rpc_chain.as_mut().expect("section header sets rpc_chain"), key, value, lineno)?;
                continue;
            }

            apply_key(&mut cfg, &section, key, value, lineno)?;
        }
        if let Some(chain) = rpc_chain.take() {
            cfg.rpc_chains.push(chain);
        }

        if cfg.tiers.large_threshold >= cfg.tiers.huge_threshold {
            tracing::warn!(
                large = cfg.tiers.large_threshold,
                huge = cfg.tiers.huge_threshold,
                "large_threshold >= huge_threshold; forcing huge_threshold = 2 * large_threshold"
            );
            cfg.tiers.huge_threshold = 2 * cfg.tiers.large_threshold;
        }

        Ok(cfg)
    }
}

const KNOWN_SECTIONS: &[&str] = &[
    "server", "buffer", "tiers", "static", "slots", "ratelimit", "tls", "logging", "acme",
    "security",
];

fn strip_comment(line: &str) -> &str {
    for (i, b) in line.as_bytes().iter().enumerate() {
        if *b == b'#' || *b == b';' {
            return &line[..i];
        }
    }
    line
}

fn parse_section_header(line: &str) -> Option<String> {
    let line = line.trim();
    if line.starts_with('[') && line.ends_with(']') {
        Some(line[1..line.len() - 1].trim().to_string())
    } else {
        None
    }
}

fn parse_num<T: std::str::FromStr>(key: &str, value: &str, lineno: usize) -> Result<T, ConfigError> {
    value
        .parse::<T>()
        .map_err(|_| ConfigError::InvalidValue(key.to_string(), value.to_string(), lineno, "not a number".to_string()))
}

fn parse_bool(key: &str, value: &str, lineno: usize) -> Result<bool, ConfigError> {
    match value {
        "true" | "yes" | "1" => Ok(true),
        "false" | "no" | "0" => Ok(false),
        _ => Err(ConfigError::InvalidValue(key.to_string(), value.to_string(), lineno, "expected true/false".to_string())),
    }
}

fn apply_key(cfg: &mut Config, section: &str, key: &str, value: &str, lineno: usize) -> Result<(), ConfigError> {
    match (section, key) {
        ("server", "plain_port") => cfg.server.0.plain_port = parse_num(key, value, lineno)?,
        ("server", "tls_port") => cfg.server.0.tls_port = parse_num(key, value, lineno)?,
        ("server", "workers") => cfg.server.0.workers = Some(parse_num(key, value, lineno)?),
        ("buffer", "max_buffer_size") => cfg.buffer.max_buffer_size = parse_num(key, value, lineno)?,
        ("tiers", "large_threshold") => cfg.tiers.large_threshold = parse_num(key, value, lineno)?,
        ("tiers", "huge_threshold") => cfg.tiers.huge_threshold = parse_num(key, value, lineno)?,
        ("static", "dir") => cfg.static_.dir = Some(value.to_string()),
        ("static", "banner") => cfg.static_.banner = Some(value.to_string()),
        ("slots", "normal") => cfg.slots.normal = parse_num(key, value, lineno)?,
        ("slots", "large") => cfg.slots.large = parse_num(key, value, lineno)?,
        ("slots", "huge") => cfg.slots.huge = parse_num(key, value, lineno)?,
        ("ratelimit", "rate") => cfg.ratelimit.rate = parse_num(key, value, lineno)?,
        ("ratelimit", "burst") => cfg.ratelimit.burst = Some(parse_num(key, value, lineno)?),
        ("tls", "enabled") => cfg.tls.enabled = parse_bool(key, value, lineno)?,
        ("tls", "cert_path") => cfg.tls.cert_path = Some(value.to_string()),
        ("tls", "key_path") => cfg.tls.key_path = Some(value.to_string()),
        ("logging", "level") => cfg.logging.level = value.to_string(),
        ("acme", "challenge_dir") => cfg.acme.challenge_dir = Some(value.to_string()),
        ("security", "block_list") => cfg.security.block_list = Some(value.to_string()),
        ("security", "allow_list") => cfg.security.allow_list = Some(value.to_string()),
        ("security", "seccomp") => cfg.security.seccomp = parse_bool(key, value, lineno)?,
        _ => return Err(ConfigError::UnknownKey(key.to_string(), section.to_string(), lineno)),
    }
    Ok(())
}

fn apply_rpc_key(chain: &mut RpcChain, key: &str, value: &str, lineno: usize) -> Result<(), ConfigError> {
    match key {
        "host" => chain.host = value.to_string(),
        "port" => chain.port = parse_num(key, value, lineno)?,
        "user" => chain.user = Some(value.to_string()),
        "password" => chain.password = Some(value.to_string()),
        "cookie_path" => chain.cookie_path = Some(value.to_string()),
        "wallet" => chain.wallet = Some(value.to_string()),
        "timeout_secs" => chain.timeout_secs = parse_num(key, value, lineno)?,
        _ => return Err(ConfigError::UnknownKey(key.to_string(), format!("rpc:{}", chain.name), lineno)),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_basic_sections() {
        let text = "\
[server]
plain_port = 8080
tls_port = 8443

[tiers]
large_threshold = 1024
huge_threshold = 4096
";
        let cfg = Config::parse(text).unwrap();
        assert_eq!(cfg.server.plain_port, 8080);
        assert_eq!(cfg.tiers.large_threshold, 1024);
        assert_eq!(cfg.tiers.huge_threshold, 4096);
    }

    #[test]
    fn enforces_threshold_invariant() {
        let text = "\
[tiers]
large_threshold = 5000
huge_threshold = 1000
";
        let cfg = Config::parse(text).unwrap();
        assert_eq!(cfg.tiers.huge_threshold, 10000);
    }

    #[test]
    fn comments_and_blank_lines_ignored() {
        let text = "\
; leading comment
[server]
# another comment
plain_port = 9090

";
        let cfg = Config::parse(text).unwrap();
        assert_eq!(cfg.server.plain_port, 9090);
    }

    #[test]
    fn unknown_section_errors() {
        let err = Config::parse("[bogus]\nkey = 1\n").unwrap_err();
        assert!(matches!(err, ConfigError::UnknownSection(_, _)));
    }

    #[test]
    fn unknown_key_errors() {
        let err = Config::parse("[server]\nnonsense = 1\n").unwrap_err();
        assert!(matches!(err, ConfigError::UnknownKey(_, _, _)));
    }

    #[test]
    fn parses_multiple_rpc_chains() {
        let text = "\
[rpc:mainnet]
host = 10.0.0.1
port = 8332
user = alice
password = secret

[rpc:testnet]
host = 10.0.0.2
port = 18332
cookie_path = /var/run/bitcoin/.cookie
";
        let cfg = Config::parse(text).unwrap();
        assert_eq!(cfg.rpc_chains.len(), 2);
        assert_eq!(cfg.rpc_chains[0].name, "mainnet");
        assert_eq!(cfg.rpc_chains[0].port, 8332);
        assert_eq!(cfg.rpc_chains[1].cookie_path.as_deref(), Some("/var/run/bitcoin/.cookie"));
    }

    #[test]
    fn key_outside_section_errors() {
        let err = Config::parse("plain_port = 1\n").unwrap_err();
        assert!(matches!(err, ConfigError::KeyOutsideSection(_, _)));
    }
}
