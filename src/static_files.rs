//! Pre-read static response bodies with `{{banner}}` substitution.
//!
//! Loaded once at worker start (and again on config reload) from
//! `[static] dir`. Bodies are held as `Box<[u8]>` — read once, never mutated,
//! shared by reference for the life of the worker. Not a general-purpose
//! file server: a fixed, small set of named pages.

use std::fs;
use std::io;
use std::path::Path;

use crate::router::RouteTag;

#[derive(Debug)]
pub struct StaticSet {
    home: Box<[u8]>,
    docs: Box<[u8]>,
    status: Box<[u8]>,
    logos: Box<[u8]>,
    result: Box<[u8]>,
    broadcast: Box<[u8]>,
    error_404: Box<[u8]>,
}

const BANNER_TOKEN: &str = "{{banner}}";

fn load_with_banner(dir: &Path, filename: &str, banner: Option<&str>) -> io::Result<Box<[u8]>> {
    let text = fs::read_to_string(dir.join(filename))?;
    let substituted = match banner {
        Some(value) if text.contains(BANNER_TOKEN) => text.replace(BANNER_TOKEN, value),
        _ => text,
    };
    Ok(substituted.into_bytes().into_boxed_slice())
}

impl StaticSet {
    /// Load every fixed page from `dir`, substituting `banner` into any
    /// `{{banner}}` token present. A missing or unreadable file fails the
    /// whole load (the worker must not start half-configured).
    pub fn load(dir: &Path, banner: Option<&str>) -> io::Result<Self> {
        Ok(Self {
            home: load_with_banner(dir, "home.html", banner)?,
            docs: load_with_banner(dir, "docs.html", banner)?,
            status: load_with_banner(dir, "status.html", banner)?,
            logos: load_with_banner(dir, "logos.html", banner)?,
            result: load_with_banner(dir, "result.html", banner)?,
            broadcast: load_with_banner(dir, "broadcast.html", banner)?,
            error_404: load_with_banner(dir, "404.html", banner)?,
        })
    }

    /// An empty, dependency-free set for tests and `--test` config checks.
    pub fn empty() -> Self {
        Self {
            home: Box::from(&b""[..]),
            docs: Box::from(&b""[..]),
            status: Box::from(&b""[..]),
            logos: Box::from(&b""[..]),
            result: Box::from(&b""[..]),
            broadcast: Box::from(&b""[..]),
            error_404: Box::from(&b""[..]),
        }
    }

    /// Body for a given route tag, if this set serves one directly (not all
    /// route tags map to a static body — health/metrics/ACME are dynamic).
    pub fn body_for(&self, tag: &RouteTag) -> Option<&[u8]> {
        match tag {
            RouteTag::Home => Some(&self.home),
            RouteTag::Docs => Some(&self.docs),
            RouteTag::Status => Some(&self.status),
            RouteTag::Logos => Some(&self.logos),
            RouteTag::Result { .. } => Some(&self.result),
            RouteTag::Broadcast { .. } => Some(&self.broadcast),
            RouteTag::Error => Some(&self.error_404),
            _ => None,
        }
    }

    /// The BROADCAST page with the node's reported `{{result}}` spliced in
    /// — the same single-token substitution
    /// technique as the banner, applied to the broadcast outcome instead.
    pub fn render_broadcast(&self, result: &str) -> Vec<u8> {
        const RESULT_TOKEN: &str = "{{result}}";
        match std::str::from_utf8(&self.broadcast) {
            Ok(text) if text.contains(RESULT_TOKEN) => text.replacen(RESULT_TOKEN, result, 1).into_bytes(),
            _ => self.broadcast.to_vec(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write(dir: &Path, name: &str, contents: &str) {
        fs::write(dir.join(name), contents).unwrap();
    }

    #[test]
    fn substitutes_banner_token() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["home.html", "docs.html", "status.html", "logos.html", "result.html", "broadcast.html", "404.html"] {
            write(dir.path(), name, "before {{banner}} after");
        }
        let set = StaticSet::load(dir.path(), Some("v1.2.3")).unwrap();
        assert_eq!(&*set.home, b"before v1.2.3 after");
    }

    #[test]
    fn leaves_text_untouched_without_token() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["home.html", "docs.html", "status.html", "logos.html", "result.html", "broadcast.html", "404.html"] {
            write(dir.path(), name, "static body");
        }
        let set = StaticSet::load(dir.path(), Some("ignored")).unwrap();
        assert_eq!(&*set.docs, b"static body");
    }

    #[test]
    fn body_for_maps_known_tags() {
        let set = StaticSet::empty();
        assert!(set.body_for(&RouteTag::Home).is_some());
        assert!(set.body_for(&RouteTag::Health).is_none());
    }

    #[test]
    fn render_broadcast_substitutes_result_token() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["home.html", "docs.html", "status.html", "logos.html", "result.html", "404.html"] {
            write(dir.path(), name, "static body");
        }
        write(dir.path(), "broadcast.html", "broadcast submitted: {{result}}");
        let set = StaticSet::load(dir.path(), None).unwrap();
        let rendered = set.render_broadcast("deadbeef");
        assert_eq!(rendered, b"broadcast submitted: deadbeef");
    }

    #[test]
    fn render_broadcast_without_token_returns_body_unchanged() {
        let set = StaticSet::empty();
        assert_eq!(set.render_broadcast("deadbeef"), set.broadcast.to_vec());
    }
}
