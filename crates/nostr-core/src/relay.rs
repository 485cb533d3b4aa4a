//! Relay identity normalization.
//!
//! The same relay shows up in tags, relay lists and user input in many
//! spellings (`Relay.Example.com/`, `https://relay.example.com:443`,
//! `relay.example.com%2F`). All of them must collapse onto one [`RelayUrl`]
//! so per-relay bookkeeping (observed relays, cursors, subscriptions) has a
//! single key.

use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::num::NonZeroUsize;
use std::sync::LazyLock;
use url::{Host, Url};

/// Capacity of the process-wide normalizer cache.
pub const DEFAULT_NORMALIZER_CAPACITY: usize = 1024;

static DEFAULT_NORMALIZER: LazyLock<RelayNormalizer> =
    LazyLock::new(|| RelayNormalizer::new(DEFAULT_NORMALIZER_CAPACITY));

/// A normalized relay websocket URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RelayUrl(String);

impl RelayUrl {
    /// Normalize through the process-wide cache.
    pub fn parse(raw: &str) -> Option<Self> {
        normalize(raw)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_onion(&self) -> bool {
        self.host().ends_with(".onion")
    }

    /// Loopback, LAN or onion: reached over plain `ws://` by default.
    pub fn is_local(&self) -> bool {
        is_plaintext_host(self.host())
    }

    fn host(&self) -> &str {
        let rest = self
            .0
            .split_once("://")
            .map(|(_, rest)| rest)
            .unwrap_or(&self.0);
        let authority = rest.split('/').next().unwrap_or(rest);
        strip_port(authority)
    }
}

impl fmt::Display for RelayUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for RelayUrl {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        normalize_uncached(&value).ok_or_else(|| format!("invalid relay url: {value}"))
    }
}

impl From<RelayUrl> for String {
    fn from(url: RelayUrl) -> Self {
        url.0
    }
}

impl AsRef<str> for RelayUrl {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Normalizer with a bounded cache of recent inputs.
///
/// The cache only memoizes; the output for a given input is the same with or
/// without it.
pub struct RelayNormalizer {
    cache: Mutex<LruCache<String, Option<RelayUrl>>>,
}

impl RelayNormalizer {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn normalize(&self, raw: &str) -> Option<RelayUrl> {
        if let Some(hit) = self.cache.lock().get(raw) {
            return hit.clone();
        }
        let result = normalize_uncached(raw);
        self.cache.lock().put(raw.to_string(), result.clone());
        result
    }

    pub fn cached_len(&self) -> usize {
        self.cache.lock().len()
    }
}

impl Default for RelayNormalizer {
    fn default() -> Self {
        Self::new(DEFAULT_NORMALIZER_CAPACITY)
    }
}

/// Normalize through the process-wide cache.
pub fn normalize(raw: &str) -> Option<RelayUrl> {
    DEFAULT_NORMALIZER.normalize(raw)
}

fn normalize_uncached(raw: &str) -> Option<RelayUrl> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let decoded = urlencoding::decode(trimmed).ok()?;
    let decoded = decoded.trim();
    if decoded.is_empty() || decoded.chars().any(char::is_whitespace) {
        return None;
    }

    let (scheme, rest) = match decoded.split_once("://") {
        Some((scheme, rest)) => {
            let scheme = match scheme.to_ascii_lowercase().as_str() {
                "wss" | "https" => "wss",
                "ws" | "http" => "ws",
                _ => return None,
            };
            (scheme, rest)
        }
        None => {
            let scheme = if is_plaintext_host(host_of(decoded)) {
                "ws"
            } else {
                "wss"
            };
            (scheme, decoded)
        }
    };

    let url = Url::parse(&format!("{scheme}://{rest}")).ok()?;
    let host = match url.host()? {
        Host::Domain(domain) => {
            let domain = domain.trim_end_matches('.').to_ascii_lowercase();
            if domain.contains('%') || (!domain.contains('.') && domain != "localhost") {
                return None;
            }
            domain
        }
        Host::Ipv4(ip) => ip.to_string(),
        Host::Ipv6(ip) => format!("[{ip}]"),
    };

    let mut out = format!("{scheme}://{host}");
    if let Some(port) = url.port() {
        out.push(':');
        out.push_str(&port.to_string());
    }
    let segments: Vec<&str> = url.path().split('/').filter(|s| !s.is_empty()).collect();
    if !segments.is_empty() {
        out.push('/');
        out.push_str(&segments.join("/"));
    }
    Some(RelayUrl(out))
}

/// Host portion of a scheme-less address, without userinfo or port.
fn host_of(address: &str) -> &str {
    let authority = address.split(['/', '?', '#']).next().unwrap_or(address);
    let authority = authority.rsplit('@').next().unwrap_or(authority);
    strip_port(authority)
}

fn strip_port(authority: &str) -> &str {
    if authority.starts_with('[') {
        return authority
            .find(']')
            .map(|end| &authority[..=end])
            .unwrap_or(authority);
    }
    authority.split(':').next().unwrap_or(authority)
}

fn is_plaintext_host(host: &str) -> bool {
    let host = host.to_ascii_lowercase();
    if host == "localhost" || host.ends_with(".onion") || host.ends_with(".local") {
        return true;
    }
    let bare = host.trim_start_matches('[').trim_end_matches(']');
    match bare.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => is_private_v4(ip),
        Ok(IpAddr::V6(ip)) => ip.is_loopback(),
        Err(_) => false,
    }
}

fn is_private_v4(ip: Ipv4Addr) -> bool {
    ip.is_loopback() || ip.is_private() || ip.is_link_local()
}
