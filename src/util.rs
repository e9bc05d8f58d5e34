//! Small helpers shared by the guards: the compiled-pattern cache and
//! client identity resolution.

use ahash::AHasher;
use aho_corasick::{AhoCorasick, AhoCorasickBuilder, BuildError};
use axum::http::HeaderMap;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::sync::Arc;

/// Identity used when nothing else is known about the caller.
pub const UNKNOWN_IDENTITY: &str = "unknown";

/// A memoising wrapper around `AhoCorasick::new` to avoid recompiling
/// automata for repeated lists.  The cache key is a hash of the pattern list.
static AC_CACHE: Lazy<DashMap<u64, Arc<AhoCorasick>>> = Lazy::new(DashMap::new);

/// Given a list of literal patterns, return a shared case-insensitive
/// matcher.  Repeated lists hit the cache.
pub fn ac_for(list: &[String]) -> Result<Arc<AhoCorasick>, BuildError> {
    let mut hasher = AHasher::default();
    for pat in list {
        pat.hash(&mut hasher);
    }
    let key = hasher.finish();
    if let Some(existing) = AC_CACHE.get(&key) {
        return Ok(existing.clone());
    }
    let lower: Vec<String> = list.iter().map(|p| p.to_lowercase()).collect();
    let ac = AhoCorasickBuilder::new()
        .ascii_case_insensitive(true)
        .build(lower)?;
    let arc = Arc::new(ac);
    AC_CACHE.insert(key, arc.clone());
    Ok(arc)
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Resolve the caller identity: first `x-forwarded-for` hop, then
/// `x-real-ip`, then the socket peer, then `"unknown"`.
pub fn client_identity(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    if let Some(first) = header_str(headers, "x-forwarded-for")
        .and_then(|raw| raw.split(',').next())
        .map(str::trim)
        .filter(|s| !s.is_empty())
    {
        return first.to_string();
    }
    if let Some(real) = header_str(headers, "x-real-ip") {
        return real.to_string();
    }
    match peer {
        Some(addr) => addr.ip().to_string(),
        None => UNKNOWN_IDENTITY.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn forwarded_for_wins_over_everything() {
        let mut h = HeaderMap::new();
        h.insert("x-forwarded-for", HeaderValue::from_static(" 203.0.113.7 , 10.0.0.1"));
        h.insert("x-real-ip", HeaderValue::from_static("198.51.100.2"));
        let peer: SocketAddr = "127.0.0.1:4000".parse().unwrap();
        assert_eq!(client_identity(&h, Some(peer)), "203.0.113.7");
    }

    #[test]
    fn falls_back_through_real_ip_peer_and_unknown() {
        let mut h = HeaderMap::new();
        h.insert("x-real-ip", HeaderValue::from_static("198.51.100.2"));
        assert_eq!(client_identity(&h, None), "198.51.100.2");

        let peer: SocketAddr = "192.0.2.9:51000".parse().unwrap();
        assert_eq!(client_identity(&HeaderMap::new(), Some(peer)), "192.0.2.9");
        assert_eq!(client_identity(&HeaderMap::new(), None), UNKNOWN_IDENTITY);
    }

    #[test]
    fn cached_matcher_is_shared_and_case_insensitive() {
        let list = vec!["Crawler".to_string(), "curl".to_string()];
        let a = ac_for(&list).unwrap();
        let b = ac_for(&list).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(a.is_match("SomeCRAWLER/1.0"));
        assert!(!a.is_match("Mozilla/5.0"));
    }
}
