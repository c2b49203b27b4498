//! TTL-aware DNS answer cache
//!
//! Entries expire at the answer's TTL. A lookup past the half-TTL mark still
//! hits, but reports that the caller should refresh upstream; serving stale
//! answers while refreshing keeps the proxied path warm without a resolver
//! round-trip per query.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use hickory_proto::op::Message;

/// Cached answers for proxied names.
pub struct DnsCache {
    entries: HashMap<String, CacheEntry>,
}

struct CacheEntry {
    response: Message,
    half_ttl: Instant,
    ttl: Instant,
}

impl DnsCache {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Store a response under the queried name for `ttl_secs`.
    pub fn insert(&mut self, domain: String, response: Message, ttl_secs: u32) {
        self.insert_at(domain, response, ttl_secs, Instant::now());
    }

    pub(crate) fn insert_at(
        &mut self,
        domain: String,
        response: Message,
        ttl_secs: u32,
        now: Instant,
    ) {
        let ttl = Duration::from_secs(u64::from(ttl_secs));
        self.entries.insert(
            domain,
            CacheEntry {
                response,
                half_ttl: now + ttl / 2,
                ttl: now + ttl,
            },
        );
    }

    /// Look up a name. Returns the cached response and whether the caller
    /// should refresh it upstream; an expired entry is removed and misses.
    pub fn lookup(&mut self, domain: &str) -> Option<(Message, bool)> {
        self.lookup_at(domain, Instant::now())
    }

    pub(crate) fn lookup_at(&mut self, domain: &str, now: Instant) -> Option<(Message, bool)> {
        match self.entries.get(domain) {
            Some(entry) if now < entry.ttl => {
                Some((entry.response.clone(), now >= entry.half_ttl))
            }
            Some(_) => {
                self.entries.remove(domain);
                None
            }
            None => None,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for DnsCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response() -> Message {
        let mut msg = Message::new();
        msg.set_id(42);
        msg
    }

    #[test]
    fn test_fresh_hit() {
        let mut cache = DnsCache::new();
        let now = Instant::now();
        cache.insert_at("example.com".into(), response(), 300, now);

        let (msg, refresh) = cache
            .lookup_at("example.com", now + Duration::from_secs(100))
            .unwrap();
        assert_eq!(msg.id(), 42);
        assert!(!refresh);
    }

    #[test]
    fn test_stale_hit_wants_refresh() {
        let mut cache = DnsCache::new();
        let now = Instant::now();
        cache.insert_at("example.com".into(), response(), 300, now);

        let (_, refresh) = cache
            .lookup_at("example.com", now + Duration::from_secs(200))
            .unwrap();
        assert!(refresh);
    }

    #[test]
    fn test_expired_removes_entry() {
        let mut cache = DnsCache::new();
        let now = Instant::now();
        cache.insert_at("example.com".into(), response(), 300, now);

        assert!(cache
            .lookup_at("example.com", now + Duration::from_secs(300))
            .is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_zero_ttl_is_immediate_miss() {
        let mut cache = DnsCache::new();
        let now = Instant::now();
        cache.insert_at("example.com".into(), response(), 0, now);
        assert!(cache.lookup_at("example.com", now).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_unknown_name_misses() {
        let mut cache = DnsCache::new();
        assert!(cache.lookup("nope.example").is_none());
    }
}
