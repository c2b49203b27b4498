//! Policy list and routing table
//!
//! The policy list is the set of domains whose traffic must go through the
//! tunnel; the DNS server consults it per query and extends it with CNAME
//! targets it observes. The routing table records which IPs a proxied domain
//! resolved to, so the operator's packet-filter sets can be kept in step.

use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::path::Path;

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Domain set with suffix matching.
///
/// `check_domain("cdn.example.com")` matches a stored `example.com`.
pub struct PolicyList {
    domains: RwLock<HashSet<String>>,
}

impl PolicyList {
    pub fn new() -> Self {
        Self {
            domains: RwLock::new(HashSet::new()),
        }
    }

    /// Load newline-separated domains from a file. Blank lines and `#`
    /// comments are skipped.
    pub fn load_file<P: AsRef<Path>>(&self, path: P) -> Result<usize> {
        let content = std::fs::read_to_string(&path).map_err(|e| {
            Error::Config(format!(
                "read policy file {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        let mut count = 0;
        let mut domains = self.domains.write();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            domains.insert(normalize(line));
            count += 1;
        }
        info!("loaded {} domains from {}", count, path.as_ref().display());
        Ok(count)
    }

    /// Is `name` or any parent domain of it in the list?
    pub fn check_domain(&self, name: &str) -> bool {
        let name = normalize(name);
        let domains = self.domains.read();
        let mut rest = name.as_str();
        loop {
            if domains.contains(rest) {
                return true;
            }
            match rest.split_once('.') {
                Some((_, parent)) if !parent.is_empty() => rest = parent,
                _ => return false,
            }
        }
    }

    /// Add one domain (observed CNAME targets land here).
    pub fn add_domain(&self, name: &str) {
        let name = normalize(name);
        if self.domains.write().insert(name.clone()) {
            debug!("policy: added domain {}", name);
        }
    }

    pub fn len(&self) -> usize {
        self.domains.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.domains.read().is_empty()
    }
}

impl Default for PolicyList {
    fn default() -> Self {
        Self::new()
    }
}

/// `domain → resolved IPv4 set`, written by the DNS server.
pub struct RoutingTable {
    entries: RwLock<HashMap<String, Vec<Ipv4Addr>>>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Record that `domain` resolved to `ip`. Duplicates are ignored.
    pub fn add_ip(&self, domain: &str, ip: Ipv4Addr) {
        let domain = normalize(domain);
        let mut entries = self.entries.write();
        let ips = entries.entry(domain.clone()).or_default();
        if !ips.contains(&ip) {
            debug!("routing: {} -> {}", domain, ip);
            ips.push(ip);
        }
    }

    /// All recorded IPs for a domain.
    pub fn ips(&self, domain: &str) -> Vec<Ipv4Addr> {
        self.entries
            .read()
            .get(&normalize(domain))
            .cloned()
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl Default for RoutingTable {
    fn default() -> Self {
        Self::new()
    }
}

fn normalize(name: &str) -> String {
    name.trim().trim_end_matches('.').to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_suffix_matching() {
        let policy = PolicyList::new();
        policy.add_domain("example.com");

        assert!(policy.check_domain("example.com"));
        assert!(policy.check_domain("www.example.com"));
        assert!(policy.check_domain("a.b.c.example.com"));
        assert!(!policy.check_domain("notexample.com"));
        assert!(!policy.check_domain("example.org"));
        assert!(!policy.check_domain("com"));
    }

    #[test]
    fn test_trailing_dot_and_case() {
        let policy = PolicyList::new();
        policy.add_domain("Example.COM.");
        assert!(policy.check_domain("www.example.com"));
    }

    #[test]
    fn test_routing_dedup() {
        let routing = RoutingTable::new();
        let ip = Ipv4Addr::new(93, 184, 216, 34);
        routing.add_ip("example.com", ip);
        routing.add_ip("example.com.", ip);
        assert_eq!(routing.ips("example.com"), vec![ip]);
    }
}
