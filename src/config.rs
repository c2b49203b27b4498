//! Configuration module for fluxgate
//!
//! JSON configuration: one listener, one or more remote tunnel servers, and
//! the DNS stanza.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;

use crate::error::{Error, Result};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Log configuration
    #[serde(default)]
    pub log: LogConfig,

    /// Transparent listener address (TCP and UDP)
    pub listen: SocketAddr,

    /// TCP relay idle timeout in seconds
    #[serde(default = "default_tcp_timeout")]
    pub tcp_timeout_secs: u64,

    /// UDP NAT entry idle timeout in seconds
    #[serde(default = "default_udp_timeout")]
    pub udp_timeout_secs: u64,

    /// Remote tunnel servers, in priority order
    pub servers: Vec<ServerConfig>,

    /// DNS server configuration
    pub dns: DnsConfig,

    /// Policy list sources
    #[serde(default)]
    pub policy: PolicyConfig,
}

/// Log configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// One remote tunnel server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Remote endpoint, `host:port`
    pub address: String,

    /// AEAD cipher name (chacha20-poly1305, aes-128-gcm, aes-256-gcm)
    pub cipher: String,

    /// Shared passphrase
    pub password: String,

    /// Optional multiplexed transport over UDP
    #[serde(default)]
    pub mux: MuxSettings,
}

/// Mux transport settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MuxSettings {
    /// Try the mux transport before the plain tunnel
    #[serde(default)]
    pub enabled: bool,

    /// Max pooled links to the remote
    #[serde(default = "default_max_links")]
    pub max_links: usize,

    /// Max live logical streams per link
    #[serde(default = "default_max_streams")]
    pub max_streams_per_link: usize,
}

impl Default for MuxSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            max_links: default_max_links(),
            max_streams_per_link: default_max_streams(),
        }
    }
}

fn default_max_links() -> usize {
    4
}

fn default_max_streams() -> usize {
    16
}

/// DNS server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsConfig {
    /// DNS listen address
    pub listen: SocketAddr,

    /// Resolvers for non-proxied names; `:53` appended when no port given
    pub local_resolvers: Vec<String>,

    /// Resolvers reached through the tunnel for proxied names
    pub proxy_resolvers: Vec<String>,

    /// Cache answers for proxied names
    #[serde(default = "default_true")]
    pub cache: bool,

    /// Per-exchange timeout in seconds
    #[serde(default = "default_dns_timeout")]
    pub timeout_secs: u64,

    /// Number of parallel upstream queries; reserved, a single query is
    /// sent today
    #[serde(default = "default_send_num")]
    pub send_num: u32,
}

/// Policy list sources
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Files of newline-separated proxied domains
    #[serde(default)]
    pub domain_files: Vec<String>,

    /// Inline proxied domains
    #[serde(default)]
    pub domains: Vec<String>,
}

fn default_tcp_timeout() -> u64 {
    300
}

fn default_udp_timeout() -> u64 {
    60
}

fn default_dns_timeout() -> u64 {
    5
}

fn default_send_num() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Load configuration from a JSON file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file: {}", e)))?;
        Self::from_json(&content)
    }

    /// Parse configuration from JSON string
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))
    }

    /// A commented-out starting point for `--gen-config`
    pub fn default_config() -> Self {
        Config {
            log: LogConfig::default(),
            listen: "0.0.0.0:7300".parse().expect("literal addr"),
            tcp_timeout_secs: default_tcp_timeout(),
            udp_timeout_secs: default_udp_timeout(),
            servers: vec![ServerConfig {
                address: "203.0.113.7:8388".to_string(),
                cipher: "chacha20-poly1305".to_string(),
                password: "change-me".to_string(),
                mux: MuxSettings::default(),
            }],
            dns: DnsConfig {
                listen: "0.0.0.0:53".parse().expect("literal addr"),
                local_resolvers: vec!["192.168.1.1".to_string()],
                proxy_resolvers: vec!["8.8.8.8".to_string(), "1.1.1.1".to_string()],
                cache: true,
                timeout_secs: default_dns_timeout(),
                send_num: default_send_num(),
            },
            policy: PolicyConfig::default(),
        }
    }
}

/// Append `:53` to a resolver entry given without a port.
pub fn normalize_resolver(addr: &str) -> String {
    if addr.parse::<SocketAddr>().is_ok() {
        return addr.to_string();
    }
    // Bare IP literal, including unbracketed IPv6
    if let Ok(ip) = addr.parse::<std::net::IpAddr>() {
        return SocketAddr::new(ip, 53).to_string();
    }
    match addr.rsplit_once(':') {
        Some((_, tail)) if tail.parse::<u16>().is_ok() => addr.to_string(),
        _ => format!("{}:53", addr),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_roundtrip() {
        let config = Config::default_config();
        let json = serde_json::to_string_pretty(&config).unwrap();
        let parsed = Config::from_json(&json).unwrap();
        assert_eq!(parsed.servers.len(), config.servers.len());
        assert_eq!(parsed.dns.proxy_resolvers, config.dns.proxy_resolvers);
    }

    #[test]
    fn test_minimal_config() {
        let parsed = Config::from_json(
            r#"{
                "listen": "0.0.0.0:7300",
                "servers": [
                    {"address": "10.0.0.1:8388", "cipher": "aes-256-gcm", "password": "pw"}
                ],
                "dns": {
                    "listen": "0.0.0.0:5353",
                    "local_resolvers": ["192.168.1.1"],
                    "proxy_resolvers": ["8.8.8.8:53"]
                }
            }"#,
        )
        .unwrap();
        assert_eq!(parsed.tcp_timeout_secs, 300);
        assert!(parsed.dns.cache);
        assert_eq!(parsed.dns.send_num, 1);
        assert!(!parsed.servers[0].mux.enabled);
    }

    #[test]
    fn test_normalize_resolver() {
        assert_eq!(normalize_resolver("8.8.8.8"), "8.8.8.8:53");
        assert_eq!(normalize_resolver("8.8.8.8:5353"), "8.8.8.8:5353");
        assert_eq!(normalize_resolver("2001:4860:4860::8888"), "[2001:4860:4860::8888]:53");
        assert_eq!(normalize_resolver("[2001:db8::1]:53"), "[2001:db8::1]:53");
    }
}
