//! Address type and the on-wire destination header
//!
//! Every tunneled TCP stream starts with, and every tunneled UDP datagram is
//! prefixed by, a compact tag-length-value encoding of the destination:
//!
//! ```text
//! 0x01 | ipv4 (4 bytes)          | port (2 bytes, BE)
//! 0x03 | len (1) | domain bytes  | port (2 bytes, BE)
//! 0x04 | ipv6 (16 bytes)         | port (2 bytes, BE)
//! ```

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::error::{Error, Result};

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// Longest domain the header can carry, in octets.
const MAX_DOMAIN_LEN: usize = 255;

/// Network address representation
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    /// IP socket address (IP + port)
    Socket(SocketAddr),
    /// Domain name with port
    Domain(String, u16),
}

impl Address {
    /// Create from domain and port
    pub fn domain(domain: impl Into<String>, port: u16) -> Self {
        Address::Domain(domain.into(), port)
    }

    /// Create from socket address
    pub fn socket(addr: SocketAddr) -> Self {
        Address::Socket(addr)
    }

    /// Parse a `host:port` string into an address.
    ///
    /// The host may be an IPv4 literal, a bracketed or bare IPv6 literal, or
    /// a domain name of at most 255 octets. Anything else is rejected.
    pub fn from_host_port(s: &str) -> Result<Self> {
        if let Ok(addr) = s.parse::<SocketAddr>() {
            return Ok(Address::Socket(addr));
        }

        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| Error::MalformedAddress(format!("missing port in {:?}", s)))?;
        let port: u16 = port
            .parse()
            .map_err(|_| Error::MalformedAddress(format!("bad port in {:?}", s)))?;

        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(Address::Socket(SocketAddr::new(ip, port)));
        }

        if host.is_empty() || host.len() > MAX_DOMAIN_LEN || !is_domain_name(host) {
            return Err(Error::MalformedAddress(format!("bad host in {:?}", s)));
        }
        Ok(Address::Domain(host.to_string(), port))
    }

    /// Get the port
    pub fn port(&self) -> u16 {
        match self {
            Address::Socket(addr) => addr.port(),
            Address::Domain(_, port) => *port,
        }
    }

    /// Get the host part as string
    pub fn host(&self) -> String {
        match self {
            Address::Socket(addr) => addr.ip().to_string(),
            Address::Domain(domain, _) => domain.clone(),
        }
    }

    /// Try to get as socket address (fails for domain)
    pub fn as_socket(&self) -> Option<SocketAddr> {
        match self {
            Address::Socket(addr) => Some(*addr),
            Address::Domain(_, _) => None,
        }
    }

    /// Encode into the wire header.
    pub fn to_wire(&self) -> Vec<u8> {
        match self {
            Address::Socket(SocketAddr::V4(v4)) => {
                let mut buf = Vec::with_capacity(1 + 4 + 2);
                buf.push(ATYP_IPV4);
                buf.extend_from_slice(&v4.ip().octets());
                buf.extend_from_slice(&v4.port().to_be_bytes());
                buf
            }
            Address::Socket(SocketAddr::V6(v6)) => {
                let mut buf = Vec::with_capacity(1 + 16 + 2);
                buf.push(ATYP_IPV6);
                buf.extend_from_slice(&v6.ip().octets());
                buf.extend_from_slice(&v6.port().to_be_bytes());
                buf
            }
            Address::Domain(domain, port) => {
                let bytes = domain.as_bytes();
                debug_assert!(bytes.len() <= MAX_DOMAIN_LEN);
                let mut buf = Vec::with_capacity(1 + 1 + bytes.len() + 2);
                buf.push(ATYP_DOMAIN);
                buf.push(bytes.len() as u8);
                buf.extend_from_slice(bytes);
                buf.extend_from_slice(&port.to_be_bytes());
                buf
            }
        }
    }

    /// Decode a wire header from the front of `buf`.
    ///
    /// Returns the address and the number of bytes consumed.
    pub fn from_wire(buf: &[u8]) -> Result<(Self, usize)> {
        let tag = *buf
            .first()
            .ok_or_else(|| Error::MalformedAddress("empty header".into()))?;
        match tag {
            ATYP_IPV4 => {
                if buf.len() < 1 + 4 + 2 {
                    return Err(Error::MalformedAddress("truncated ipv4 header".into()));
                }
                let ip = Ipv4Addr::new(buf[1], buf[2], buf[3], buf[4]);
                let port = u16::from_be_bytes([buf[5], buf[6]]);
                Ok((Address::Socket(SocketAddr::new(ip.into(), port)), 7))
            }
            ATYP_IPV6 => {
                if buf.len() < 1 + 16 + 2 {
                    return Err(Error::MalformedAddress("truncated ipv6 header".into()));
                }
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&buf[1..17]);
                let ip = Ipv6Addr::from(octets);
                let port = u16::from_be_bytes([buf[17], buf[18]]);
                Ok((Address::Socket(SocketAddr::new(ip.into(), port)), 19))
            }
            ATYP_DOMAIN => {
                let len = *buf
                    .get(1)
                    .ok_or_else(|| Error::MalformedAddress("truncated domain header".into()))?
                    as usize;
                if buf.len() < 2 + len + 2 {
                    return Err(Error::MalformedAddress("truncated domain header".into()));
                }
                let domain = std::str::from_utf8(&buf[2..2 + len])
                    .map_err(|_| Error::MalformedAddress("domain is not utf-8".into()))?
                    .to_string();
                let port = u16::from_be_bytes([buf[2 + len], buf[3 + len]]);
                Ok((Address::Domain(domain, port), 2 + len + 2))
            }
            other => Err(Error::MalformedAddress(format!("unknown atyp {:#04x}", other))),
        }
    }
}

/// Encode a textual `host:port` straight into a wire header.
pub fn encode_host_port(s: &str) -> Result<Vec<u8>> {
    Ok(Address::from_host_port(s)?.to_wire())
}

fn is_domain_name(host: &str) -> bool {
    host.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && label
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
    })
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Address::Socket(addr) => write!(f, "{}", addr),
            Address::Domain(domain, port) => write!(f, "{}:{}", domain, port),
        }
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        Address::Socket(addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(addr: Address) {
        let wire = addr.to_wire();
        let (decoded, consumed) = Address::from_wire(&wire).unwrap();
        assert_eq!(decoded, addr);
        assert_eq!(consumed, wire.len());
    }

    #[test]
    fn test_roundtrip_ipv4() {
        roundtrip(Address::from_host_port("93.184.216.34:80").unwrap());
    }

    #[test]
    fn test_roundtrip_ipv6() {
        roundtrip(Address::from_host_port("[2001:db8::1]:443").unwrap());
    }

    #[test]
    fn test_roundtrip_domain() {
        roundtrip(Address::domain("example.com", 443));
        roundtrip(Address::domain("a.io", 1));
        let long = format!("{}.com", "a".repeat(63));
        roundtrip(Address::from_host_port(&format!("{}:65535", long)).unwrap());
    }

    #[test]
    fn test_ipv4_header_bytes() {
        let wire = encode_host_port("93.184.216.34:80").unwrap();
        assert_eq!(wire, [0x01, 0x5d, 0xb8, 0xd8, 0x22, 0x00, 0x50]);
    }

    #[test]
    fn test_dns_resolver_header_bytes() {
        let wire = encode_host_port("8.8.8.8:53").unwrap();
        assert_eq!(wire, [0x01, 0x08, 0x08, 0x08, 0x08, 0x00, 0x35]);
    }

    #[test]
    fn test_rejects_overlong_domain() {
        let host = format!(
            "{}.{}.{}.{}.example",
            "a".repeat(63),
            "b".repeat(63),
            "c".repeat(63),
            "d".repeat(63)
        );
        assert!(host.len() > 255);
        assert!(matches!(
            Address::from_host_port(&format!("{}:80", host)),
            Err(Error::MalformedAddress(_))
        ));
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(Address::from_host_port("no port here").is_err());
        assert!(Address::from_host_port("bad host!:80").is_err());
        assert!(Address::from_host_port("example.com:notaport").is_err());
    }

    #[test]
    fn test_decode_truncated() {
        assert!(Address::from_wire(&[0x01, 1, 2, 3]).is_err());
        assert!(Address::from_wire(&[0x03, 10, b'a']).is_err());
        assert!(Address::from_wire(&[0x7f]).is_err());
        assert!(Address::from_wire(&[]).is_err());
    }
}
