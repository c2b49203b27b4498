//! Fluxgate - transparent tunneling gateway for a LAN
//!
//! # Architecture
//!
//! ```text
//! packet filter (TPROXY)
//! → transparent listeners (TCP accept / UDP recvmsg)
//! → proxy client facade
//! → tunnel backend (mux or cipher-wrapped plain tunnel)
//! → remote relay
//!
//! LAN resolver traffic
//! → DNS server → policy check → local resolver | tunnel
//!              → routing table / policy list / TTL cache
//! ```
//!
//! ## Core principles
//!
//! - Per-flow state is confined to the flow: a relay failure tears down its
//!   own sockets and NAT entry, never the backend
//! - Policy decisions live in the DNS plane; the data plane only forwards
//! - All tunnel payloads lead with the compact destination header
//!
//! ## Module Structure
//!
//! ```text
//! src/
//! ├── common/          # Core types: Stream, Address, buffer pools
//! ├── crypto/          # Cipher factory, AEAD stream/packet wrappers
//! ├── transport/       # Transparent sockets, mux transport
//! ├── proxy/           # Backends, listeners, relay loop
//! ├── dns/             # Split-horizon DNS server and cache
//! └── policy/          # Policy list and routing table
//! ```

// Core types
pub mod common;
pub mod error;

// Data plane
pub mod crypto;
pub mod proxy;
pub mod transport;

// DNS plane
pub mod dns;
pub mod policy;

// Supporting modules
pub mod config;

// Re-exports for convenience
pub use common::{Address, LeakyPool, Stream};
pub use config::Config;
pub use dns::DnsServer;
pub use error::{Error, Result};
pub use policy::{PolicyList, RoutingTable};
pub use proxy::{ProxyBackend, ProxyClient};
