//! Forwarding data plane
//!
//! - `backend`: one tunnel backend per configured remote (NAT maps, relay
//!   primitives, DNS exchange)
//! - `client`: the facade owning the transparent listeners and backends
//! - `relay`: the bidirectional copy loop shared by all TCP relays

pub mod backend;
pub mod client;
pub mod relay;

pub use backend::ProxyBackend;
pub use client::ProxyClient;

/// Which plane a flow belongs to, for backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Tcp,
    Udp,
}
