//! Transport layer
//!
//! - `redirect`: transparent-redirect socket plumbing (TPROXY listeners,
//!   recvmsg with ancillary data, spoofed-source reply sockets)
//! - `mux`: optional multiplexed-session transport over UDP, tried before
//!   the plain tunnel when enabled

pub mod mux;
pub mod redirect;

pub use mux::{MuxStream, MuxTransport};
pub use redirect::{
    decode_original_dst, dial_spoofed_udp, listen_transparent_tcp, listen_transparent_udp,
    recv_redirected, set_keepalive,
};
