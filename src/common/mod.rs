//! Common types and abstractions
//!
//! This module defines the core types used throughout the application:
//! - Stream: unified async I/O abstraction
//! - Address: network address representation and the on-wire header
//! - LeakyPool: fixed-size buffer pool for the UDP paths

mod address;
mod buffer;
mod stream;

pub use address::{encode_host_port, Address};
pub use buffer::{
    LeakyPool, UDP_BUFFER_POOL_SIZE, UDP_BUFFER_SIZE, UDP_OOB_BUFFER_SIZE, UDP_OOB_POOL_SIZE,
};
pub use stream::{AsyncReadWrite, Stream};

// Re-export error types from crate root
pub use crate::error::{Error, Result};
