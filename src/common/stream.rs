//! Stream abstraction
//!
//! Unified byte-stream type for the tunnel data plane. The relay code only
//! operates on `Stream`, never on a concrete socket type, so plain TCP,
//! cipher-wrapped TCP, and mux logical streams all flow through the same
//! copy loop.

use tokio::io::{AsyncRead, AsyncWrite};

/// The core stream type used throughout the data plane.
pub type Stream = Box<dyn AsyncReadWrite + Unpin + Send>;

/// Combined trait for async read + write
pub trait AsyncReadWrite: AsyncRead + AsyncWrite {}

impl<T: AsyncRead + AsyncWrite> AsyncReadWrite for T {}
