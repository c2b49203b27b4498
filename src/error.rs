//! Error types for fluxgate

use thiserror::Error;

/// Main error type for fluxgate
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Malformed address: {0}")]
    MalformedAddress(String),

    #[error("No original destination in ancillary data")]
    NoOriginalDst,

    #[error("Cipher init failed: {0}")]
    CipherInit(String),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Dial remote failed: {0}")]
    DialRemote(String),

    #[error("Write remote failed: {0}")]
    WriteRemote(String),

    #[error("Read remote failed: {0}")]
    ReadRemote(String),

    #[error("Mux saturated")]
    MuxSaturated,

    #[error("Datagram shorter than address header")]
    ShortDatagram,

    #[error("DNS pack failed: {0}")]
    DnsPack(String),

    #[error("DNS upstream failed: {0}")]
    DnsUpstream(String),

    #[error("Listener closed")]
    ListenClosed,

    #[error("Timeout")]
    Timeout,
}

impl Error {
    /// True for deadline-style failures that per-flow workers drop silently.
    pub fn is_timeout(&self) -> bool {
        match self {
            Error::Timeout => true,
            Error::Io(e) => e.kind() == std::io::ErrorKind::TimedOut,
            _ => false,
        }
    }
}

/// Result type alias for fluxgate
pub type Result<T> = std::result::Result<T, Error>;
