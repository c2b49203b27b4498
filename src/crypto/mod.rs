//! Tunnel cryptography
//!
//! A [`Cipher`] is built once per backend from a cipher name and passphrase,
//! then stamps out wrappers for the two tunnel shapes:
//! - [`Cipher::wrap_stream`]: AEAD chunk framing over a byte stream
//! - [`Cipher::wrap_packet`]: per-datagram sealing over a UDP socket
//!
//! Each stream and each datagram carries its own random salt; session keys
//! are derived from the master key and the salt with HKDF-SHA256, so no
//! nonce is ever reused across sessions.

mod aead;
mod packet;
mod stream;

pub use aead::{AeadCipher, CipherKind};
pub use packet::{open_datagram, seal_datagram, CipherPacket};
pub use stream::CipherStream;

use std::sync::Arc;

use tokio::net::UdpSocket;

use crate::common::Stream;
use crate::error::Result;

/// Nonce size for AEAD ciphers (12 bytes)
pub const NONCE_SIZE: usize = 12;

/// Tag size for AEAD ciphers (16 bytes)
pub const TAG_SIZE: usize = 16;

/// Maximum plaintext per stream chunk
pub const MAX_CHUNK_SIZE: usize = 16 * 1024 - TAG_SIZE;

/// Cipher materials for one backend.
#[derive(Clone)]
pub struct Cipher {
    kind: CipherKind,
    master_key: Arc<Vec<u8>>,
}

impl Cipher {
    /// Build from a configured cipher name and passphrase.
    ///
    /// Fails on an unknown name or an empty passphrase; either is fatal to
    /// the backend at startup.
    pub fn new(name: &str, passphrase: &str) -> Result<Self> {
        let kind = CipherKind::from_name(name)?;
        if passphrase.is_empty() {
            return Err(crate::error::Error::CipherInit("empty passphrase".into()));
        }
        let master_key = derive_key(
            passphrase.as_bytes(),
            b"fluxgate-master",
            b"master key",
            kind.key_size(),
        )?;
        Ok(Self {
            kind,
            master_key: Arc::new(master_key),
        })
    }

    pub fn kind(&self) -> CipherKind {
        self.kind
    }

    /// Derive the session key for a given salt.
    fn session_key(&self, salt: &[u8]) -> Result<Vec<u8>> {
        derive_key(&self.master_key, salt, b"session key", self.kind.key_size())
    }

    /// Apply AEAD chunk framing on top of any byte stream.
    pub fn wrap_stream(&self, inner: Stream) -> Stream {
        Box::new(CipherStream::new(inner, self.clone()))
    }

    /// Apply per-datagram sealing on top of a UDP socket.
    pub fn wrap_packet(&self, socket: UdpSocket) -> CipherPacket {
        CipherPacket::new(socket, self.clone())
    }
}

/// Generate cryptographically secure random bytes
pub fn random_bytes(len: usize) -> Vec<u8> {
    use rand::RngCore;
    let mut bytes = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

/// Derive a key using HKDF-SHA256
pub fn derive_key(secret: &[u8], salt: &[u8], info: &[u8], key_len: usize) -> Result<Vec<u8>> {
    use hkdf::Hkdf;
    use sha2::Sha256;

    let hk = Hkdf::<Sha256>::new(Some(salt), secret);
    let mut okm = vec![0u8; key_len];
    hk.expand(info, &mut okm)
        .map_err(|e| crate::error::Error::Crypto(format!("HKDF expand failed: {}", e)))?;
    Ok(okm)
}

/// Increment a counter nonce in place, little-endian across all bytes.
pub(crate) fn bump_nonce(nonce: &mut [u8; NONCE_SIZE]) {
    for b in nonce.iter_mut() {
        *b = b.wrapping_add(1);
        if *b != 0 {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_factory_rejects_bad_inputs() {
        assert!(Cipher::new("rot13", "secret").is_err());
        assert!(Cipher::new("aes-128-gcm", "").is_err());
        assert!(Cipher::new("chacha20-poly1305", "secret").is_ok());
    }

    #[test]
    fn test_same_passphrase_same_key() {
        let a = Cipher::new("aes-256-gcm", "hunter2").unwrap();
        let b = Cipher::new("aes-256-gcm", "hunter2").unwrap();
        assert_eq!(*a.master_key, *b.master_key);
        assert_eq!(
            a.session_key(b"0123456789abcdef").unwrap(),
            b.session_key(b"0123456789abcdef").unwrap()
        );
    }

    #[test]
    fn test_bump_nonce_carries() {
        let mut nonce = [0xffu8, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0];
        bump_nonce(&mut nonce);
        assert_eq!(nonce[0], 0);
        assert_eq!(nonce[1], 1);
    }

    #[test]
    fn test_derive_key_len() {
        let key = derive_key(b"secret", b"salt", b"info", 32).unwrap();
        assert_eq!(key.len(), 32);
    }
}
