//! AEAD register
//!
//! The three ciphers the tunnel speaks:
//! - ChaCha20-Poly1305
//! - AES-128-GCM
//! - AES-256-GCM

use aes_gcm::{
    aead::{Aead as AeadTrait, KeyInit},
    Aes128Gcm, Aes256Gcm, Nonce,
};
use chacha20poly1305::ChaCha20Poly1305;

use super::{NONCE_SIZE, TAG_SIZE};
use crate::error::{Error, Result};

/// Cipher types supported
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherKind {
    ChaCha20Poly1305,
    Aes128Gcm,
    Aes256Gcm,
}

impl CipherKind {
    /// Resolve a configuration name. Unknown names fail backend init.
    pub fn from_name(name: &str) -> Result<Self> {
        match name.to_lowercase().as_str() {
            "chacha20-poly1305" | "chacha20-ietf-poly1305" => Ok(CipherKind::ChaCha20Poly1305),
            "aes-128-gcm" => Ok(CipherKind::Aes128Gcm),
            "aes-256-gcm" => Ok(CipherKind::Aes256Gcm),
            other => Err(Error::CipherInit(format!("unknown cipher: {}", other))),
        }
    }

    /// Get the key size for this cipher
    pub fn key_size(&self) -> usize {
        match self {
            CipherKind::ChaCha20Poly1305 => 32,
            CipherKind::Aes128Gcm => 16,
            CipherKind::Aes256Gcm => 32,
        }
    }

    /// Salt length prepended to every stream and datagram; same as the key.
    pub fn salt_size(&self) -> usize {
        self.key_size()
    }
}

/// A keyed AEAD instance sealing and opening with caller-supplied nonces.
pub struct AeadCipher {
    inner: CipherInner,
}

enum CipherInner {
    ChaCha20Poly1305(Box<ChaCha20Poly1305>),
    Aes128Gcm(Box<Aes128Gcm>),
    Aes256Gcm(Box<Aes256Gcm>),
}

impl AeadCipher {
    pub fn new(kind: CipherKind, key: &[u8]) -> Result<Self> {
        if key.len() != kind.key_size() {
            return Err(Error::Crypto(format!(
                "invalid key size: expected {}, got {}",
                kind.key_size(),
                key.len()
            )));
        }

        let inner = match kind {
            CipherKind::ChaCha20Poly1305 => CipherInner::ChaCha20Poly1305(Box::new(
                ChaCha20Poly1305::new_from_slice(key)
                    .map_err(|e| Error::Crypto(format!("cipher construction failed: {}", e)))?,
            )),
            CipherKind::Aes128Gcm => CipherInner::Aes128Gcm(Box::new(
                Aes128Gcm::new_from_slice(key)
                    .map_err(|e| Error::Crypto(format!("cipher construction failed: {}", e)))?,
            )),
            CipherKind::Aes256Gcm => CipherInner::Aes256Gcm(Box::new(
                Aes256Gcm::new_from_slice(key)
                    .map_err(|e| Error::Crypto(format!("cipher construction failed: {}", e)))?,
            )),
        };

        Ok(Self { inner })
    }

    /// Encrypt; output is `plaintext.len() + TAG_SIZE` bytes.
    pub fn seal(&self, nonce: &[u8; NONCE_SIZE], plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce = Nonce::from_slice(nonce);
        let result = match &self.inner {
            CipherInner::ChaCha20Poly1305(c) => c.encrypt(nonce, plaintext),
            CipherInner::Aes128Gcm(c) => c.encrypt(nonce, plaintext),
            CipherInner::Aes256Gcm(c) => c.encrypt(nonce, plaintext),
        };
        result.map_err(|e| Error::Crypto(format!("encryption failed: {}", e)))
    }

    /// Decrypt and authenticate `ciphertext || tag`.
    pub fn open(&self, nonce: &[u8; NONCE_SIZE], ciphertext: &[u8]) -> Result<Vec<u8>> {
        if ciphertext.len() < TAG_SIZE {
            return Err(Error::Crypto("ciphertext too short".to_string()));
        }
        let nonce = Nonce::from_slice(nonce);
        let result = match &self.inner {
            CipherInner::ChaCha20Poly1305(c) => c.decrypt(nonce, ciphertext),
            CipherInner::Aes128Gcm(c) => c.decrypt(nonce, ciphertext),
            CipherInner::Aes256Gcm(c) => c.decrypt(nonce, ciphertext),
        };
        result.map_err(|e| Error::Crypto(format!("decryption failed: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::random_bytes;

    #[test]
    fn test_seal_open_all_kinds() {
        for kind in [
            CipherKind::ChaCha20Poly1305,
            CipherKind::Aes128Gcm,
            CipherKind::Aes256Gcm,
        ] {
            let key = random_bytes(kind.key_size());
            let cipher = AeadCipher::new(kind, &key).unwrap();
            let nonce = [7u8; NONCE_SIZE];
            let sealed = cipher.seal(&nonce, b"redirected datagram").unwrap();
            assert_eq!(sealed.len(), b"redirected datagram".len() + TAG_SIZE);
            let opened = cipher.open(&nonce, &sealed).unwrap();
            assert_eq!(opened, b"redirected datagram");
        }
    }

    #[test]
    fn test_wrong_key_fails() {
        let cipher1 =
            AeadCipher::new(CipherKind::ChaCha20Poly1305, &random_bytes(32)).unwrap();
        let cipher2 =
            AeadCipher::new(CipherKind::ChaCha20Poly1305, &random_bytes(32)).unwrap();
        let nonce = [0u8; NONCE_SIZE];
        let sealed = cipher1.seal(&nonce, b"payload").unwrap();
        assert!(cipher2.open(&nonce, &sealed).is_err());
    }

    #[test]
    fn test_unknown_name_rejected() {
        assert!(CipherKind::from_name("rc4-md5").is_err());
        assert!(CipherKind::from_name("aes-256-gcm").is_ok());
    }
}
