//! Per-datagram sealing
//!
//! Every tunneled datagram stands alone: `[salt][seal(payload)]`, with the
//! session key derived from the salt and a zero nonce (one seal per key).

use std::net::SocketAddr;

use tokio::net::UdpSocket;

use crate::common::UDP_BUFFER_SIZE;
use crate::error::{Error, Result};

use super::{random_bytes, AeadCipher, Cipher, NONCE_SIZE, TAG_SIZE};

/// Seal a single datagram payload.
pub fn seal_datagram(cipher: &Cipher, payload: &[u8]) -> Result<Vec<u8>> {
    let salt = random_bytes(cipher.kind().salt_size());
    let key = cipher.session_key(&salt)?;
    let aead = AeadCipher::new(cipher.kind(), &key)?;
    let sealed = aead.seal(&[0u8; NONCE_SIZE], payload)?;

    let mut out = Vec::with_capacity(salt.len() + sealed.len());
    out.extend_from_slice(&salt);
    out.extend_from_slice(&sealed);
    Ok(out)
}

/// Open a single sealed datagram.
pub fn open_datagram(cipher: &Cipher, datagram: &[u8]) -> Result<Vec<u8>> {
    let salt_size = cipher.kind().salt_size();
    if datagram.len() < salt_size + TAG_SIZE {
        return Err(Error::ShortDatagram);
    }
    let key = cipher.session_key(&datagram[..salt_size])?;
    let aead = AeadCipher::new(cipher.kind(), &key)?;
    aead.open(&[0u8; NONCE_SIZE], &datagram[salt_size..])
}

/// A UDP socket whose datagrams are sealed on send and opened on receive.
pub struct CipherPacket {
    socket: UdpSocket,
    cipher: Cipher,
}

impl CipherPacket {
    pub fn new(socket: UdpSocket, cipher: Cipher) -> Self {
        Self { socket, cipher }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Seal and send one payload.
    pub async fn send_to(&self, payload: &[u8], target: SocketAddr) -> Result<usize> {
        let sealed = seal_datagram(&self.cipher, payload)?;
        self.socket
            .send_to(&sealed, target)
            .await
            .map_err(|e| Error::WriteRemote(e.to_string()))?;
        Ok(payload.len())
    }

    /// Receive and open one datagram into `buf`; returns payload length and
    /// the sender. Datagrams that fail authentication are an error, not a
    /// retry; the caller owns that policy.
    pub async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        let mut wire = vec![0u8; UDP_BUFFER_SIZE];
        let (n, from) = self
            .socket
            .recv_from(&mut wire)
            .await
            .map_err(|e| Error::ReadRemote(e.to_string()))?;
        let plain = open_datagram(&self.cipher, &wire[..n])?;
        if plain.len() > buf.len() {
            return Err(Error::ReadRemote("datagram larger than buffer".into()));
        }
        buf[..plain.len()].copy_from_slice(&plain);
        Ok((plain.len(), from))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_datagram_roundtrip() {
        let cipher = Cipher::new("chacha20-poly1305", "secret").unwrap();
        let sealed = seal_datagram(&cipher, b"dns query bytes").unwrap();
        assert_ne!(&sealed, b"dns query bytes");
        let opened = open_datagram(&cipher, &sealed).unwrap();
        assert_eq!(opened, b"dns query bytes");
    }

    #[test]
    fn test_datagram_unique_salts() {
        let cipher = Cipher::new("aes-128-gcm", "secret").unwrap();
        let a = seal_datagram(&cipher, b"same payload").unwrap();
        let b = seal_datagram(&cipher, b"same payload").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_short_datagram_rejected() {
        let cipher = Cipher::new("aes-256-gcm", "secret").unwrap();
        assert!(matches!(
            open_datagram(&cipher, &[0u8; 8]),
            Err(Error::ShortDatagram)
        ));
    }

    #[tokio::test]
    async fn test_socket_roundtrip() {
        let cipher = Cipher::new("aes-128-gcm", "secret").unwrap();
        let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let b_addr = b.local_addr().unwrap();

        let a = CipherPacket::new(a, cipher.clone());
        let b = CipherPacket::new(b, cipher);

        a.send_to(b"ping", b_addr).await.unwrap();
        let mut buf = [0u8; 64];
        let (n, from) = b.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ping");
        assert_eq!(from, a.local_addr().unwrap());
    }
}
