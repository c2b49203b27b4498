//! AEAD-framed byte stream
//!
//! Wire layout, per direction:
//!
//! ```text
//! [salt][seal(len)][seal(chunk)][seal(len)][seal(chunk)]...
//! ```
//!
//! `len` is the 2-byte big-endian plaintext chunk length. Each direction has
//! its own salt, session key, and counter nonce; the nonce is bumped after
//! every seal/open so lengths and payloads never share one.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::common::Stream;

use super::{bump_nonce, random_bytes, AeadCipher, Cipher, MAX_CHUNK_SIZE, NONCE_SIZE, TAG_SIZE};

macro_rules! poll_read_into {
    ($inner:expr, $cx:expr, $buf:expr, $pos:expr) => {{
        let mut temp = ReadBuf::new(&mut $buf[$pos..]);
        match Pin::new(&mut $inner).poll_read($cx, &mut temp) {
            Poll::Ready(Ok(())) => temp.filled().len(),
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            Poll::Pending => return Poll::Pending,
        }
    }};
}

struct Direction {
    cipher: AeadCipher,
    nonce: [u8; NONCE_SIZE],
}

impl Direction {
    fn new(cipher: &Cipher, salt: &[u8]) -> io::Result<Self> {
        let key = cipher
            .session_key(salt)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
        let aead = AeadCipher::new(cipher.kind(), &key)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
        Ok(Self {
            cipher: aead,
            nonce: [0u8; NONCE_SIZE],
        })
    }

    fn seal(&mut self, plaintext: &[u8]) -> io::Result<Vec<u8>> {
        let out = self
            .cipher
            .seal(&self.nonce, plaintext)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
        bump_nonce(&mut self.nonce);
        Ok(out)
    }

    fn open(&mut self, ciphertext: &[u8]) -> io::Result<Vec<u8>> {
        let out = self
            .cipher
            .open(&self.nonce, ciphertext)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
        bump_nonce(&mut self.nonce);
        Ok(out)
    }
}

enum ReadState {
    Salt { buf: Vec<u8>, pos: usize },
    Length { buf: [u8; 2 + TAG_SIZE], pos: usize },
    Payload { buf: Vec<u8>, pos: usize },
}

/// AEAD chunk framing over any inner byte stream.
pub struct CipherStream {
    inner: Stream,
    cipher: Cipher,

    // Write state
    write_dir: Option<Direction>,
    write_buf: Vec<u8>,
    write_pos: usize,
    write_consumed: usize,

    // Read state
    read_dir: Option<Direction>,
    read_state: ReadState,
    read_buf: Vec<u8>,
    read_pos: usize,
}

impl CipherStream {
    pub fn new(inner: Stream, cipher: Cipher) -> Self {
        let salt_size = cipher.kind().salt_size();
        Self {
            inner,
            cipher,
            write_dir: None,
            write_buf: Vec::new(),
            write_pos: 0,
            write_consumed: 0,
            read_dir: None,
            read_state: ReadState::Salt {
                buf: vec![0u8; salt_size],
                pos: 0,
            },
            read_buf: Vec::new(),
            read_pos: 0,
        }
    }

    /// Seal one chunk into `write_buf`, emitting the salt first on the
    /// initial call.
    fn fill_write_buf(&mut self, data: &[u8]) -> io::Result<()> {
        let size = data.len().min(MAX_CHUNK_SIZE);
        let mut out = Vec::new();

        if self.write_dir.is_none() {
            let salt = random_bytes(self.cipher.kind().salt_size());
            self.write_dir = Some(Direction::new(&self.cipher, &salt)?);
            out.extend_from_slice(&salt);
        }
        let dir = self.write_dir.as_mut().expect("write direction initialized");

        let len_bytes = (size as u16).to_be_bytes();
        out.extend_from_slice(&dir.seal(&len_bytes)?);
        out.extend_from_slice(&dir.seal(&data[..size])?);

        self.write_buf = out;
        self.write_pos = 0;
        self.write_consumed = size;
        Ok(())
    }
}

impl AsyncRead for CipherStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        // Serve decrypted leftovers first
        if this.read_pos < this.read_buf.len() {
            let n = (this.read_buf.len() - this.read_pos).min(buf.remaining());
            buf.put_slice(&this.read_buf[this.read_pos..this.read_pos + n]);
            this.read_pos += n;
            return Poll::Ready(Ok(()));
        }
        this.read_buf.clear();
        this.read_pos = 0;

        loop {
            match &mut this.read_state {
                ReadState::Salt { buf: salt, pos } => {
                    let n = poll_read_into!(this.inner, cx, salt, *pos);
                    if n == 0 {
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "stream closed while reading salt",
                        )));
                    }
                    *pos += n;
                    if *pos < salt.len() {
                        continue;
                    }
                    this.read_dir = Some(Direction::new(&this.cipher, salt)?);
                    this.read_state = ReadState::Length {
                        buf: [0u8; 2 + TAG_SIZE],
                        pos: 0,
                    };
                }

                ReadState::Length { buf: lbuf, pos } => {
                    let n = poll_read_into!(this.inner, cx, lbuf, *pos);
                    if n == 0 {
                        if *pos == 0 {
                            // Clean EOF on a chunk boundary
                            return Poll::Ready(Ok(()));
                        }
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "stream closed while reading chunk length",
                        )));
                    }
                    *pos += n;
                    if *pos < lbuf.len() {
                        continue;
                    }
                    let sealed = *lbuf;
                    let dir = this.read_dir.as_mut().expect("read direction initialized");
                    let plain = dir.open(&sealed)?;
                    let len = u16::from_be_bytes([plain[0], plain[1]]) as usize;
                    if len == 0 || len > MAX_CHUNK_SIZE {
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            format!("bad chunk length {}", len),
                        )));
                    }
                    this.read_state = ReadState::Payload {
                        buf: vec![0u8; len + TAG_SIZE],
                        pos: 0,
                    };
                }

                ReadState::Payload { buf: pbuf, pos } => {
                    let n = poll_read_into!(this.inner, cx, pbuf, *pos);
                    if n == 0 {
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "stream closed while reading chunk",
                        )));
                    }
                    *pos += n;
                    if *pos < pbuf.len() {
                        continue;
                    }
                    let sealed = std::mem::take(pbuf);
                    this.read_state = ReadState::Length {
                        buf: [0u8; 2 + TAG_SIZE],
                        pos: 0,
                    };
                    let dir = this.read_dir.as_mut().expect("read direction initialized");
                    let plain = dir.open(&sealed)?;

                    let n = plain.len().min(buf.remaining());
                    buf.put_slice(&plain[..n]);
                    if n < plain.len() {
                        this.read_buf = plain;
                        this.read_pos = n;
                    }
                    return Poll::Ready(Ok(()));
                }
            }
        }
    }
}

impl AsyncWrite for CipherStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        let this = self.get_mut();

        if this.write_pos >= this.write_buf.len() {
            this.fill_write_buf(buf)?;
        }

        // Drain the sealed chunk; the caller re-polls with the same data
        // until we report it consumed.
        while this.write_pos < this.write_buf.len() {
            match Pin::new(&mut this.inner).poll_write(cx, &this.write_buf[this.write_pos..]) {
                Poll::Ready(Ok(0)) => {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "inner stream refused write",
                    )))
                }
                Poll::Ready(Ok(n)) => this.write_pos += n,
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            }
        }

        this.write_buf.clear();
        this.write_pos = 0;
        Poll::Ready(Ok(this.write_consumed))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn pair(cipher: &Cipher) -> (CipherStream, CipherStream) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        (
            CipherStream::new(Box::new(a), cipher.clone()),
            CipherStream::new(Box::new(b), cipher.clone()),
        )
    }

    #[tokio::test]
    async fn test_roundtrip_small() {
        let cipher = Cipher::new("chacha20-poly1305", "secret").unwrap();
        let (mut tx, mut rx) = pair(&cipher);

        tx.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
        tx.flush().await.unwrap();

        let mut out = vec![0u8; 18];
        rx.read_exact(&mut out).await.unwrap();
        assert_eq!(&out, b"GET / HTTP/1.1\r\n\r\n");
    }

    #[tokio::test]
    async fn test_roundtrip_multi_chunk() {
        let cipher = Cipher::new("aes-128-gcm", "secret").unwrap();
        let (mut tx, mut rx) = pair(&cipher);

        let payload: Vec<u8> = (0..(MAX_CHUNK_SIZE * 2 + 77)).map(|i| i as u8).collect();
        let expected = payload.clone();
        let writer = tokio::spawn(async move {
            tx.write_all(&payload).await.unwrap();
            tx.flush().await.unwrap();
            tx.shutdown().await.unwrap();
        });

        let mut out = Vec::new();
        rx.read_to_end(&mut out).await.unwrap();
        writer.await.unwrap();
        assert_eq!(out, expected);
    }

    #[tokio::test]
    async fn test_wrong_passphrase_rejected() {
        let good = Cipher::new("aes-256-gcm", "secret").unwrap();
        let bad = Cipher::new("aes-256-gcm", "not-secret").unwrap();
        let (a, b) = tokio::io::duplex(4096);
        let mut tx = CipherStream::new(Box::new(a), good);
        let mut rx = CipherStream::new(Box::new(b), bad);

        tx.write_all(b"hello").await.unwrap();
        tx.flush().await.unwrap();

        let mut out = [0u8; 5];
        assert!(rx.read_exact(&mut out).await.is_err());
    }
}
