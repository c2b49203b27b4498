//! Reliable-mux transport over UDP
//!
//! A pool of QUIC connections ("links") to the remote relay; each logical
//! stream handed to the TCP relay is one bidirectional QUIC stream. The pool
//! dials lazily: a new link only when every existing link is at its
//! per-link stream cap, and a hard failure once `max_links` links are all
//! saturated — the relay then falls back to the plain tunnel.
//!
//! The link carries its own encryption (QUIC TLS), so mux streams are not
//! additionally cipher-wrapped. The relay server is addressed by IP and
//! authenticated operationally; certificate verification is disabled.

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::debug;

use crate::config::MuxSettings;
use crate::error::{Error, Result};

/// Idle timeout for a pooled link; the relay server holds the other end.
const LINK_IDLE_TIMEOUT: Duration = Duration::from_secs(120);

/// Keep-alive interval so NAT entries along the path stay warm.
const LINK_KEEPALIVE: Duration = Duration::from_secs(15);

struct MuxLink {
    conn: quinn::Connection,
    live: Arc<AtomicUsize>,
}

/// Pool of multiplexed links to one remote.
pub struct MuxTransport {
    remote: SocketAddr,
    server_name: String,
    max_links: usize,
    max_streams_per_link: usize,
    endpoint: quinn::Endpoint,
    links: Mutex<Vec<MuxLink>>,
}

impl MuxTransport {
    pub fn new(remote: SocketAddr, settings: &MuxSettings) -> Result<Self> {
        let bind: SocketAddr = if remote.is_ipv6() {
            "[::]:0".parse().expect("literal addr")
        } else {
            "0.0.0.0:0".parse().expect("literal addr")
        };

        let crypto = rustls::ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .map_err(|e| Error::Config(format!("mux tls versions: {}", e)))?
        .dangerous()
        .with_custom_certificate_verifier(SkipServerVerification::new())
        .with_no_client_auth();
        let quic_crypto = quinn::crypto::rustls::QuicClientConfig::try_from(crypto)
            .map_err(|e| Error::Config(format!("mux tls config: {}", e)))?;

        let mut client_config = quinn::ClientConfig::new(Arc::new(quic_crypto));
        let mut transport = quinn::TransportConfig::default();
        transport.keep_alive_interval(Some(LINK_KEEPALIVE));
        transport.max_idle_timeout(Some(
            LINK_IDLE_TIMEOUT
                .try_into()
                .map_err(|_| Error::Config("mux idle timeout out of range".into()))?,
        ));
        client_config.transport_config(Arc::new(transport));

        let mut endpoint = quinn::Endpoint::client(bind)?;
        endpoint.set_default_client_config(client_config);

        Ok(Self {
            remote,
            server_name: remote.ip().to_string(),
            max_links: settings.max_links,
            max_streams_per_link: settings.max_streams_per_link,
            endpoint,
            links: Mutex::new(Vec::new()),
        })
    }

    /// Hand out a fresh logical stream, dialing a new link if every pooled
    /// link is at its stream cap. Fails with `MuxSaturated` when both the
    /// per-link and link caps are exhausted.
    pub async fn get_stream(&self) -> Result<MuxStream> {
        let (conn, live) = {
            let mut links = self.links.lock();
            links.retain(|link| {
                if link.conn.close_reason().is_some() {
                    debug!("mux: retiring dead link to {}", self.remote);
                    false
                } else {
                    true
                }
            });

            match links
                .iter()
                .find(|l| l.live.load(Ordering::Acquire) < self.max_streams_per_link)
            {
                Some(link) => (Some(link.conn.clone()), Some(link.live.clone())),
                None if links.len() < self.max_links => (None, None),
                None => return Err(Error::MuxSaturated),
            }
        };

        let (conn, live) = match (conn, live) {
            (Some(c), Some(l)) => (c, l),
            _ => {
                let conn = self.dial_link().await?;
                let live = Arc::new(AtomicUsize::new(0));
                let mut links = self.links.lock();
                if links.len() >= self.max_links {
                    // Raced with another dialer past the cap; use it anyway,
                    // it dies with its streams.
                    conn.close(0u32.into(), b"over cap");
                    return Err(Error::MuxSaturated);
                }
                links.push(MuxLink {
                    conn: conn.clone(),
                    live: live.clone(),
                });
                (conn, live)
            }
        };

        match conn.open_bi().await {
            Ok((send, recv)) => Ok(MuxStream::new(send, recv, live)),
            Err(e) => {
                let mut links = self.links.lock();
                links.retain(|l| l.conn.stable_id() != conn.stable_id());
                Err(Error::DialRemote(format!("mux open stream: {}", e)))
            }
        }
    }

    async fn dial_link(&self) -> Result<quinn::Connection> {
        let connecting = self
            .endpoint
            .connect(self.remote, &self.server_name)
            .map_err(|e| Error::DialRemote(format!("mux connect: {}", e)))?;
        let conn = connecting
            .await
            .map_err(|e| Error::DialRemote(format!("mux handshake: {}", e)))?;
        debug!("mux: new link to {}", self.remote);
        Ok(conn)
    }

    /// Close every link; handed-out streams die with their links.
    pub fn stop(&self) {
        let mut links = self.links.lock();
        for link in links.drain(..) {
            link.conn.close(0u32.into(), b"shutdown");
        }
        self.endpoint.close(0u32.into(), b"shutdown");
    }

    #[cfg(test)]
    pub(crate) fn link_count(&self) -> usize {
        self.links.lock().len()
    }
}

/// Decrements the owning link's live-stream counter on drop.
struct StreamGuard {
    live: Arc<AtomicUsize>,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::AcqRel);
    }
}

/// One logical stream over a pooled link.
pub struct MuxStream {
    send: quinn::SendStream,
    recv: quinn::RecvStream,
    _guard: StreamGuard,
}

impl MuxStream {
    fn new(send: quinn::SendStream, recv: quinn::RecvStream, live: Arc<AtomicUsize>) -> Self {
        live.fetch_add(1, Ordering::AcqRel);
        Self {
            send,
            recv,
            _guard: StreamGuard { live },
        }
    }
}

impl AsyncRead for MuxStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.recv).poll_read(cx, buf)
    }
}

impl AsyncWrite for MuxStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        tokio::io::AsyncWrite::poll_write(Pin::new(&mut self.send), cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        tokio::io::AsyncWrite::poll_flush(Pin::new(&mut self.send), cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        tokio::io::AsyncWrite::poll_shutdown(Pin::new(&mut self.send), cx)
    }
}

/// Accept any server certificate; the relay endpoint is pinned by address.
#[derive(Debug)]
struct SkipServerVerification(Arc<rustls::crypto::CryptoProvider>);

impl SkipServerVerification {
    fn new() -> Arc<Self> {
        Arc::new(Self(Arc::new(rustls::crypto::ring::default_provider())))
    }
}

impl rustls::client::danger::ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
