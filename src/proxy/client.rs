//! Proxy client facade
//!
//! Owns the pair of transparent listeners and the ordered backend list. The
//! TCP loop hands each accepted connection to a worker; the UDP loop reads
//! datagrams together with their ancillary blob, recovers the original
//! destination, and hands each datagram to a worker. Buffers come from the
//! payload and ancillary pools and are returned on every exit path.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use parking_lot::{Mutex, RwLock};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::common::{
    LeakyPool, UDP_BUFFER_POOL_SIZE, UDP_BUFFER_SIZE, UDP_OOB_BUFFER_SIZE, UDP_OOB_POOL_SIZE,
};
use crate::config::Config;
use crate::dns::DnsExchanger;
use crate::error::{Error, Result};
use crate::transport::{
    decode_original_dst, listen_transparent_tcp, listen_transparent_udp, recv_redirected,
};

use super::backend::ProxyBackend;
use super::Network;

/// The listener pair plus the backends they feed.
pub struct ProxyClient {
    addr: SocketAddr,
    backends: RwLock<Vec<Arc<ProxyBackend>>>,
    udp_pool: Arc<LeakyPool>,
    oob_pool: Arc<LeakyPool>,
    shutdown_tx: broadcast::Sender<()>,
    stopped: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ProxyClient {
    /// Create the backends, bind both transparent listeners, and start the
    /// accept loops. Backend-init errors abort startup.
    pub async fn start(config: &Config) -> Result<Arc<Self>> {
        let tcp_timeout = Duration::from_secs(config.tcp_timeout_secs);
        let udp_timeout = Duration::from_secs(config.udp_timeout_secs);

        let mut backends = Vec::new();
        for server in &config.servers {
            let backend = ProxyBackend::new(server, tcp_timeout, udp_timeout)?;
            info!("proxy backend created for {}", server.address);
            backends.push(Arc::new(backend));
        }
        if backends.is_empty() {
            return Err(Error::Config("no tunnel servers configured".into()));
        }

        let tcp_listener = listen_transparent_tcp(config.listen)?;
        let udp_socket = listen_transparent_udp(config.listen)?;
        let (shutdown_tx, _) = broadcast::channel(1);

        let client = Arc::new(Self {
            addr: config.listen,
            backends: RwLock::new(backends),
            udp_pool: Arc::new(LeakyPool::new(UDP_BUFFER_POOL_SIZE, UDP_BUFFER_SIZE)),
            oob_pool: Arc::new(LeakyPool::new(UDP_OOB_POOL_SIZE, UDP_OOB_BUFFER_SIZE)),
            shutdown_tx,
            stopped: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        });

        let tcp_task = tokio::spawn(
            client
                .clone()
                .run_tcp(tcp_listener, client.shutdown_tx.subscribe()),
        );
        let udp_task = tokio::spawn(
            client
                .clone()
                .run_udp(udp_socket, client.shutdown_tx.subscribe()),
        );
        client.tasks.lock().extend([tcp_task, udp_task]);

        info!("proxy client started on {}", config.listen);
        Ok(client)
    }

    /// Backend selection seam. First backend for now; UDP flows would need
    /// a NAT table shared across backends before this can spread load.
    fn pick_backend(&self, network: Network) -> Option<Arc<ProxyBackend>> {
        let backends = self.backends.read();
        match network {
            Network::Tcp => backends.first().cloned(),
            // TODO: per-flow backend selection needs a global UDP NAT table
            Network::Udp => backends.first().cloned(),
        }
    }

    async fn run_tcp(self: Arc<Self>, listener: TcpListener, mut shutdown_rx: broadcast::Receiver<()>) {
        info!("TCP transparent listener on {}", self.addr);
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                res = listener.accept() => match res {
                    Ok((conn, peer)) => {
                        let client = self.clone();
                        tokio::spawn(async move {
                            client.handle_tcp(conn, peer).await;
                        });
                    }
                    Err(e) => {
                        if self.stopped.load(Ordering::SeqCst) {
                            break;
                        }
                        error!("TCP accept failed: {}", e);
                    }
                },
            }
        }
        debug!("TCP listener on {} exited", self.addr);
    }

    async fn handle_tcp(&self, conn: TcpStream, peer: SocketAddr) {
        let backend = match self.pick_backend(Network::Tcp) {
            Some(backend) => backend,
            None => {
                error!("no backend available for TCP relay");
                return;
            }
        };
        match backend.relay_tcp(conn).await {
            Ok((inbound, outbound)) => {
                debug!(
                    "TCP relay from {} done: {} in, {} out",
                    peer, inbound, outbound
                );
            }
            // Idle timeouts are how relays normally end.
            Err(e) if e.is_timeout() => {}
            Err(e) => error!("TCP relay from {} failed: {}", peer, e),
        }
    }

    async fn run_udp(self: Arc<Self>, socket: UdpSocket, mut shutdown_rx: broadcast::Receiver<()>) {
        info!("UDP transparent listener on {}", self.addr);
        loop {
            let mut buf = self.udp_pool.get();
            let mut oob = self.oob_pool.get();
            // The shutdown arm must not touch the buffers while the receive
            // future still borrows them; unwrap after the select instead.
            let received = tokio::select! {
                _ = shutdown_rx.recv() => None,
                res = recv_redirected(&socket, &mut buf, &mut oob) => Some(res),
            };
            match received {
                Some(Ok((len, oob_len, src))) => {
                    let client = self.clone();
                    tokio::spawn(async move {
                        client.handle_udp(buf, oob, src, len, oob_len).await;
                    });
                }
                Some(Err(e)) => {
                    self.udp_pool.put(buf);
                    self.oob_pool.put(oob);
                    if self.stopped.load(Ordering::SeqCst) {
                        break;
                    }
                    error!("UDP recv failed: {}", e);
                }
                None => {
                    self.udp_pool.put(buf);
                    self.oob_pool.put(oob);
                    break;
                }
            }
        }
        debug!("UDP listener on {} exited", self.addr);
    }

    async fn handle_udp(
        &self,
        buf: BytesMut,
        oob: BytesMut,
        src: SocketAddr,
        len: usize,
        oob_len: usize,
    ) {
        let dst = decode_original_dst(&oob[..oob_len]);
        self.oob_pool.put(oob);

        match dst {
            Ok(dst) => match self.pick_backend(Network::Udp) {
                Some(backend) => {
                    if let Err(e) = backend.relay_udp(src, dst, &self.udp_pool, &buf[..len]).await
                    {
                        error!("UDP relay {} -> {} failed: {}", src, dst, e);
                    }
                }
                None => error!("no backend available for UDP relay"),
            },
            Err(e) => error!("recovering original dst failed: {}", e),
        }
        self.udp_pool.put(buf);
    }

    /// Close both listeners and every backend. Idempotent.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown_tx.send(());

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }

        let backends: Vec<Arc<ProxyBackend>> = self.backends.write().drain(..).collect();
        for backend in backends {
            backend.stop().await;
        }
        info!("proxy client stopped");
    }
}

#[async_trait]
impl DnsExchanger for ProxyClient {
    async fn exchange_dns(
        &self,
        client: &str,
        resolver: &str,
        query: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>> {
        let backend = self
            .pick_backend(Network::Udp)
            .ok_or_else(|| Error::DnsUpstream("no backend available".into()))?;
        backend.exchange_dns(client, resolver, query, timeout).await
    }
}
