//! Tunnel backend
//!
//! One backend per configured remote. It owns the cipher materials, the UDP
//! and DNS NAT maps, the timeouts, and the optional mux transport, and
//! exposes the three relay primitives the listeners and the DNS server
//! drive: `relay_tcp`, `relay_udp`, and `exchange_dns`.
//!
//! A single flow's failure never outlives the flow: errors tear down that
//! flow's NAT entry and sockets, nothing else.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::common::{encode_host_port, Address, LeakyPool, UDP_BUFFER_SIZE};
use crate::config::ServerConfig;
use crate::crypto::{Cipher, CipherPacket};
use crate::error::{Error, Result};
use crate::proxy::relay::copy_bidirectional;
use crate::transport::{dial_spoofed_udp, set_keepalive, MuxTransport};

type UdpNatMap = Arc<RwLock<HashMap<String, Arc<UdpNatEntry>>>>;

/// One live transparent UDP flow.
///
/// Owned by the map and by exactly one reader task; both sockets close when
/// the last owner drops, which happens once the reader exits and the entry
/// leaves the map.
struct UdpNatEntry {
    /// Bound to the original destination; replies through it reach the
    /// client with the expected source address.
    reply_sock: Arc<UdpSocket>,
    /// Cipher-wrapped socket facing the remote relay.
    tunnel_sock: Arc<CipherPacket>,
    /// Encoded original destination, prefix of every outbound datagram.
    header: Vec<u8>,
    /// Rolling read deadline, pushed forward by every outbound send.
    deadline: Mutex<Instant>,
    closed: AtomicBool,
    shutdown: Notify,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl UdpNatEntry {
    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.shutdown.notify_waiters();
    }
}

fn nat_key(src: &SocketAddr, dst: &SocketAddr) -> String {
    format!("{}->{}", src, dst)
}

/// Tunnel backend for one configured remote.
pub struct ProxyBackend {
    remote: SocketAddr,
    cipher: Cipher,
    tcp_timeout: Duration,
    udp_timeout: Duration,
    udp_nat: UdpNatMap,
    dns_nat: RwLock<HashMap<String, Arc<CipherPacket>>>,
    mux: Option<MuxTransport>,
    stopped: AtomicBool,
}

impl ProxyBackend {
    pub fn new(config: &ServerConfig, tcp_timeout: Duration, udp_timeout: Duration) -> Result<Self> {
        let remote: SocketAddr = config
            .address
            .parse()
            .map_err(|_| Error::Config(format!("invalid remote address: {}", config.address)))?;
        let cipher = Cipher::new(&config.cipher, &config.password)?;

        let mux = if config.mux.enabled {
            Some(MuxTransport::new(remote, &config.mux)?)
        } else {
            None
        };

        Ok(Self {
            remote,
            cipher,
            tcp_timeout,
            udp_timeout,
            udp_nat: Arc::new(RwLock::new(HashMap::new())),
            dns_nat: RwLock::new(HashMap::new()),
            mux,
            stopped: AtomicBool::new(false),
        })
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    /// Relay one redirected TCP connection through the tunnel.
    ///
    /// The original destination is whatever the redirecting firewall left as
    /// the accepted socket's local address. Returns bytes copied
    /// (remote→client, client→remote).
    pub async fn relay_tcp(&self, client: TcpStream) -> Result<(u64, u64)> {
        let orig_dst = client.local_addr()?;
        let header = Address::socket(orig_dst).to_wire();

        // Mux first when enabled; any mux failure falls back to the plain
        // tunnel without surfacing to the client.
        if let Some(mux) = &self.mux {
            match mux.get_stream().await {
                Ok(mut stream) => {
                    stream
                        .write_all(&header)
                        .await
                        .map_err(|e| Error::WriteRemote(e.to_string()))?;
                    debug!("relaying {} -> {} over mux", orig_dst, self.remote);
                    let (inbound, outbound, res) = copy_bidirectional(
                        Box::new(client),
                        Box::new(stream),
                        self.tcp_timeout,
                    )
                    .await;
                    return res.map(|_| (inbound, outbound));
                }
                Err(e) => debug!("mux unavailable ({}), using plain tunnel", e),
            }
        }

        let remote = TcpStream::connect(self.remote)
            .await
            .map_err(|e| Error::DialRemote(e.to_string()))?;
        set_keepalive(&remote)?;
        let mut tunnel = self.cipher.wrap_stream(Box::new(remote));
        tunnel
            .write_all(&header)
            .await
            .map_err(|e| Error::WriteRemote(e.to_string()))?;

        debug!("relaying {} -> {}", orig_dst, self.remote);
        let (inbound, outbound, res) =
            copy_bidirectional(Box::new(client), tunnel, self.tcp_timeout).await;
        res.map(|_| (inbound, outbound))
    }

    /// Relay one redirected datagram; reuses or creates the flow's NAT
    /// entry and prepends the destination header.
    pub async fn relay_udp(
        &self,
        src: SocketAddr,
        dst: SocketAddr,
        pool: &LeakyPool,
        data: &[u8],
    ) -> Result<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(Error::ListenClosed);
        }

        let key = nat_key(&src, &dst);
        let entry = { self.udp_nat.read().get(&key).cloned() };
        let entry = match entry {
            Some(entry) => entry,
            None => self.create_udp_entry(key, src, dst).await?,
        };

        // Every outbound send buys the reader another udp_timeout.
        *entry.deadline.lock() = Instant::now() + self.udp_timeout;

        let header_len = entry.header.len();
        let total = header_len + data.len();
        if total <= pool.buf_size() {
            let mut buf = pool.get();
            buf[..header_len].copy_from_slice(&entry.header);
            buf[header_len..total].copy_from_slice(data);
            let res = entry.tunnel_sock.send_to(&buf[..total], self.remote).await;
            pool.put(buf);
            res?;
        } else {
            // Too big for the pool's element size: one-shot allocation.
            let mut buf = Vec::with_capacity(total);
            buf.extend_from_slice(&entry.header);
            buf.extend_from_slice(data);
            entry.tunnel_sock.send_to(&buf, self.remote).await?;
        }
        Ok(())
    }

    async fn create_udp_entry(
        &self,
        key: String,
        src: SocketAddr,
        dst: SocketAddr,
    ) -> Result<Arc<UdpNatEntry>> {
        let bind: SocketAddr = if self.remote.is_ipv6() {
            "[::]:0".parse().expect("literal addr")
        } else {
            "0.0.0.0:0".parse().expect("literal addr")
        };
        let tunnel = UdpSocket::bind(bind)
            .await
            .map_err(|e| Error::DialRemote(e.to_string()))?;
        let tunnel_sock = Arc::new(self.cipher.wrap_packet(tunnel));
        let reply_sock = Arc::new(dial_spoofed_udp(dst)?);

        let entry = Arc::new(UdpNatEntry {
            reply_sock,
            tunnel_sock,
            header: Address::socket(dst).to_wire(),
            deadline: Mutex::new(Instant::now() + self.udp_timeout),
            closed: AtomicBool::new(false),
            shutdown: Notify::new(),
            reader: Mutex::new(None),
        });

        {
            let mut nat = self.udp_nat.write();
            if self.stopped.load(Ordering::SeqCst) {
                return Err(Error::ListenClosed);
            }
            // Another datagram of the same flow may have won the race.
            if let Some(existing) = nat.get(&key) {
                return Ok(existing.clone());
            }
            nat.insert(key.clone(), entry.clone());
        }

        let reader = tokio::spawn(copy_from_remote(
            self.udp_nat.clone(),
            key.clone(),
            entry.clone(),
            src,
        ));
        entry.reader.lock().replace(reader);
        debug!("udp nat entry created: {}", key);
        Ok(entry)
    }

    /// Exchange one DNS query through the tunnel.
    ///
    /// `client` identifies the querying client; its in-flight tunnel socket
    /// lives in the DNS NAT map for the duration of the exchange and is
    /// removed no matter how the exchange ends.
    pub async fn exchange_dns(
        &self,
        client: &str,
        resolver: &str,
        query: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>> {
        let header = encode_host_port(resolver)?;

        let sock = { self.dns_nat.read().get(client).cloned() };
        let sock = match sock {
            Some(sock) => sock,
            None => {
                let bind: SocketAddr = if self.remote.is_ipv6() {
                    "[::]:0".parse().expect("literal addr")
                } else {
                    "0.0.0.0:0".parse().expect("literal addr")
                };
                let socket = UdpSocket::bind(bind)
                    .await
                    .map_err(|e| Error::DialRemote(e.to_string()))?;
                let sock = Arc::new(self.cipher.wrap_packet(socket));
                self.dns_nat.write().insert(client.to_string(), sock.clone());
                sock
            }
        };

        let result = self.dns_exchange_inner(&sock, &header, query, timeout).await;
        // Guaranteed cleanup: the entry goes, the socket drops with it.
        self.dns_nat.write().remove(client);
        result
    }

    async fn dns_exchange_inner(
        &self,
        sock: &CipherPacket,
        header: &[u8],
        query: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>> {
        let mut packet = Vec::with_capacity(header.len() + query.len());
        packet.extend_from_slice(header);
        packet.extend_from_slice(query);
        sock.send_to(&packet, self.remote).await?;

        let mut buf = vec![0u8; UDP_BUFFER_SIZE];
        let (n, _) = tokio::time::timeout(timeout, sock.recv_from(&mut buf))
            .await
            .map_err(|_| Error::ReadRemote("dns exchange timed out".into()))??;
        if n <= header.len() {
            return Err(Error::ShortDatagram);
        }
        Ok(buf[header.len()..n].to_vec())
    }

    /// Close every NAT entry and the mux pool. Idempotent; no new entries
    /// can be created afterwards.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        let entries: Vec<(String, Arc<UdpNatEntry>)> =
            { self.udp_nat.write().drain().collect() };
        for (_, entry) in &entries {
            entry.close();
        }
        for (key, entry) in entries {
            let reader = entry.reader.lock().take();
            if let Some(reader) = reader {
                let _ = reader.await;
            }
            debug!("udp nat entry closed: {}", key);
        }

        self.dns_nat.write().clear();

        if let Some(mux) = &self.mux {
            mux.stop();
        }
        info!("proxy backend {} stopped", self.remote);
    }

    #[cfg(test)]
    pub(crate) fn udp_nat_len(&self) -> usize {
        self.udp_nat.read().len()
    }

    #[cfg(test)]
    pub(crate) fn udp_nat_contains(&self, src: &SocketAddr, dst: &SocketAddr) -> bool {
        self.udp_nat.read().contains_key(&nat_key(src, dst))
    }
}

/// Per-entry reader: copy tunnel replies back to the client until the read
/// deadline passes, an error occurs, or shutdown closes the flow. Removes
/// the entry on the way out.
async fn copy_from_remote(
    nat: UdpNatMap,
    key: String,
    entry: Arc<UdpNatEntry>,
    client: SocketAddr,
) {
    let mut buf = vec![0u8; UDP_BUFFER_SIZE];
    let header_len = entry.header.len();

    loop {
        if entry.closed.load(Ordering::SeqCst) {
            break;
        }
        let deadline = *entry.deadline.lock();
        let read = tokio::select! {
            biased;
            _ = entry.shutdown.notified() => break,
            r = tokio::time::timeout_at(deadline.into(), entry.tunnel_sock.recv_from(&mut buf)) => r,
        };

        match read {
            Err(_) => {
                // A send may have pushed the deadline while we waited.
                if Instant::now() < *entry.deadline.lock() {
                    continue;
                }
                debug!("udp nat entry idle, closing: {}", key);
                break;
            }
            Ok(Ok((n, _))) => {
                if n <= header_len {
                    warn!("udp reply shorter than header on {}", key);
                    break;
                }
                if let Err(e) = entry.reply_sock.send_to(&buf[header_len..n], client).await {
                    debug!("udp reply to {} failed: {}", client, e);
                    break;
                }
            }
            Ok(Err(e)) => {
                debug!("udp tunnel read on {} failed: {}", key, e);
                break;
            }
        }
    }

    nat.write().remove(&key);
}
