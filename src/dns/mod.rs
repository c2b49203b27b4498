//! Split-horizon DNS server
//!
//! Each query is classified against the policy list. Names outside the list
//! go to a local recursive resolver over plain UDP; proxied names are
//! exchanged through the tunnel so the answer an eavesdropping middlebox
//! could poison never transits in the clear. Answers observed on the
//! tunneled path are harvested: A records feed the routing table, CNAME
//! targets extend the policy list, and the decoded response lands in a
//! TTL cache with half-TTL early refresh.

mod cache;

pub use cache::DnsCache;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hickory_proto::op::Message;
use hickory_proto::rr::{DNSClass, RData};
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{normalize_resolver, DnsConfig};
use crate::error::Result;
use crate::policy::{PolicyList, RoutingTable};

/// Largest DNS-over-UDP message we accept.
const MAX_DNS_PACKET: usize = 4096;

/// The tunnel-side DNS exchange, implemented by the proxy client facade.
#[async_trait]
pub trait DnsExchanger: Send + Sync {
    async fn exchange_dns(
        &self,
        client: &str,
        resolver: &str,
        query: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>>;
}

struct ResolverSet {
    local: Vec<String>,
    remote: Vec<String>,
}

/// UDP DNS server with policy-driven upstream selection.
pub struct DnsServer {
    socket: Arc<UdpSocket>,
    policy: Arc<PolicyList>,
    routing: Arc<RoutingTable>,
    exchanger: Arc<dyn DnsExchanger>,
    resolvers: RwLock<ResolverSet>,
    cache: Mutex<Option<DnsCache>>,
    send_num: AtomicU32,
    timeout: Duration,
    shutdown_tx: broadcast::Sender<()>,
    serve_task: Mutex<Option<JoinHandle<()>>>,
}

impl DnsServer {
    /// Bind the listen socket and start serving.
    pub async fn start(
        config: &DnsConfig,
        policy: Arc<PolicyList>,
        routing: Arc<RoutingTable>,
        exchanger: Arc<dyn DnsExchanger>,
    ) -> Result<Arc<Self>> {
        let socket = Arc::new(UdpSocket::bind(config.listen).await?);
        info!("DNS server listening on {}", socket.local_addr()?);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let server = Arc::new(Self {
            socket,
            policy,
            routing,
            exchanger,
            resolvers: RwLock::new(ResolverSet {
                local: config.local_resolvers.iter().map(|a| normalize_resolver(a)).collect(),
                remote: config.proxy_resolvers.iter().map(|a| normalize_resolver(a)).collect(),
            }),
            cache: Mutex::new(config.cache.then(DnsCache::new)),
            send_num: AtomicU32::new(config.send_num.max(1)),
            timeout: Duration::from_secs(config.timeout_secs),
            shutdown_tx,
            serve_task: Mutex::new(None),
        });
        if config.cache {
            info!("DNS cache enabled");
        }

        let serve = tokio::spawn(server.clone().serve(shutdown_rx));
        server.serve_task.lock().replace(serve);
        Ok(server)
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    async fn serve(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut buf = vec![0u8; MAX_DNS_PACKET];
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                res = self.socket.recv_from(&mut buf) => match res {
                    Ok((n, peer)) => {
                        let query = buf[..n].to_vec();
                        let server = self.clone();
                        tokio::spawn(async move {
                            server.handle_query(query, peer).await;
                        });
                    }
                    // ICMP errors surface on unconnected UDP sockets; they
                    // concern one peer, not the server.
                    Err(e) => error!("DNS recv failed: {}", e),
                },
            }
        }
        debug!("DNS serve loop exited");
    }

    /// Swap resolver lists, toggle the cache, and update the send count.
    /// Disabling the cache drops its contents.
    pub fn reload(&self, config: &DnsConfig) {
        {
            let mut resolvers = self.resolvers.write();
            resolvers.local = config
                .local_resolvers
                .iter()
                .map(|a| normalize_resolver(a))
                .collect();
            resolvers.remote = config
                .proxy_resolvers
                .iter()
                .map(|a| normalize_resolver(a))
                .collect();
        }

        {
            let mut cache = self.cache.lock();
            match (config.cache, cache.is_some()) {
                (true, false) => {
                    info!("DNS cache enabled");
                    *cache = Some(DnsCache::new());
                }
                (false, true) => {
                    info!("DNS cache disabled");
                    *cache = None;
                }
                _ => {}
            }
        }

        self.send_num.store(config.send_num.max(1), Ordering::Relaxed);
        info!("DNS config reloaded");
    }

    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(());
        let task = self.serve_task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        info!("DNS server stopped");
    }

    /// Reserved hook for ad-block filters and custom records.
    fn apply_filter_chain(&self, _query: &Message) -> Option<Message> {
        None
    }

    fn pick_resolver(&self, remote: bool) -> Option<String> {
        let resolvers = self.resolvers.read();
        let list = if remote { &resolvers.remote } else { &resolvers.local };
        match list.len() {
            0 => None,
            1 => Some(list[0].clone()),
            n => Some(list[rand::thread_rng().gen_range(0..n)].clone()),
        }
    }

    /// First question name under a proxied domain, trailing dot stripped.
    fn proxied_question(&self, msg: &Message) -> Option<String> {
        for query in msg.queries() {
            let name = query.name().to_utf8();
            let name = name.trim_end_matches('.');
            if self.policy.check_domain(name) {
                return Some(name.to_string());
            }
        }
        None
    }

    fn check_cache(&self, msg: &Message) -> Option<(Message, bool)> {
        let mut cache = self.cache.lock();
        let cache = cache.as_mut()?;
        for query in msg.queries() {
            if query.query_class() != DNSClass::IN {
                continue;
            }
            let name = query.name().to_utf8();
            if let Some(hit) = cache.lookup(name.trim_end_matches('.')) {
                debug!("DNS cache hit for {}", name);
                return Some(hit);
            }
        }
        None
    }

    async fn handle_query(self: Arc<Self>, data: Vec<u8>, peer: SocketAddr) {
        let msg = match Message::from_vec(&data) {
            Ok(msg) => msg,
            Err(e) => {
                debug!("dropping unparseable DNS query from {}: {}", peer, e);
                return;
            }
        };

        if let Some(filtered) = self.apply_filter_chain(&msg) {
            self.write_response(&filtered, peer).await;
            return;
        }

        match self.proxied_question(&msg) {
            Some(domain) => self.handle_proxied(&msg, &data, &domain, peer).await,
            None => self.handle_local(&data, peer).await,
        }
    }

    /// Proxied name: serve from cache when possible, otherwise (or when the
    /// cached answer is past its half-TTL) exchange through the tunnel and
    /// harvest the answer.
    async fn handle_proxied(&self, msg: &Message, raw: &[u8], domain: &str, peer: SocketAddr) {
        let mut replied_from_cache = false;
        if let Some((mut cached, needs_refresh)) = self.check_cache(msg) {
            cached.set_id(msg.id());
            self.write_response(&cached, peer).await;
            if !needs_refresh {
                return;
            }
            replied_from_cache = true;
        }

        let resolver = match self.pick_resolver(true) {
            Some(r) => r,
            None => {
                warn!("no proxy resolver configured");
                return;
            }
        };

        // send_num is reserved for parallel fan-out; one query is sent today.
        let response = match self
            .exchanger
            .exchange_dns(&peer.to_string(), &resolver, raw, self.timeout)
            .await
        {
            Ok(bytes) => bytes,
            Err(e) => {
                // No fabricated SERVFAIL; the client retries by protocol.
                debug!("tunnel DNS exchange for {} failed: {}", domain, e);
                return;
            }
        };

        let mut response = match Message::from_vec(&response) {
            Ok(m) => m,
            Err(e) => {
                error!("unpacking tunneled DNS response failed: {}", e);
                return;
            }
        };
        response.set_id(msg.id());

        let (cacheable, max_ttl) = self.harvest_answers(&response);
        if cacheable {
            let mut cache = self.cache.lock();
            if let Some(cache) = cache.as_mut() {
                cache.insert(domain.to_string(), response.clone(), max_ttl);
            }
        }

        if !replied_from_cache {
            self.write_response(&response, peer).await;
        }
    }

    /// Feed observed INET answers back into routing and policy; returns
    /// whether the response is cacheable and the largest answer TTL.
    fn harvest_answers(&self, response: &Message) -> (bool, u32) {
        let mut cacheable = false;
        let mut max_ttl = 0u32;
        for answer in response.answers() {
            if answer.dns_class() != DNSClass::IN {
                continue;
            }
            max_ttl = max_ttl.max(answer.ttl());
            match answer.data() {
                Some(RData::A(a)) => {
                    let name = answer.name().to_utf8();
                    let name = name.trim_end_matches('.');
                    self.routing.add_ip(name, a.0);
                    debug!("DNS answer {} -> {}", name, a.0);
                    cacheable = true;
                }
                Some(RData::CNAME(cname)) => {
                    let target = cname.0.to_utf8();
                    let target = target.trim_end_matches('.');
                    self.policy.add_domain(target);
                    debug!("DNS answer CNAME -> {}", target);
                }
                // AAAA answers are left out of the routing table on purpose;
                // the gateway's packet-filter sets are IPv4-only.
                Some(_) | None => {}
            }
        }
        (cacheable, max_ttl)
    }

    /// Not proxied: forward to a local resolver and relay the raw response.
    async fn handle_local(&self, raw: &[u8], peer: SocketAddr) {
        let resolver = match self.pick_resolver(false) {
            Some(r) => r,
            None => {
                warn!("no local resolver configured");
                return;
            }
        };
        match self.local_exchange(raw, &resolver).await {
            Ok(response) => {
                if let Err(e) = self.socket.send_to(&response, peer).await {
                    debug!("DNS reply to {} failed: {}", peer, e);
                }
            }
            Err(e) => debug!("local DNS exchange via {} failed: {}", resolver, e),
        }
    }

    async fn local_exchange(&self, raw: &[u8], resolver: &str) -> Result<Vec<u8>> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket
            .send_to(raw, resolver)
            .await
            .map_err(|e| crate::error::Error::DnsUpstream(e.to_string()))?;
        let mut buf = vec![0u8; MAX_DNS_PACKET];
        let (n, _) = tokio::time::timeout(self.timeout, socket.recv_from(&mut buf))
            .await
            .map_err(|_| crate::error::Error::Timeout)?
            .map_err(|e| crate::error::Error::DnsUpstream(e.to_string()))?;
        buf.truncate(n);
        Ok(buf)
    }

    async fn write_response(&self, response: &Message, peer: SocketAddr) {
        match response.to_vec() {
            Ok(bytes) => {
                if let Err(e) = self.socket.send_to(&bytes, peer).await {
                    debug!("DNS reply to {} failed: {}", peer, e);
                }
            }
            Err(e) => error!("packing DNS response failed: {}", e),
        }
    }

    #[cfg(test)]
    pub(crate) fn cache_len(&self) -> usize {
        self.cache.lock().as_ref().map(|c| c.len()).unwrap_or(0)
    }

    #[cfg(test)]
    pub(crate) fn send_num(&self) -> u32 {
        self.send_num.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::{MessageType, Query};
    use hickory_proto::rr::rdata::{A, CNAME};
    use hickory_proto::rr::{Name, Record, RecordType};
    use std::net::Ipv4Addr;
    use std::str::FromStr;
    use std::sync::atomic::AtomicUsize;

    fn dns_config(local: Vec<String>, listen: &str) -> DnsConfig {
        DnsConfig {
            listen: listen.parse().unwrap(),
            local_resolvers: local,
            proxy_resolvers: vec!["8.8.8.8".to_string()],
            cache: true,
            timeout_secs: 2,
            send_num: 1,
        }
    }

    fn query_for(name: &str, id: u16) -> Message {
        let mut msg = Message::new();
        msg.set_id(id);
        msg.add_query(Query::query(
            Name::from_str(&format!("{}.", name)).unwrap(),
            RecordType::A,
        ));
        msg
    }

    fn answer_for(name: &str, ip: Ipv4Addr, ttl: u32, id: u16) -> Message {
        let fqdn = Name::from_str(&format!("{}.", name)).unwrap();
        let mut msg = Message::new();
        msg.set_id(id);
        msg.set_message_type(MessageType::Response);
        msg.add_query(Query::query(fqdn.clone(), RecordType::A));
        msg.add_answer(Record::from_rdata(fqdn, ttl, RData::A(A(ip))));
        msg
    }

    /// Exchanger returning one canned response, counting calls.
    struct FakeExchanger {
        response: Vec<u8>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl DnsExchanger for FakeExchanger {
        async fn exchange_dns(
            &self,
            _client: &str,
            _resolver: &str,
            query: &[u8],
            _timeout: Duration,
        ) -> Result<Vec<u8>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            // Echo the caller's transaction id like a real resolver would.
            let id = Message::from_vec(query).unwrap().id();
            let mut msg = Message::from_vec(&self.response).unwrap();
            msg.set_id(id);
            Ok(msg.to_vec().unwrap())
        }
    }

    async fn ask(server_addr: SocketAddr, msg: &Message) -> Option<Message> {
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client
            .send_to(&msg.to_vec().unwrap(), server_addr)
            .await
            .unwrap();
        let mut buf = vec![0u8; MAX_DNS_PACKET];
        let res = tokio::time::timeout(Duration::from_secs(2), client.recv_from(&mut buf)).await;
        match res {
            Ok(Ok((n, _))) => Some(Message::from_vec(&buf[..n]).unwrap()),
            _ => None,
        }
    }

    #[tokio::test]
    async fn test_proxied_query_populates_routing_and_cache() {
        let ip = Ipv4Addr::new(93, 184, 216, 34);
        let exchanger = Arc::new(FakeExchanger {
            response: answer_for("example.com", ip, 300, 1).to_vec().unwrap(),
            calls: AtomicUsize::new(0),
        });
        let policy = Arc::new(PolicyList::new());
        policy.add_domain("example.com");
        let routing = Arc::new(RoutingTable::new());

        let server = DnsServer::start(
            &dns_config(vec![], "127.0.0.1:0"),
            policy,
            routing.clone(),
            exchanger.clone(),
        )
        .await
        .unwrap();
        let addr = server.local_addr().unwrap();

        let reply = ask(addr, &query_for("example.com", 7)).await.unwrap();
        assert_eq!(reply.id(), 7);
        assert_eq!(routing.ips("example.com"), vec![ip]);
        assert_eq!(server.cache_len(), 1);
        assert_eq!(exchanger.calls.load(Ordering::SeqCst), 1);

        // Second query inside the half-TTL window: cache hit, id rewritten,
        // no extra upstream traffic.
        let reply = ask(addr, &query_for("example.com", 9)).await.unwrap();
        assert_eq!(reply.id(), 9);
        assert_eq!(exchanger.calls.load(Ordering::SeqCst), 1);

        server.stop().await;
    }

    #[tokio::test]
    async fn test_cname_answers_extend_policy() {
        let fqdn = Name::from_str("www.example.com.").unwrap();
        let mut response = Message::new();
        response.set_id(1);
        response.set_message_type(MessageType::Response);
        response.add_query(Query::query(fqdn.clone(), RecordType::A));
        response.add_answer(Record::from_rdata(
            fqdn,
            60,
            RData::CNAME(CNAME(Name::from_str("cdn.example.net.").unwrap())),
        ));
        response.add_answer(Record::from_rdata(
            Name::from_str("cdn.example.net.").unwrap(),
            60,
            RData::A(A(Ipv4Addr::new(203, 0, 113, 10))),
        ));

        let exchanger = Arc::new(FakeExchanger {
            response: response.to_vec().unwrap(),
            calls: AtomicUsize::new(0),
        });
        let policy = Arc::new(PolicyList::new());
        policy.add_domain("example.com");

        let server = DnsServer::start(
            &dns_config(vec![], "127.0.0.1:0"),
            policy.clone(),
            Arc::new(RoutingTable::new()),
            exchanger,
        )
        .await
        .unwrap();
        let addr = server.local_addr().unwrap();

        ask(addr, &query_for("www.example.com", 3)).await.unwrap();
        assert!(policy.check_domain("cdn.example.net"));

        server.stop().await;
    }

    #[tokio::test]
    async fn test_not_proxied_falls_back_to_local_resolver() {
        // Fake local resolver: answers every query with a fixed A record.
        let resolver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let resolver_addr = resolver.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DNS_PACKET];
            let (n, peer) = resolver.recv_from(&mut buf).await.unwrap();
            let query = Message::from_vec(&buf[..n]).unwrap();
            let reply = answer_for("intra.lan", Ipv4Addr::new(10, 0, 0, 42), 60, query.id());
            resolver
                .send_to(&reply.to_vec().unwrap(), peer)
                .await
                .unwrap();
        });

        let exchanger = Arc::new(FakeExchanger {
            response: answer_for("unused.example", Ipv4Addr::LOCALHOST, 1, 1)
                .to_vec()
                .unwrap(),
            calls: AtomicUsize::new(0),
        });
        let routing = Arc::new(RoutingTable::new());
        let server = DnsServer::start(
            &dns_config(vec![resolver_addr.to_string()], "127.0.0.1:0"),
            Arc::new(PolicyList::new()),
            routing.clone(),
            exchanger.clone(),
        )
        .await
        .unwrap();
        let addr = server.local_addr().unwrap();

        let reply = ask(addr, &query_for("intra.lan", 11)).await.unwrap();
        assert_eq!(reply.id(), 11);
        assert_eq!(reply.answers().len(), 1);
        // Local answers never touch the tunnel, routing, or cache.
        assert_eq!(exchanger.calls.load(Ordering::SeqCst), 0);
        assert!(routing.is_empty());
        assert_eq!(server.cache_len(), 0);

        server.stop().await;
    }

    #[tokio::test]
    async fn test_reload_is_idempotent_and_toggles_cache() {
        let exchanger = Arc::new(FakeExchanger {
            response: answer_for("example.com", Ipv4Addr::new(1, 2, 3, 4), 300, 1)
                .to_vec()
                .unwrap(),
            calls: AtomicUsize::new(0),
        });
        let policy = Arc::new(PolicyList::new());
        policy.add_domain("example.com");

        let config = dns_config(vec![], "127.0.0.1:0");
        let server = DnsServer::start(
            &config,
            policy,
            Arc::new(RoutingTable::new()),
            exchanger,
        )
        .await
        .unwrap();
        let addr = server.local_addr().unwrap();

        ask(addr, &query_for("example.com", 5)).await.unwrap();
        assert_eq!(server.cache_len(), 1);

        // Same config: cache contents and send_num survive.
        server.reload(&config);
        assert_eq!(server.cache_len(), 1);
        assert_eq!(server.send_num(), 1);

        // Disabling the cache drops it.
        let mut no_cache = config.clone();
        no_cache.cache = false;
        server.reload(&no_cache);
        assert_eq!(server.cache_len(), 0);

        server.stop().await;
    }
}
