//! The node supervisor.
//!
//! [`Node`] owns the peer table, the dial and connection tasks, and the
//! listener. Every connection runs in its own task inside a [`JoinSet`];
//! shutdown is broadcast over a `watch` channel so active sessions close
//! their sockets before the tasks are aborted.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::Interval;
use tracing::{debug, info, warn};

use crate::bootstrap::{Bootstrap, DnsResolver, Resolver};
use crate::config::{NodeConfig, PeersConfig};
use crate::error::{ConfigError, HandshakeError, NodeError, TransportError};
use crate::peers::{ConnectionHandle, PeerEntry, PeerTable};
use crate::session::{HandshakeConfig, HandshakeState, NonceRegistry, Role, Session};
use crate::transport::{Connection, Dialer, TcpDialer};
use crate::wire::Message;
use crate::wire::constants::{MAX_ADDR_ENTRIES, STREAM_ONE};
use crate::wire::message::{NetAddr, NetworkAddress, Services};

/// How long active sessions get to close after shutdown is signalled.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// How a single connection attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The peer is connected or was contacted within the cool-down;
    /// nothing was done.
    Skipped,
    /// The transport could not be opened.
    Failed,
    /// The handshake failed or the active connection broke.
    Dropped,
    /// The connection was closed by shutdown.
    Closed,
}

type Learned = (u32, SocketAddr);

/// State shared between the supervisor and its connection tasks.
struct Shared<D> {
    peers: Arc<PeerTable>,
    nonces: Arc<NonceRegistry>,
    handshake: Arc<HandshakeConfig>,
    settings: PeersConfig,
    dialer: D,
    next_id: AtomicU64,
    learned: mpsc::UnboundedSender<Learned>,
    shutdown: watch::Receiver<bool>,
}

pub struct Node<D: Dialer, R: Resolver> {
    shared: Arc<Shared<D>>,
    bootstrap: Arc<Bootstrap<R>>,
    tasks: JoinSet<()>,
    learned: mpsc::UnboundedReceiver<Learned>,
    shutdown: watch::Sender<bool>,
}

impl Node<TcpDialer, DnsResolver> {
    /// A node that dials over TCP and resolves seeds through the system
    /// resolver.
    pub fn from_config(config: &NodeConfig) -> Result<Self, ConfigError> {
        let dialer = TcpDialer::new(config.peers.connect_timeout());
        Self::new(config, dialer, DnsResolver)
    }
}

impl<D: Dialer, R: Resolver> Node<D, R> {
    pub fn new(config: &NodeConfig, dialer: D, resolver: R) -> Result<Self, ConfigError> {
        config.validate()?;

        let bootstrap = Bootstrap::from_config(&config.network, resolver)?;
        let (learned_tx, learned_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let shared = Shared {
            peers: Arc::new(PeerTable::new()),
            nonces: Arc::new(NonceRegistry::new()),
            handshake: Arc::new(config.handshake()),
            settings: config.peers.clone(),
            dialer,
            next_id: AtomicU64::new(1),
            learned: learned_tx,
            shutdown: shutdown_rx,
        };

        Ok(Self {
            shared: Arc::new(shared),
            bootstrap: Arc::new(bootstrap),
            tasks: JoinSet::new(),
            learned: learned_rx,
            shutdown: shutdown_tx,
        })
    }

    pub fn peers(&self) -> &Arc<PeerTable> {
        &self.shared.peers
    }

    /// Resolves the bootstrap sources and starts an attempt to each on
    /// stream 1. Returns how many attempts were started.
    pub async fn bootstrap(&mut self) -> Result<usize, NodeError> {
        let candidates = self.bootstrap.candidates().await?;
        for addr in &candidates {
            self.connect(STREAM_ONE, *addr);
        }
        Ok(candidates.len())
    }

    /// Starts a connection attempt in the background.
    pub fn connect(&mut self, stream: u32, addr: SocketAddr) {
        let shared = Arc::clone(&self.shared);
        self.tasks.spawn(async move {
            let outcome = shared.attempt(stream, addr).await;
            debug!(peer = %addr, ?outcome, "attempt finished");
        });
    }

    /// Runs one connection attempt to completion.
    pub async fn attempt(&self, stream: u32, addr: SocketAddr) -> Outcome {
        self.shared.attempt(stream, addr).await
    }

    /// Serves a connection the peer opened.
    pub fn accept<C: Connection + 'static>(&mut self, conn: C) {
        let shared = Arc::clone(&self.shared);
        self.tasks.spawn(async move {
            let outcome = shared.serve(conn).await;
            debug!(?outcome, "inbound connection finished");
        });
    }

    /// Waits for every running task to finish.
    pub async fn wait(&mut self) {
        while let Some(joined) = self.tasks.join_next().await {
            log_join(joined);
        }
    }

    /// Runs the supervisor until `shutdown` resolves.
    ///
    /// Addresses learned from peers are dialed, inbound connections on
    /// `listener` are served, stale peers are pruned, and the bootstrap
    /// sources are consulted again periodically.
    pub async fn run<F>(
        mut self,
        listener: Option<TcpListener>,
        shutdown: F,
    ) -> Result<(), NodeError>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        let mut prune = tokio::time::interval(self.shared.settings.prune_interval());
        let mut rebootstrap = self
            .shared
            .settings
            .rebootstrap_interval()
            .map(|every| tokio::time::interval_at(tokio::time::Instant::now() + every, every));

        if let Some(listener) = &listener {
            info!(addr = %listener.local_addr()?, "listening");
        }

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                Some((stream, addr)) = self.learned.recv() => self.connect(stream, addr),
                accepted = accept(listener.as_ref()) => match accepted {
                    Ok((conn, remote)) => {
                        debug!(peer = %remote, "inbound connection");
                        if let Err(err) = conn.set_nodelay(true) {
                            debug!(peer = %remote, error = %err, "set_nodelay");
                        }
                        self.accept(conn);
                    }
                    Err(err) => warn!(error = %err, "accept failed"),
                },
                _ = prune.tick() => {
                    self.shared.peers.prune(unix_time(), self.shared.settings.forget_after());
                }
                _ = tick(rebootstrap.as_mut()) => self.spawn_rebootstrap(),
                Some(joined) = self.tasks.join_next() => log_join(joined),
            }
        }

        self.shutdown().await;
        Ok(())
    }

    /// Signals every session to close, waits a grace period, then aborts
    /// what is left.
    pub async fn shutdown(&mut self) {
        info!(tasks = self.tasks.len(), "shutting down");
        // receivers live in the tasks; none left is fine
        let _ = self.shutdown.send(true);

        let drained = tokio::time::timeout(SHUTDOWN_GRACE, self.wait()).await;
        if drained.is_err() {
            self.tasks.abort_all();
            while self.tasks.join_next().await.is_some() {}
        }
    }

    fn spawn_rebootstrap(&mut self) {
        let bootstrap = Arc::clone(&self.bootstrap);
        let learned = self.shared.learned.clone();

        self.tasks.spawn(async move {
            match bootstrap.candidates().await {
                Ok(candidates) => {
                    for addr in candidates {
                        let _ = learned.send((STREAM_ONE, addr));
                    }
                }
                Err(err) => warn!(error = %err, "re-bootstrap found no peers"),
            }
        });
    }
}

impl<D: Dialer> Shared<D> {
    async fn attempt(&self, stream: u32, addr: SocketAddr) -> Outcome {
        if !self
            .peers
            .begin_contact(stream, &addr, self.settings.retry_cooldown())
        {
            debug!(peer = %addr, stage = ?HandshakeState::Idle, "contacted recently, skipping");
            return Outcome::Skipped;
        }

        debug!(peer = %addr, stage = ?HandshakeState::Dialing, "dialing");
        let conn = match self.dialer.dial(addr).await {
            Ok(conn) => conn,
            Err(source) => {
                let err = TransportError::Dial { addr, source };
                warn!(peer = %addr, stage = ?HandshakeState::Dialing, error = %err, "dial failed");
                return Outcome::Failed;
            }
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let handle = ConnectionHandle { id, remote: addr };

        // provisional until the peer announces its streams
        self.peers.add_or_refresh(
            stream,
            addr,
            PeerEntry::new(advertised(addr, stream)).with_connection(handle),
        );

        let outcome = match Session::new(
            conn,
            Role::Outbound,
            Arc::clone(&self.handshake),
            Arc::clone(&self.nonces),
        ) {
            Ok(mut session) => self.outbound(&mut session, stream).await,
            Err(err) => {
                warn!(peer = %addr, error = %err, "connection unusable");
                Outcome::Dropped
            }
        };

        self.peers.detach(id);
        outcome
    }

    async fn outbound<C: Connection>(&self, session: &mut Session<C>, provisional: u32) -> Outcome {
        let key = session.remote();

        if session
            .handshake_within(self.settings.handshake_timeout())
            .await
            .is_err()
        {
            return Outcome::Dropped;
        }

        self.peers.reassign(&key, provisional, session.common_streams());
        self.active(session, key).await
    }

    async fn serve<C: Connection>(&self, conn: C) -> Outcome {
        let mut session = match Session::new(
            conn,
            Role::Inbound,
            Arc::clone(&self.handshake),
            Arc::clone(&self.nonces),
        ) {
            Ok(session) => session,
            Err(err) => {
                warn!(error = %err, "inbound connection unusable");
                return Outcome::Dropped;
            }
        };

        if session
            .handshake_within(self.settings.handshake_timeout())
            .await
            .is_err()
        {
            return Outcome::Dropped;
        }

        let remote = session.remote();
        let key = session.peer_listen_addr().unwrap_or(remote);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let handle = ConnectionHandle { id, remote };

        for &stream in session.common_streams() {
            self.peers.add_or_refresh(
                stream,
                key,
                PeerEntry::new(advertised(key, stream)).with_connection(handle),
            );
        }

        let outcome = self.active(&mut session, key).await;
        self.peers.detach(id);
        outcome
    }

    /// Post-handshake loop: advertise what we know, learn what the peer
    /// knows, until the connection breaks or shutdown is signalled.
    async fn active<C: Connection>(&self, session: &mut Session<C>, key: SocketAddr) -> Outcome {
        let mut shutdown = self.shutdown.clone();
        let closing = *shutdown.borrow_and_update();
        if closing {
            session.close().await;
            return Outcome::Closed;
        }

        let known = self.advertisement(session.common_streams(), &key);
        if !known.is_empty() {
            debug!(peer = %key, count = known.len(), "advertising addresses");
            if let Err(err) = session.send(&Message::Addr(known)).await {
                warn!(peer = %key, stage = ?session.state(), error = %err, "connection dropped");
                return Outcome::Dropped;
            }
        }

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    session.close().await;
                    return Outcome::Closed;
                }
                received = session.recv() => match received {
                    Ok(Message::Addr(addresses)) => self.learn(addresses, session.common_streams()),
                    Ok(other) => debug!(peer = %key, command = %other.command(), "ignored"),
                    Err(HandshakeError::Io(err)) if err.kind() == io::ErrorKind::UnexpectedEof => {
                        info!(peer = %key, "peer closed the connection");
                        return Outcome::Dropped;
                    }
                    Err(err) => {
                        warn!(
                            peer = %key,
                            stage = ?session.state(),
                            error = %err,
                            "connection dropped"
                        );
                        return Outcome::Dropped;
                    }
                },
            }
        }
    }

    fn advertisement(&self, streams: &[u32], exclude: &SocketAddr) -> Vec<NetworkAddress> {
        streams
            .iter()
            .flat_map(|&stream| self.peers.snapshot(stream))
            .filter(|a| a.socket_addr() != *exclude && a.time > 0)
            .take(MAX_ADDR_ENTRIES)
            .collect()
    }

    fn learn(&self, addresses: Vec<NetworkAddress>, streams: &[u32]) {
        let mut new = 0usize;

        for address in addresses {
            if !streams.contains(&address.stream) {
                continue;
            }
            let addr = address.socket_addr();
            if addr.port() == 0 || addr.ip().is_unspecified() {
                continue;
            }

            if self.peers.learn(address.stream, address) {
                new += 1;
                // the receiver lives as long as the supervisor
                let _ = self.learned.send((address.stream, addr));
            }
        }

        if new > 0 {
            debug!(new, "learned addresses");
        }
    }
}

/// The table entry for a peer we just reached.
fn advertised(addr: SocketAddr, stream: u32) -> NetworkAddress {
    NetworkAddress {
        time: unix_time() as u32,
        stream,
        addr: NetAddr::from_socket_addr(Services::NODE_NETWORK, addr),
    }
}

fn unix_time() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

async fn accept(listener: Option<&TcpListener>) -> io::Result<(TcpStream, SocketAddr)> {
    match listener {
        Some(listener) => listener.accept().await,
        None => std::future::pending().await,
    }
}

async fn tick(interval: Option<&mut Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

fn log_join(joined: Result<(), tokio::task::JoinError>) {
    if let Err(err) = joined {
        if err.is_panic() {
            warn!(error = %err, "connection task panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootstrap::StaticResolver;
    use crate::transport::MemoryConnection;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    const LOCAL: &str = "10.0.0.1:40000";

    fn config() -> NodeConfig {
        let mut config = NodeConfig::default();
        config.network.dns_seeds.clear();
        config
    }

    /// Counts dials and refuses every one of them.
    struct CountingDialer {
        dials: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Dialer for CountingDialer {
        type Conn = MemoryConnection;

        async fn dial(&self, _addr: SocketAddr) -> io::Result<MemoryConnection> {
            self.dials.fetch_add(1, Ordering::SeqCst);
            Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"))
        }
    }

    /// Connects to a scripted peer that completes the handshake and then
    /// advertises `advert`.
    struct ResponderDialer {
        advert: Vec<NetworkAddress>,
        dials: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Dialer for ResponderDialer {
        type Conn = MemoryConnection;

        async fn dial(&self, addr: SocketAddr) -> io::Result<MemoryConnection> {
            self.dials.fetch_add(1, Ordering::SeqCst);
            let (ours, theirs) = MemoryConnection::pair(LOCAL.parse().unwrap(), addr, 64 * 1024);
            let advert = self.advert.clone();

            tokio::spawn(async move {
                let mut peer = Session::new(
                    theirs,
                    Role::Inbound,
                    Arc::new(HandshakeConfig::default()),
                    Arc::new(NonceRegistry::new()),
                )
                .unwrap();
                peer.handshake().await.unwrap();
                peer.send(&Message::Addr(advert)).await.unwrap();
                while peer.recv().await.is_ok() {}
            });

            Ok(ours)
        }
    }

    fn network_address(addr: &str) -> NetworkAddress {
        NetworkAddress {
            time: unix_time() as u32,
            stream: 1,
            addr: NetAddr::from_socket_addr(Services::NODE_NETWORK, addr.parse().unwrap()),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cooldown_suppresses_redial() {
        let dials = Arc::new(AtomicUsize::new(0));
        let dialer = CountingDialer {
            dials: Arc::clone(&dials),
        };
        let node = Node::new(&config(), dialer, StaticResolver::new()).unwrap();
        let addr: SocketAddr = "192.0.2.7:8444".parse().unwrap();

        node.peers().add_or_refresh(1, addr, PeerEntry::new(advertised(addr, 1)));

        assert_eq!(node.attempt(1, addr).await, Outcome::Skipped);
        assert_eq!(dials.load(Ordering::SeqCst), 0);

        tokio::time::advance(Duration::from_secs(299)).await;
        assert_eq!(node.attempt(1, addr).await, Outcome::Skipped);
        assert_eq!(dials.load(Ordering::SeqCst), 0);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(node.attempt(1, addr).await, Outcome::Failed);
        assert_eq!(dials.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_dial_of_unknown_peer_leaves_table_empty() {
        let dialer = CountingDialer {
            dials: Arc::new(AtomicUsize::new(0)),
        };
        let node = Node::new(&config(), dialer, StaticResolver::new()).unwrap();

        assert_eq!(
            node.attempt(1, "192.0.2.7:8444".parse().unwrap()).await,
            Outcome::Failed
        );
        assert!(node.peers().is_empty());
    }

    #[tokio::test]
    async fn active_peer_is_recorded_and_its_addresses_learned() {
        let learned = "198.51.100.9:8444";
        let dialer = ResponderDialer {
            advert: vec![network_address(learned)],
            dials: Arc::new(AtomicUsize::new(0)),
        };
        let mut node = Node::new(&config(), dialer, StaticResolver::new()).unwrap();
        let peer: SocketAddr = "192.0.2.7:8444".parse().unwrap();

        node.connect(1, peer);

        let learned: SocketAddr = learned.parse().unwrap();
        let peers = Arc::clone(node.peers());
        tokio::time::timeout(Duration::from_secs(5), async {
            while peers.get(1, &learned).is_none() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("address not learned");

        let entry = peers.get(1, &peer).unwrap();
        assert!(entry.connection.is_some());
        assert!(entry.last_contacted.is_some());
        assert_eq!(peers.get(1, &learned).unwrap().last_contacted, None);

        // the learned address was queued for dialing
        assert_eq!(node.learned.recv().await, Some((1, learned)));

        node.shutdown().await;
        assert_eq!(peers.get(1, &peer).unwrap().connection, None);
    }

    #[tokio::test]
    async fn connected_peer_is_not_dialed_again() {
        let dials = Arc::new(AtomicUsize::new(0));
        let dialer = ResponderDialer {
            advert: vec![],
            dials: Arc::clone(&dials),
        };
        let mut config = config();
        // only the live connection may hold back the second attempt
        config.peers.retry_cooldown_secs = 0;
        let mut node = Node::new(&config, dialer, StaticResolver::new()).unwrap();
        let peer: SocketAddr = "192.0.2.7:8444".parse().unwrap();

        node.connect(1, peer);

        let peers = Arc::clone(node.peers());
        tokio::time::timeout(Duration::from_secs(5), async {
            while !peers.get(1, &peer).is_some_and(|e| e.connection.is_some()) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("peer never connected");
        let first = peers.get(1, &peer).unwrap().connection;

        // what a re-bootstrap tick does for every candidate
        assert_eq!(node.attempt(1, peer).await, Outcome::Skipped);
        assert_eq!(dials.load(Ordering::SeqCst), 1);
        assert_eq!(peers.get(1, &peer).unwrap().connection, first);

        node.shutdown().await;
        assert_eq!(peers.get(1, &peer).unwrap().connection, None);
    }

    #[tokio::test]
    async fn self_connection_is_dropped() {
        struct LoopbackDialer {
            node_side: Arc<tokio::sync::Mutex<Option<MemoryConnection>>>,
        }

        #[async_trait]
        impl Dialer for LoopbackDialer {
            type Conn = MemoryConnection;

            async fn dial(&self, addr: SocketAddr) -> io::Result<MemoryConnection> {
                let (ours, theirs) =
                    MemoryConnection::pair(LOCAL.parse().unwrap(), addr, 64 * 1024);
                *self.node_side.lock().await = Some(theirs);
                Ok(ours)
            }
        }

        let node_side = Arc::new(tokio::sync::Mutex::new(None));
        let dialer = LoopbackDialer {
            node_side: Arc::clone(&node_side),
        };
        let mut node = Node::new(&config(), dialer, StaticResolver::new()).unwrap();
        let addr: SocketAddr = "192.0.2.7:8444".parse().unwrap();

        node.connect(1, addr);

        // hand the far end back to the same node, as if it had dialed itself
        let theirs = loop {
            if let Some(conn) = node_side.lock().await.take() {
                break conn;
            }
            tokio::task::yield_now().await;
        };
        node.accept(theirs);
        node.wait().await;

        let entry = node.peers().get(1, &addr).unwrap();
        assert_eq!(entry.connection, None);
        assert_eq!(node.peers().streams(), vec![1]);
        assert_eq!(node.peers().len(1), 1);
    }
}
