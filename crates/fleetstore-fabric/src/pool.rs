//! Connection pool
//!
//! Keeps one [`Connection`] per peer, establishes links on first use and
//! hides transport selection, staleness and reconnection from callers.

use crate::connection::{ConnState, Connection};
use crate::error::{FabricError, FabricResult};
use crate::event::{FabricEvent, FabricEventKind};
use crate::protocol::{NodeRequest, NodeResponse};
use crate::transport::{DirectTransport, Link, NatTraversalTransport, PeerAddress, Transport, TransportKind};
use fleetstore_common::config::FabricConfig;
use fleetstore_common::types::NodeId;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const EVENT_CAPACITY: usize = 1024;

/// Channels to every peer the control plane talks to
pub struct Fabric {
    config: FabricConfig,
    transports: Vec<Arc<dyn Transport>>,
    peers: RwLock<HashMap<NodeId, PeerAddress>>,
    connections: RwLock<HashMap<NodeId, Arc<Connection>>>,
    events: broadcast::Sender<FabricEvent>,
}

impl Fabric {
    /// Build a fabric with the transports enabled by configuration:
    /// direct first, NAT traversal second
    #[must_use]
    pub fn new(config: FabricConfig) -> Self {
        let mut transports: Vec<Arc<dyn Transport>> = Vec::new();
        if config.use_direct {
            transports.push(Arc::new(DirectTransport::new(config.default_timeout())));
        }
        if config.use_nat_traversal && !config.rendezvous_address.is_empty() {
            transports.push(Arc::new(NatTraversalTransport::new(
                config.rendezvous_address.clone(),
                config.stun_servers.clone(),
                config.negotiation_policy(),
                config.default_timeout(),
            )));
        }
        Self::with_transports(config, transports)
    }

    /// Build a fabric over explicit transports, tried in order
    #[must_use]
    pub fn with_transports(config: FabricConfig, transports: Vec<Arc<dyn Transport>>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            config,
            transports,
            peers: RwLock::new(HashMap::new()),
            connections: RwLock::new(HashMap::new()),
            events,
        }
    }

    #[must_use]
    pub const fn config(&self) -> &FabricConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FabricEvent> {
        self.events.subscribe()
    }

    /// Record (or update) where a peer can be reached
    pub fn register_peer(&self, peer: PeerAddress) {
        let mut peers = self.peers.write();
        if let Some(existing) = peers.get(&peer.node)
            && existing.address != peer.address
        {
            info!(peer = %peer.node, from = %existing.address, to = %peer.address, "peer address changed");
            if let Some(conn) = self.connections.read().get(&peer.node) {
                conn.close();
            }
        }
        peers.insert(peer.node, peer);
    }

    /// Drop a peer and close its connection
    pub fn forget_peer(&self, peer: &NodeId) {
        self.peers.write().remove(peer);
        if let Some(conn) = self.connections.write().remove(peer) {
            conn.close();
        }
    }

    #[must_use]
    pub fn peers(&self) -> Vec<PeerAddress> {
        self.peers.read().values().cloned().collect()
    }

    fn slot(&self, peer: NodeId) -> Arc<Connection> {
        if let Some(conn) = self.connections.read().get(&peer) {
            return conn.clone();
        }
        self.connections
            .write()
            .entry(peer)
            .or_insert_with(|| {
                Connection::new(
                    peer,
                    self.config.alive_delay(),
                    self.config.max_frame_payload,
                    self.events.clone(),
                )
            })
            .clone()
    }

    async fn dial_any(&self, address: &PeerAddress) -> FabricResult<(Link, TransportKind)> {
        let mut last = FabricError::NoTransport;
        for transport in &self.transports {
            match transport.dial(address).await {
                Ok(link) => return Ok((link, transport.kind())),
                Err(e) => {
                    debug!(peer = %address.node, transport = %transport.kind(), error = %e, "transport failed");
                    last = e;
                }
            }
        }
        Err(last)
    }

    /// Return an open connection to the peer, establishing one if needed.
    ///
    /// Concurrent callers for the same peer share one handshake. Exhausting
    /// the connect attempts reports the peer unreachable.
    pub async fn connect(&self, peer: NodeId) -> FabricResult<Arc<Connection>> {
        let address = self
            .peers
            .read()
            .get(&peer)
            .cloned()
            .ok_or(FabricError::UnknownPeer(peer))?;
        let conn = self.slot(peer);
        if conn.state() == ConnState::Connected {
            return Ok(conn);
        }

        let owner = Arc::clone(&conn);
        let _handshake = owner.handshake.lock().await;
        if conn.state() == ConnState::Connected {
            return Ok(conn);
        }
        if conn.state() == ConnState::Stale {
            info!(peer = %peer, "reconnecting stale connection");
            conn.close();
            tokio::time::sleep(self.config.reconnect_delay()).await;
        }

        let outcome = self
            .config
            .connect_policy()
            .run("connect", FabricError::is_retryable, |attempt| {
                let conn = conn.clone();
                let address = &address;
                async move {
                    conn.begin_connect()?;
                    match self.dial_any(address).await {
                        Ok(dialled) => Ok(dialled),
                        Err(e) => {
                            warn!(peer = %peer, attempt, error = %e, "connect attempt failed");
                            conn.mark_failed();
                            Err(e)
                        }
                    }
                }
            })
            .await;

        match outcome {
            Ok((link, kind)) => {
                conn.attach(link, kind)?;
                Ok(conn)
            }
            Err(e) => {
                let attempts = e.attempts();
                let reason = e.into_last().to_string();
                warn!(peer = %peer, attempts, reason = %reason, "peer unreachable");
                let _ = self.events.send(FabricEvent {
                    peer,
                    kind: FabricEventKind::Unreachable,
                });
                Err(FabricError::Unreachable { peer, attempts, reason })
            }
        }
    }

    /// Send a request with the timeout class matching its kind
    pub async fn send(&self, peer: NodeId, request: NodeRequest) -> FabricResult<NodeResponse> {
        let timeout = if request.is_streaming() {
            self.config.stream_timeout()
        } else {
            self.config.default_timeout()
        };
        self.send_with_timeout(peer, request, timeout).await
    }

    /// Send a request with an explicit timeout.
    ///
    /// A stale connection is closed and re-established after the reconnect
    /// delay before the request goes out; concurrent senders wait on the same
    /// handshake.
    pub async fn send_with_timeout(
        &self,
        peer: NodeId,
        request: NodeRequest,
        timeout: Duration,
    ) -> FabricResult<NodeResponse> {
        let conn = self.connect(peer).await?;
        let name = request.name();
        let result = conn.request(request, timeout).await;
        if let Err(e) = &result {
            warn!(peer = %peer, request = name, error = %e, "request failed");
        }
        result
    }

    /// Close the connection to a peer, if any
    pub fn close(&self, peer: &NodeId) {
        if let Some(conn) = self.connections.read().get(peer) {
            conn.close();
        }
    }

    #[must_use]
    pub fn is_stale(&self, peer: &NodeId) -> bool {
        self.connections.read().get(peer).is_some_and(|c| c.is_stale())
    }

    #[must_use]
    pub fn state(&self, peer: &NodeId) -> Option<ConnState> {
        self.connections.read().get(peer).map(|c| c.state())
    }

    #[must_use]
    pub fn connection(&self, peer: &NodeId) -> Option<Arc<Connection>> {
        self.connections.read().get(peer).cloned()
    }

    /// One staleness sweep: idle connected links become stale, links still
    /// stale from the previous sweep are closed. Returns (demoted, closed).
    pub fn sweep_stale(&self) -> (usize, usize) {
        let threshold = self.config.stale_after();
        let connections: Vec<_> = self.connections.read().values().cloned().collect();
        let mut demoted = 0;
        let mut closed = 0;
        for conn in connections {
            match conn.state() {
                ConnState::Connected if conn.idle_for() > threshold => {
                    if conn.mark_stale() {
                        demoted += 1;
                    }
                }
                ConnState::Stale if conn.idle_for() > threshold => {
                    conn.close();
                    closed += 1;
                }
                _ => {}
            }
        }
        if demoted + closed > 0 {
            debug!(demoted, closed, "stale sweep");
        }
        (demoted, closed)
    }

    /// Run the staleness sweep on its interval, if enabled
    pub fn spawn_stale_sweeper(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        if !self.config.do_stale_check {
            return None;
        }
        let fabric = Arc::downgrade(self);
        let interval = self.config.stale_check_interval();
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(fabric) = fabric.upgrade() else {
                    break;
                };
                fabric.sweep_stale();
            }
        }))
    }

    /// Close every connection
    pub fn shutdown(&self) {
        for conn in self.connections.read().values() {
            conn.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::RemoteError;
    use crate::responder::RequestHandler;
    use crate::transport::MemoryTransport;
    use async_trait::async_trait;
    use bytes::Bytes;
    use fleetstore_common::types::BlockId;
    use tokio::time::Instant;

    struct Agent;

    #[async_trait]
    impl RequestHandler for Agent {
        async fn handle(&self, request: NodeRequest) -> Result<NodeResponse, RemoteError> {
            match request {
                NodeRequest::WriteBlock { block, data, .. } => Ok(NodeResponse::Written {
                    block,
                    size: data.len() as u64,
                }),
                _ => Err(RemoteError::bad_request("unsupported")),
            }
        }
    }

    fn config() -> FabricConfig {
        FabricConfig {
            max_frame_payload: 64,
            ..FabricConfig::default()
        }
    }

    fn fabric_with(transports: Vec<Arc<MemoryTransport>>) -> Fabric {
        let transports = transports.into_iter().map(|t| t as Arc<dyn Transport>).collect();
        Fabric::with_transports(config(), transports)
    }

    fn write(len: usize) -> NodeRequest {
        NodeRequest::write(BlockId::new(), Bytes::from(vec![3u8; len]))
    }

    #[tokio::test]
    async fn test_direct_first() {
        let direct = Arc::new(MemoryTransport::new(TransportKind::Direct, 64));
        let nat = Arc::new(MemoryTransport::new(TransportKind::NatTraversed, 64));
        direct.register("n1:7400", Arc::new(Agent));
        nat.register("n1:7400", Arc::new(Agent));
        let fabric = fabric_with(vec![direct.clone(), nat.clone()]);
        let peer = NodeId::new();
        fabric.register_peer(PeerAddress::new(peer, "n1:7400"));

        let conn = fabric.connect(peer).await.unwrap();
        assert_eq!(conn.transport(), Some(TransportKind::Direct));
        assert_eq!(nat.dial_count("n1:7400"), 0);
    }

    #[tokio::test]
    async fn test_nat_fallback_when_direct_fails() {
        let direct = Arc::new(MemoryTransport::new(TransportKind::Direct, 64));
        let nat = Arc::new(MemoryTransport::new(TransportKind::NatTraversed, 64));
        nat.register("n1:7400", Arc::new(Agent));
        let fabric = fabric_with(vec![direct.clone(), nat]);
        let peer = NodeId::new();
        fabric.register_peer(PeerAddress::new(peer, "n1:7400"));
        let mut events = fabric.subscribe();

        let response = fabric.send(peer, write(200)).await.unwrap();
        assert!(matches!(response, NodeResponse::Written { size: 200, .. }));
        assert_eq!(direct.dial_count("n1:7400"), 1);
        assert_eq!(
            events.recv().await.unwrap().kind,
            FabricEventKind::Connected {
                transport: TransportKind::NatTraversed
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_after_attempt_cap() {
        let direct = Arc::new(MemoryTransport::new(TransportKind::Direct, 64));
        let fabric = fabric_with(vec![direct.clone()]);
        let peer = NodeId::new();
        fabric.register_peer(PeerAddress::new(peer, "gone:7400"));
        let mut events = fabric.subscribe();
        let started = Instant::now();

        let err = fabric.connect(peer).await.unwrap_err();
        assert!(matches!(err, FabricError::Unreachable { attempts: 3, .. }));
        assert_eq!(direct.dial_count("gone:7400"), 3);
        assert_eq!(started.elapsed(), Duration::from_secs(10));
        assert_eq!(fabric.state(&peer), Some(ConnState::Failed));
        assert_eq!(events.recv().await.unwrap().kind, FabricEventKind::Unreachable);
    }

    #[tokio::test]
    async fn test_unknown_peer() {
        let fabric = fabric_with(vec![Arc::new(MemoryTransport::new(TransportKind::Direct, 64))]);
        let err = fabric.connect(NodeId::new()).await.unwrap_err();
        assert!(matches!(err, FabricError::UnknownPeer(_)));
    }

    #[tokio::test]
    async fn test_concurrent_connects_share_handshake() {
        let direct = Arc::new(MemoryTransport::new(TransportKind::Direct, 64));
        direct.register("n1:7400", Arc::new(Agent));
        let fabric = Arc::new(fabric_with(vec![direct.clone()]));
        let peer = NodeId::new();
        fabric.register_peer(PeerAddress::new(peer, "n1:7400"));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let fabric = fabric.clone();
                tokio::spawn(async move { fabric.connect(peer).await.map(|c| c.peer()) })
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), peer);
        }
        assert_eq!(direct.dial_count("n1:7400"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_sweep_then_send_reconnects_after_backoff() {
        let direct = Arc::new(MemoryTransport::new(TransportKind::Direct, 64));
        direct.register("n1:7400", Arc::new(Agent));
        let fabric = fabric_with(vec![direct.clone()]);
        let peer = NodeId::new();
        fabric.register_peer(PeerAddress::new(peer, "n1:7400"));
        fabric.send(peer, write(10)).await.unwrap();
        let mut events = fabric.subscribe();

        tokio::time::advance(Duration::from_secs(301)).await;
        assert_eq!(fabric.sweep_stale(), (1, 0));
        assert!(fabric.is_stale(&peer));
        assert_eq!(events.recv().await.unwrap().kind, FabricEventKind::Stale);

        let started = Instant::now();
        fabric.send(peer, write(10)).await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(5));
        assert_eq!(direct.dial_count("n1:7400"), 2);
        assert_eq!(events.recv().await.unwrap().kind, FabricEventKind::Closed);
        assert_eq!(
            events.recv().await.unwrap().kind,
            FabricEventKind::Reconnected {
                transport: TransportKind::Direct
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_reconnect_backoff_is_shared() {
        let direct = Arc::new(MemoryTransport::new(TransportKind::Direct, 64));
        direct.register("n1:7400", Arc::new(Agent));
        let fabric = Arc::new(fabric_with(vec![direct.clone()]));
        let peer = NodeId::new();
        fabric.register_peer(PeerAddress::new(peer, "n1:7400"));
        fabric.send(peer, write(10)).await.unwrap();
        tokio::time::advance(Duration::from_secs(301)).await;
        assert_eq!(fabric.sweep_stale(), (1, 0));

        let started = Instant::now();
        let first = {
            let fabric = fabric.clone();
            tokio::spawn(async move { fabric.send(peer, write(10)).await })
        };
        // a sender arriving during the backoff must not dial on its own
        tokio::time::sleep(Duration::from_secs(2)).await;
        let second = {
            let fabric = fabric.clone();
            tokio::spawn(async move {
                fabric.send(peer, write(10)).await?;
                Ok::<_, FabricError>(Instant::now())
            })
        };

        let second_done = second.await.unwrap().unwrap();
        first.await.unwrap().unwrap();
        assert!(second_done.duration_since(started) >= Duration::from_secs(5));
        assert_eq!(direct.dial_count("n1:7400"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_does_not_prevent_staleness() {
        let direct = Arc::new(MemoryTransport::new(TransportKind::Direct, 64));
        direct.register("n1:7400", Arc::new(Agent));
        let fabric = fabric_with(vec![direct]);
        let peer = NodeId::new();
        fabric.register_peer(PeerAddress::new(peer, "n1:7400"));
        fabric.connect(peer).await.unwrap();

        // keepalive pings flow every 10s but carry no data
        tokio::time::sleep(Duration::from_secs(301)).await;
        assert_eq!(fabric.sweep_stale(), (1, 0));
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(fabric.sweep_stale(), (0, 1));
        assert_eq!(fabric.state(&peer), Some(ConnState::Closed));
    }

    #[tokio::test]
    async fn test_severed_link_reconnects_on_next_send() {
        let direct = Arc::new(MemoryTransport::new(TransportKind::Direct, 64));
        direct.register("n1:7400", Arc::new(Agent));
        let fabric = fabric_with(vec![direct.clone()]);
        let peer = NodeId::new();
        fabric.register_peer(PeerAddress::new(peer, "n1:7400"));
        fabric.send(peer, write(10)).await.unwrap();
        let mut events = fabric.subscribe();

        direct.set_down("n1:7400", true);
        assert_eq!(events.recv().await.unwrap().kind, FabricEventKind::Closed);
        direct.set_down("n1:7400", false);

        fabric.send(peer, write(10)).await.unwrap();
        assert_eq!(direct.dial_count("n1:7400"), 2);
    }
}
