//! Transports producing byte links to peers
//!
//! A [`Link`] is any bidirectional byte stream. The fabric tries its
//! transports in order (direct first, NAT traversal second) and frames
//! whatever link the first successful transport returns.

use crate::error::{FabricError, FabricResult};
use crate::rendezvous::{self, Signal};
use crate::responder::{RequestHandler, serve_link};
use async_trait::async_trait;
use fleetstore_common::retry::RetryPolicy;
use fleetstore_common::types::NodeId;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Byte stream a connection is framed over
pub trait LinkIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> LinkIo for T {}

pub type Link = Box<dyn LinkIo>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Direct,
    NatTraversed,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Direct => f.write_str("DIRECT"),
            Self::NatTraversed => f.write_str("NAT_TRAVERSED"),
        }
    }
}

/// Where a peer can be reached
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerAddress {
    pub node: NodeId,
    pub address: String,
}

impl PeerAddress {
    pub fn new(node: NodeId, address: impl Into<String>) -> Self {
        Self {
            node,
            address: address.into(),
        }
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Open a link to the peer (one attempt)
    async fn dial(&self, peer: &PeerAddress) -> FabricResult<Link>;
}

async fn tcp_connect(address: &str, timeout: Duration) -> FabricResult<TcpStream> {
    let stream = tokio::time::timeout(timeout, TcpStream::connect(address))
        .await
        .map_err(|_| FabricError::Handshake {
            address: address.to_string(),
            reason: format!("no answer within {timeout:?}"),
        })?
        .map_err(|e| FabricError::Handshake {
            address: address.to_string(),
            reason: e.to_string(),
        })?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// Plain TCP to the peer's advertised address
pub struct DirectTransport {
    connect_timeout: Duration,
}

impl DirectTransport {
    #[must_use]
    pub const fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl Transport for DirectTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Direct
    }

    async fn dial(&self, peer: &PeerAddress) -> FabricResult<Link> {
        let stream = tcp_connect(&peer.address, self.connect_timeout).await?;
        debug!(peer = %peer.node, address = %peer.address, "direct link established");
        Ok(Box::new(stream))
    }
}

/// Connection negotiated through the rendezvous signaling endpoint.
///
/// Each round sends an offer naming the peer and the STUN servers to the
/// rendezvous, receives the peer's candidate addresses and dials them in
/// order. Rounds repeat according to the negotiation policy.
pub struct NatTraversalTransport {
    rendezvous: String,
    stun_servers: Vec<String>,
    policy: RetryPolicy,
    connect_timeout: Duration,
}

impl NatTraversalTransport {
    pub fn new(
        rendezvous: impl Into<String>,
        stun_servers: Vec<String>,
        policy: RetryPolicy,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            rendezvous: rendezvous.into(),
            stun_servers,
            policy,
            connect_timeout,
        }
    }

    async fn negotiate(&self, peer: &PeerAddress) -> FabricResult<Link> {
        let offer = Signal::Offer {
            peer: peer.node,
            stun_servers: self.stun_servers.clone(),
        };
        let reply = rendezvous::exchange(&self.rendezvous, &offer, self.connect_timeout).await?;
        let candidates = match reply {
            Signal::Answer { candidates } => candidates,
            Signal::Reject { reason } => return Err(FabricError::Negotiation(reason)),
            other => {
                return Err(FabricError::Negotiation(format!("unexpected signal {other:?}")));
            }
        };
        if candidates.is_empty() {
            return Err(FabricError::Negotiation(format!("no candidates for {}", peer.node)));
        }
        for candidate in &candidates {
            match tcp_connect(candidate, self.connect_timeout).await {
                Ok(stream) => {
                    debug!(peer = %peer.node, candidate = %candidate, "NAT-traversed link established");
                    return Ok(Box::new(stream));
                }
                Err(e) => debug!(peer = %peer.node, candidate = %candidate, error = %e, "candidate failed"),
            }
        }
        Err(FabricError::Negotiation(format!(
            "all {} candidates for {} failed",
            candidates.len(),
            peer.node
        )))
    }
}

#[async_trait]
impl Transport for NatTraversalTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::NatTraversed
    }

    async fn dial(&self, peer: &PeerAddress) -> FabricResult<Link> {
        self.policy
            .run("nat_negotiation", FabricError::is_retryable, |_| self.negotiate(peer))
            .await
            .map_err(|e| {
                warn!(peer = %peer.node, attempts = e.attempts(), "NAT negotiation gave up");
                e.into_last()
            })
    }
}

/// In-process transport serving registered handlers over duplex pipes.
///
/// Used to run storage agents inside one process. Addresses can be taken
/// down, which refuses new dials and severs the links already served.
pub struct MemoryTransport {
    kind: TransportKind,
    max_frame_payload: usize,
    handlers: Mutex<HashMap<String, Arc<dyn RequestHandler>>>,
    down: Mutex<HashSet<String>>,
    served: Mutex<HashMap<String, Vec<JoinHandle<()>>>>,
    dials: Mutex<HashMap<String, u32>>,
}

impl MemoryTransport {
    #[must_use]
    pub fn new(kind: TransportKind, max_frame_payload: usize) -> Self {
        Self {
            kind,
            max_frame_payload,
            handlers: Mutex::new(HashMap::new()),
            down: Mutex::new(HashSet::new()),
            served: Mutex::new(HashMap::new()),
            dials: Mutex::new(HashMap::new()),
        }
    }

    pub fn register(&self, address: impl Into<String>, handler: Arc<dyn RequestHandler>) {
        self.handlers.lock().insert(address.into(), handler);
    }

    /// Take an address down (severing its live links) or bring it back
    pub fn set_down(&self, address: &str, down: bool) {
        if down {
            self.down.lock().insert(address.to_string());
            if let Some(tasks) = self.served.lock().remove(address) {
                for task in tasks {
                    task.abort();
                }
            }
        } else {
            self.down.lock().remove(address);
        }
    }

    /// Dial attempts made to an address
    #[must_use]
    pub fn dial_count(&self, address: &str) -> u32 {
        self.dials.lock().get(address).copied().unwrap_or(0)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    async fn dial(&self, peer: &PeerAddress) -> FabricResult<Link> {
        *self.dials.lock().entry(peer.address.clone()).or_insert(0) += 1;
        let refused = || FabricError::Handshake {
            address: peer.address.clone(),
            reason: "connection refused".to_string(),
        };
        if self.down.lock().contains(&peer.address) {
            return Err(refused());
        }
        let handler = self.handlers.lock().get(&peer.address).cloned().ok_or_else(refused)?;

        let (client, server) = tokio::io::duplex(self.max_frame_payload * 4);
        let max_frame_payload = self.max_frame_payload;
        let address = peer.address.clone();
        let task = tokio::spawn(async move {
            if let Err(e) = serve_link(Box::new(server), handler, max_frame_payload).await {
                debug!(address = %address, error = %e, "memory link ended");
            }
        });
        self.served.lock().entry(peer.address.clone()).or_default().push(task);
        Ok(Box::new(client))
    }
}
