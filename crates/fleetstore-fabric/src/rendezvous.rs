//! Rendezvous signaling for NAT-traversed connections
//!
//! Agents behind NAT register the candidate addresses they discovered
//! (their own reflexive addresses from the STUN servers they were handed).
//! A peer wanting to reach such an agent sends an offer and receives the
//! candidates back. Every exchange is one length-delimited bincode request
//! followed by one reply on a short-lived TCP connection.

use crate::error::{FabricError, FabricResult};
use crate::frame;
use bytes::Bytes;
use dashmap::DashMap;
use fleetstore_common::types::NodeId;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

const SIGNAL_FRAME_LIMIT: usize = 64 * 1024;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Signal {
    /// An agent announces where it can be reached
    Register { node: NodeId, candidates: Vec<String> },
    /// A peer asks how to reach `peer`
    Offer { peer: NodeId, stun_servers: Vec<String> },
    Answer { candidates: Vec<String> },
    Ack,
    Reject { reason: String },
}

async fn round_trip(rendezvous: &str, signal: &Signal) -> FabricResult<Signal> {
    let stream = TcpStream::connect(rendezvous)
        .await
        .map_err(|e| FabricError::Negotiation(format!("rendezvous {rendezvous} unreachable: {e}")))?;
    let mut framed = Framed::new(stream, frame::codec(SIGNAL_FRAME_LIMIT));
    framed.send(Bytes::from(bincode::serialize(signal)?)).await?;
    match framed.next().await {
        Some(reply) => Ok(bincode::deserialize(&reply?)?),
        None => Err(FabricError::Negotiation(format!(
            "rendezvous {rendezvous} closed without answering"
        ))),
    }
}

/// Send one signal to the rendezvous endpoint and wait for its reply
pub async fn exchange(rendezvous: &str, signal: &Signal, timeout: Duration) -> FabricResult<Signal> {
    tokio::time::timeout(timeout, round_trip(rendezvous, signal))
        .await
        .map_err(|_| FabricError::Negotiation(format!("rendezvous {rendezvous} timed out after {timeout:?}")))?
}

/// Register this agent's candidate addresses with the rendezvous endpoint
pub async fn register_candidates(
    rendezvous: &str,
    node: NodeId,
    candidates: Vec<String>,
    timeout: Duration,
) -> FabricResult<()> {
    match exchange(rendezvous, &Signal::Register { node, candidates }, timeout).await? {
        Signal::Ack => Ok(()),
        Signal::Reject { reason } => Err(FabricError::Negotiation(reason)),
        other => Err(FabricError::Negotiation(format!("unexpected signal {other:?}"))),
    }
}

/// Signaling endpoint keeping the latest candidates of every agent
#[derive(Clone, Default)]
pub struct RendezvousServer {
    registry: Arc<DashMap<NodeId, Vec<String>>>,
}

impl RendezvousServer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Candidates currently registered for a node
    #[must_use]
    pub fn candidates(&self, node: &NodeId) -> Option<Vec<String>> {
        self.registry.get(node).map(|c| c.clone())
    }

    /// Answer one signal
    #[must_use]
    pub fn handle(&self, signal: Signal) -> Signal {
        match signal {
            Signal::Register { node, candidates } => {
                info!(node = %node, count = candidates.len(), "registered candidates");
                self.registry.insert(node, candidates);
                Signal::Ack
            }
            Signal::Offer { peer, stun_servers } => match self.registry.get(&peer) {
                Some(candidates) => {
                    debug!(peer = %peer, stun = ?stun_servers, "answering offer");
                    Signal::Answer {
                        candidates: candidates.clone(),
                    }
                }
                None => Signal::Reject {
                    reason: format!("peer {peer} has not registered"),
                },
            },
            other => Signal::Reject {
                reason: format!("unexpected signal {other:?}"),
            },
        }
    }

    /// Accept signaling connections until the listener fails
    pub async fn serve(self, listener: TcpListener) -> FabricResult<()> {
        loop {
            let (stream, remote) = listener.accept().await?;
            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.serve_one(stream).await {
                    warn!(remote = %remote, error = %e, "signaling exchange failed");
                }
            });
        }
    }

    async fn serve_one(&self, stream: TcpStream) -> FabricResult<()> {
        let mut framed = Framed::new(stream, frame::codec(SIGNAL_FRAME_LIMIT));
        if let Some(request) = framed.next().await {
            let signal: Signal = bincode::deserialize(&request?)?;
            let reply = self.handle(signal);
            framed.send(Bytes::from(bincode::serialize(&reply)?)).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offer_for_unregistered_peer_is_rejected() {
        let server = RendezvousServer::new();
        let reply = server.handle(Signal::Offer {
            peer: NodeId::new(),
            stun_servers: vec![],
        });
        assert!(matches!(reply, Signal::Reject { .. }));
    }

    #[tokio::test]
    async fn test_register_then_offer_over_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let server = RendezvousServer::new();
        tokio::spawn(server.clone().serve(listener));

        let node = NodeId::new();
        register_candidates(&address, node, vec!["10.0.0.7:7400".into()], Duration::from_secs(5))
            .await
            .unwrap();

        let reply = exchange(
            &address,
            &Signal::Offer {
                peer: node,
                stun_servers: vec!["stun:stun.l.google.com:19302".into()],
            },
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert_eq!(
            reply,
            Signal::Answer {
                candidates: vec!["10.0.0.7:7400".into()]
            }
        );
    }
}
