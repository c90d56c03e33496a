//! Fabric error types

use crate::connection::ConnState;
use crate::protocol::RemoteError;
use fleetstore_common::types::NodeId;
use std::time::Duration;
use thiserror::Error;

pub type FabricResult<T> = Result<T, FabricError>;

/// Connection-level failures
#[derive(Debug, Error)]
pub enum FabricError {
    #[error("peer {0} is not registered")]
    UnknownPeer(NodeId),

    #[error("peer {peer} unreachable after {attempts} attempts: {reason}")]
    Unreachable {
        peer: NodeId,
        attempts: u32,
        reason: String,
    },

    #[error("handshake with {address} failed: {reason}")]
    Handshake { address: String, reason: String },

    #[error("NAT negotiation failed: {0}")]
    Negotiation(String),

    #[error("no transport enabled")]
    NoTransport,

    #[error("request {id} to {peer} timed out after {after:?}")]
    Timeout { peer: NodeId, id: u64, after: Duration },

    #[error("connection to {0} is closed")]
    Closed(NodeId),

    #[error("invalid connection transition {from} -> {to}")]
    InvalidTransition { from: ConnState, to: ConnState },

    #[error("remote error: {0}")]
    Remote(RemoteError),

    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),

    #[error("frame error: {0}")]
    Frame(#[from] bincode::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl FabricError {
    /// Failures a fresh attempt may get past
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Unreachable { .. }
                | Self::Handshake { .. }
                | Self::Negotiation(_)
                | Self::Timeout { .. }
                | Self::Closed(_)
                | Self::Io(_)
        )
    }

    /// The peer could not be reached at all
    #[must_use]
    pub const fn is_unreachable(&self) -> bool {
        matches!(self, Self::Unreachable { .. } | Self::UnknownPeer(_))
    }
}
