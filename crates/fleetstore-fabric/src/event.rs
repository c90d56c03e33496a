//! Connection lifecycle events

use crate::transport::TransportKind;
use fleetstore_common::types::NodeId;

/// What happened to a peer's connection
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FabricEventKind {
    /// First successful handshake
    Connected { transport: TransportKind },
    /// Handshake succeeded again after a close or failure
    Reconnected { transport: TransportKind },
    /// No traffic for longer than the staleness threshold
    Stale,
    Closed,
    /// Connect attempts exhausted
    Unreachable,
}

impl FabricEventKind {
    /// The peer answered a handshake
    #[must_use]
    pub const fn is_healthy(self) -> bool {
        matches!(self, Self::Connected { .. } | Self::Reconnected { .. })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FabricEvent {
    pub peer: NodeId,
    pub kind: FabricEventKind,
}
