//! Placement errors

use fleetstore_common::types::{NodeId, TierId};
use thiserror::Error;

pub type PlacementResult<T> = Result<T, PlacementError>;

#[derive(Debug, Error)]
pub enum PlacementError {
    #[error("unknown tier {0}")]
    UnknownTier(TierId),

    #[error("unknown node {0}")]
    UnknownNode(NodeId),

    #[error("tier {tier} has {available} eligible nodes, {required} required")]
    InsufficientNodes {
        tier: TierId,
        available: usize,
        required: usize,
    },

    #[error("invalid tier policy: {0}")]
    InvalidTier(#[from] fleetstore_common::Error),
}

impl PlacementError {
    /// Eligible nodes may come back, so a later attempt can succeed
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::InsufficientNodes { .. })
    }
}
