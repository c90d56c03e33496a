//! Engine error types
//!
//! [`EngineError`] unifies the failures of every layer the engine drives.
//! Boundary adapters map it to protocol responses through
//! [`EngineError::http_status_code`] and [`EngineError::public_code`]; the
//! display text may name nodes and blocks and is meant for logs only.

use fleetstore_auth::AuthError;
use fleetstore_common::retry::RetryError;
use fleetstore_common::types::{ChunkId, NodeId};
use fleetstore_fabric::FabricError;
use fleetstore_meta_store::MetaStoreError;
use fleetstore_placement::PlacementError;
use thiserror::Error;

pub type EngineResult<T> = Result<T, EngineError>;

/// Repair could not restore a chunk's redundancy
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ReplicationError {
    /// Still reconstructable, but some fragments lack copies
    #[error("chunk {chunk} under-replicated after {attempts} attempts (fragments {fragments:?})")]
    UnderReplicated {
        chunk: ChunkId,
        fragments: Vec<u32>,
        attempts: u32,
    },

    /// Fewer fragments survive than reconstruction needs
    #[error("chunk {chunk} unreconstructable: {available} of {required} fragments available")]
    Unreconstructable {
        chunk: ChunkId,
        available: u32,
        required: u32,
    },
}

impl ReplicationError {
    #[must_use]
    pub const fn chunk(&self) -> ChunkId {
        match self {
            Self::UnderReplicated { chunk, .. } | Self::Unreconstructable { chunk, .. } => *chunk,
        }
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("connection error: {0}")]
    Connection(#[from] FabricError),

    #[error("placement error: {0}")]
    Placement(#[from] PlacementError),

    #[error("replication error: {0}")]
    Replication(#[from] ReplicationError),

    #[error("metadata error: {0}")]
    Metadata(#[from] MetaStoreError),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("invalid request: {0}")]
    Invalid(#[from] fleetstore_common::Error),

    #[error("chunk {0} not found")]
    ChunkNotFound(ChunkId),

    #[error("node {0} not found")]
    NodeNotFound(NodeId),

    /// A node answered with something other than what the request implies
    #[error("node {node} answered {request} unexpectedly: {detail}")]
    BadResponse {
        node: NodeId,
        request: &'static str,
        detail: String,
    },

    #[error("chunk {chunk}: {available} of {required} fragments readable")]
    Unreadable {
        chunk: ChunkId,
        available: u32,
        required: u32,
    },

    #[error("chunk {0} content does not match its digest")]
    Integrity(ChunkId),

    /// The chunk id is already stored with different content or layout
    #[error("chunk {0} already stored with a different layout or digest")]
    ChunkConflict(ChunkId),

    #[error("{operation} failed after {attempts} attempts: {last}")]
    Exhausted {
        operation: &'static str,
        attempts: u32,
        last: Box<EngineError>,
    },
}

impl EngineError {
    /// Worth another attempt against the same or a different node
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connection(e) => e.is_retryable(),
            Self::Metadata(e) => e.is_retryable(),
            Self::Placement(e) => e.is_retryable(),
            Self::BadResponse { .. } => true,
            Self::Exhausted { last, .. } => last.is_retryable(),
            _ => false,
        }
    }

    /// HTTP status used by boundary adapters
    #[must_use]
    pub fn http_status_code(&self) -> u16 {
        match self {
            Self::Invalid(_) | Self::Placement(PlacementError::InvalidTier(_) | PlacementError::UnknownTier(_)) => {
                400
            }
            Self::Auth(_) => 401,
            Self::ChunkNotFound(_) | Self::NodeNotFound(_) | Self::Placement(PlacementError::UnknownNode(_)) => 404,
            Self::ChunkConflict(_) => 409,
            Self::Metadata(MetaStoreError::InvalidSchema { .. }) | Self::Integrity(_) => 500,
            Self::Connection(_)
            | Self::Placement(PlacementError::InsufficientNodes { .. })
            | Self::Replication(_)
            | Self::Metadata(_)
            | Self::BadResponse { .. }
            | Self::Unreadable { .. } => 503,
            Self::Exhausted { last, .. } => last.http_status_code(),
        }
    }

    /// Error code exposed to clients; never carries internal identifiers
    #[must_use]
    pub fn public_code(&self) -> &'static str {
        match self.http_status_code() {
            400 => "InvalidArgument",
            401 => "Unauthorized",
            404 => "NotFound",
            409 => "Conflict",
            503 => "ServiceUnavailable",
            _ => "InternalError",
        }
    }
}

impl From<RetryError<Self>> for EngineError {
    fn from(e: RetryError<Self>) -> Self {
        match e {
            RetryError::Exhausted {
                operation,
                attempts,
                last,
            } => Self::Exhausted {
                operation,
                attempts,
                last: Box::new(last),
            },
            RetryError::Aborted { last, .. } => last,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetstore_common::types::TierId;

    #[test]
    fn test_status_mapping() {
        let insufficient = EngineError::Placement(PlacementError::InsufficientNodes {
            tier: TierId::new(),
            available: 1,
            required: 3,
        });
        assert_eq!(insufficient.http_status_code(), 503);
        assert!(insufficient.is_retryable());

        let auth = EngineError::Auth(AuthError::BadSignature);
        assert_eq!(auth.http_status_code(), 401);
        assert_eq!(auth.public_code(), "Unauthorized");
        assert_eq!(auth.to_string(), "unauthorized");

        let missing = EngineError::ChunkNotFound(ChunkId::new());
        assert_eq!(missing.public_code(), "NotFound");
        assert!(!missing.is_retryable());
    }

    #[test]
    fn test_exhausted_keeps_inner_class() {
        let err = EngineError::Exhausted {
            operation: "write_block",
            attempts: 3,
            last: Box::new(EngineError::Connection(FabricError::Closed(NodeId::new()))),
        };
        assert_eq!(err.http_status_code(), 503);
        assert!(err.is_retryable());
        assert!(!err.public_code().contains("node"));
    }
}
