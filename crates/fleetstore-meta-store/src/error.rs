//! Metadata store error types

use crate::schema::SchemaViolation;

/// Error type for metadata store operations
#[derive(Debug, thiserror::Error)]
pub enum MetaStoreError {
    #[error("metadata store not connected (collection {0})")]
    NotConnected(String),

    #[error("metadata store unavailable: {0}")]
    Unavailable(String),

    #[error("invalid schema for {collection}: {}", format_violations(.violations))]
    InvalidSchema {
        collection: String,
        violations: Vec<SchemaViolation>,
    },

    #[error("collection already defined: {0}")]
    DuplicateCollection(String),

    #[error("unknown collection: {0}")]
    UnknownCollection(String),

    #[error("duplicate key in {collection} on index ({index})")]
    DuplicateKey { collection: String, index: String },

    #[error("undecodable document {id} in {collection}: {source}")]
    Corrupt {
        collection: String,
        id: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("replica set version mismatch: expected {expected}, found {actual}")]
    VersionMismatch { expected: u64, actual: u64 },

    #[error("replica set not initiated")]
    ReplicaSetNotInitiated,

    #[error("replica set already initiated: {0}")]
    ReplicaSetAlreadyInitiated(String),

    #[error("cannot change store url after connecting (current {current}, requested {requested})")]
    AlreadyConnected { current: String, requested: String },

    #[error("store command timed out: {0}")]
    Timeout(String),

    #[error("redb error: {0}")]
    Redb(#[from] redb::DatabaseError),
    #[error("redb storage error: {0}")]
    Storage(#[from] redb::StorageError),
    #[error("redb table error: {0}")]
    Table(#[from] redb::TableError),
    #[error("redb transaction error: {0}")]
    Transaction(Box<redb::TransactionError>),
    #[error("redb commit error: {0}")]
    Commit(#[from] redb::CommitError),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<redb::TransactionError> for MetaStoreError {
    fn from(e: redb::TransactionError) -> Self {
        Self::Transaction(Box::new(e))
    }
}

impl MetaStoreError {
    /// The store cannot be reached right now
    #[must_use]
    pub const fn is_unavailable(&self) -> bool {
        matches!(self, Self::NotConnected(_) | Self::Unavailable(_) | Self::Timeout(_))
    }

    /// Worth retrying with fresh state
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        self.is_unavailable() || matches!(self, Self::VersionMismatch { .. })
    }
}

fn format_violations(violations: &[SchemaViolation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

pub type MetaStoreResult<T> = Result<T, MetaStoreError>;
