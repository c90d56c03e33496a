//! Usage accounting errors

use fleetstore_meta_store::MetaStoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum UsageError {
    #[error("metadata store: {0}")]
    Store(#[from] MetaStoreError),

    #[error("invalid report: {0}")]
    InvalidReport(String),
}

impl UsageError {
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Store(e) => e.is_retryable(),
            Self::InvalidReport(_) => false,
        }
    }
}

pub type UsageResult<T> = Result<T, UsageError>;
