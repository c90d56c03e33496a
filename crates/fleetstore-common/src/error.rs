//! Error types for the Fleetstore data model

use thiserror::Error;

/// Common result type for data model operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while building or validating data model values
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid tier policy: {0}")]
    InvalidTier(String),

    #[error("fragment index {index} out of range 0..{total}")]
    InvalidFragment { index: u32, total: u32 },

    #[error("configuration error: {0}")]
    Configuration(String),
}

impl Error {
    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }
}
