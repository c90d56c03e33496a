//! Authentication errors
//!
//! Every variant displays as `unauthorized` so callers cannot tell a
//! missing account from a bad signature. The specific reason is only
//! available through [`AuthError::reason`] for server-side logs.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("unauthorized")]
    Malformed,

    #[error("unauthorized")]
    BadSignature,

    #[error("unauthorized")]
    Expired,

    #[error("unauthorized")]
    Revoked,

    #[error("unauthorized")]
    Forbidden,
}

impl AuthError {
    /// Internal reason, for logs only
    #[must_use]
    pub const fn reason(&self) -> &'static str {
        match self {
            Self::Malformed => "malformed token",
            Self::BadSignature => "signature mismatch",
            Self::Expired => "token expired",
            Self::Revoked => "account revoked",
            Self::Forbidden => "role not permitted",
        }
    }

    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_is_undifferentiated() {
        for err in [
            AuthError::Malformed,
            AuthError::BadSignature,
            AuthError::Expired,
            AuthError::Revoked,
            AuthError::Forbidden,
        ] {
            assert_eq!(err.to_string(), "unauthorized");
        }
    }
}
