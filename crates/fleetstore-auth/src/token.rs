//! HMAC-signed bearer tokens
//!
//! A token is `base64url(json claims) "." base64url(hmac-sha256(claims))`.

use crate::error::AuthError;
use crate::gate::{AccessGate, Principal};
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use fleetstore_common::types::{Role, SystemId};
use parking_lot::RwLock;
use ring::hmac;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenClaims {
    pub account: String,
    pub system: SystemId,
    pub role: Role,
    /// Expiry in unix milliseconds
    pub expires_at_ms: u64,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

pub struct HmacTokenGate {
    key: hmac::Key,
    revoked: RwLock<HashSet<String>>,
}

impl HmacTokenGate {
    #[must_use]
    pub fn new(secret: &[u8]) -> Self {
        Self {
            key: hmac::Key::new(hmac::HMAC_SHA256, secret),
            revoked: RwLock::new(HashSet::new()),
        }
    }

    /// Sign a token carrying `claims`
    pub fn issue(&self, claims: &TokenClaims) -> Result<String, serde_json::Error> {
        let body = serde_json::to_vec(claims)?;
        let tag = hmac::sign(&self.key, &body);
        Ok(format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(&body),
            URL_SAFE_NO_PAD.encode(tag.as_ref())
        ))
    }

    /// Reject every token of an account from now on
    pub fn revoke(&self, account: impl Into<String>) {
        self.revoked.write().insert(account.into());
    }

    fn check(&self, token: &str) -> Result<Principal, AuthError> {
        let (body, tag) = token.split_once('.').ok_or(AuthError::Malformed)?;
        let body = URL_SAFE_NO_PAD.decode(body).map_err(|_| AuthError::Malformed)?;
        let tag = URL_SAFE_NO_PAD.decode(tag).map_err(|_| AuthError::Malformed)?;
        hmac::verify(&self.key, &body, &tag).map_err(|_| AuthError::BadSignature)?;

        let claims: TokenClaims = serde_json::from_slice(&body).map_err(|_| AuthError::Malformed)?;
        if claims.expires_at_ms <= now_ms() {
            return Err(AuthError::Expired);
        }
        if self.revoked.read().contains(&claims.account) {
            return Err(AuthError::Revoked);
        }
        Ok(Principal {
            account: claims.account,
            system: claims.system,
            role: claims.role,
        })
    }
}

#[async_trait]
impl AccessGate for HmacTokenGate {
    async fn validate(&self, token: &str) -> Result<Principal, AuthError> {
        self.check(token).inspect_err(|e| debug!(reason = e.reason(), "token rejected"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claims(role: Role, ttl_ms: i64) -> TokenClaims {
        TokenClaims {
            account: "acct-1".into(),
            system: SystemId::new(),
            role,
            expires_at_ms: now_ms().saturating_add_signed(ttl_ms),
        }
    }

    #[tokio::test]
    async fn test_valid_token() {
        let gate = HmacTokenGate::new(b"secret");
        let claims = claims(Role::Admin, 60_000);
        let token = gate.issue(&claims).unwrap();

        let principal = gate.validate(&token).await.unwrap();
        assert_eq!(principal.account, "acct-1");
        assert_eq!(principal.system, claims.system);
        assert!(principal.can_administer());
    }

    #[tokio::test]
    async fn test_rejections_look_identical() {
        let gate = HmacTokenGate::new(b"secret");
        let other = HmacTokenGate::new(b"other");

        let forged = other.issue(&claims(Role::Admin, 60_000)).unwrap();
        let expired = gate.issue(&claims(Role::User, -1)).unwrap();
        gate.revoke("acct-1");
        let revoked = gate.issue(&claims(Role::User, 60_000)).unwrap();

        let errors = [
            gate.validate("garbage").await.unwrap_err(),
            gate.validate(&forged).await.unwrap_err(),
            gate.validate(&expired).await.unwrap_err(),
            gate.validate(&revoked).await.unwrap_err(),
        ];
        assert_eq!(errors[1], AuthError::BadSignature);
        assert_eq!(errors[2], AuthError::Expired);
        assert_eq!(errors[3], AuthError::Revoked);
        assert!(errors.iter().all(|e| e.to_string() == "unauthorized"));
    }

    #[test]
    fn test_user_cannot_administer() {
        let principal = Principal {
            account: "a".into(),
            system: SystemId::new(),
            role: Role::User,
        };
        assert_eq!(principal.require_admin(principal.system), Err(AuthError::Forbidden));
        assert!(principal.require_system(principal.system).is_ok());
    }
}
