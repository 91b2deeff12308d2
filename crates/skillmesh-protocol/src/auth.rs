//! Host-scoped bearer tokens.
//!
//! A token names exactly one target host, carries its issuer's public key
//! and is signed by the issuer. Verification is stateless: signature,
//! fingerprint binding, target and expiry are all checked from the token
//! alone, and nothing is stored server-side.

use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::constants::TOKEN_CLOCK_SKEW_SECS;
use crate::crypto::{compute_fingerprint, parse_public_key, verify_object};
use crate::identity::Identity;
use crate::security::SecurityConfig;
use crate::ProtocolError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthToken {
    pub subject_host_id: String,
    pub issuer_fingerprint: String,
    pub issuer_public_key: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub signature: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TokenClaims<'a> {
    subject_host_id: &'a str,
    issuer_fingerprint: &'a str,
    issuer_public_key: &'a str,
    issued_at: &'a DateTime<Utc>,
    expires_at: &'a DateTime<Utc>,
}

impl AuthToken {
    fn claims(&self) -> TokenClaims<'_> {
        TokenClaims {
            subject_host_id: &self.subject_host_id,
            issuer_fingerprint: &self.issuer_fingerprint,
            issuer_public_key: &self.issuer_public_key,
            issued_at: &self.issued_at,
            expires_at: &self.expires_at,
        }
    }

    /// Encode for an `Authorization: Bearer` header (base64url JSON).
    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(URL_SAFE_NO_PAD.encode(serde_json::to_vec(self)?))
    }

    pub fn decode(encoded: &str) -> Result<Self, ProtocolError> {
        let bytes = URL_SAFE_NO_PAD
            .decode(encoded.trim())
            .map_err(|e| ProtocolError::InvalidMessage(format!("token is not base64url: {e}")))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Full header value, `Bearer <token>`.
    pub fn to_header_value(&self) -> Result<String, ProtocolError> {
        Ok(format!("Bearer {}", self.encode()?))
    }
}

/// Why a token was refused.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TokenRejection {
    #[error("missing bearer token")]
    Missing,
    #[error("malformed token: {0}")]
    Malformed(String),
    #[error("token expired at {0}")]
    Expired(DateTime<Utc>),
    #[error("token issued in the future")]
    NotYetValid,
    #[error("token issued for host {got}, expected {expected}")]
    WrongTarget { expected: String, got: String },
    #[error("issuer fingerprint does not match issuer key")]
    FingerprintMismatch,
    #[error("bad token signature")]
    BadSignature,
    #[error("issuer {0} is not trusted")]
    UntrustedIssuer(String),
}

/// Outcome of [`AuthManager::validate_token`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenValidation {
    pub valid: bool,
    pub reason: Option<TokenRejection>,
}

impl TokenValidation {
    pub fn ok() -> Self {
        Self {
            valid: true,
            reason: None,
        }
    }

    pub fn rejected(reason: TokenRejection) -> Self {
        Self {
            valid: false,
            reason: Some(reason),
        }
    }

    pub fn into_result(self) -> Result<(), TokenRejection> {
        match self.reason {
            None if self.valid => Ok(()),
            Some(reason) => Err(reason),
            None => Err(TokenRejection::Malformed("invalid token".into())),
        }
    }
}

/// Issues tokens signed by the local identity and validates incoming ones.
#[derive(Debug, Clone)]
pub struct AuthManager {
    identity: Arc<Identity>,
    security: SecurityConfig,
}

impl AuthManager {
    pub fn new(identity: Arc<Identity>, security: SecurityConfig) -> Self {
        Self { identity, security }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn security(&self) -> &SecurityConfig {
        &self.security
    }

    /// Whether unauthenticated requests must be refused.
    pub fn require_auth(&self) -> bool {
        self.security.require_auth
    }

    /// Issue a token for `target_host_id` with the configured lifetime.
    pub fn create_token(&self, target_host_id: &str) -> Result<AuthToken, ProtocolError> {
        self.create_token_with_ttl(target_host_id, Duration::seconds(self.security.token_ttl_secs))
    }

    pub fn create_token_with_ttl(
        &self,
        target_host_id: &str,
        ttl: Duration,
    ) -> Result<AuthToken, ProtocolError> {
        let issued_at = Utc::now();
        let mut token = AuthToken {
            subject_host_id: target_host_id.to_string(),
            issuer_fingerprint: self.identity.fingerprint().to_string(),
            issuer_public_key: self.identity.public_key_hex(),
            issued_at,
            expires_at: issued_at + ttl,
            signature: String::new(),
        };
        token.signature = self.identity.sign_object(&token.claims())?;
        Ok(token)
    }

    /// Validate `token` for `expected_target_host_id`. Fails closed.
    pub fn validate_token(&self, token: &AuthToken, expected_target_host_id: &str) -> TokenValidation {
        self.validate_at(token, expected_target_host_id, Utc::now())
    }

    /// Decode and validate a raw `Authorization` header value.
    pub fn validate_header(&self, header: Option<&str>, expected_target_host_id: &str) -> TokenValidation {
        let Some(header) = header else {
            return TokenValidation::rejected(TokenRejection::Missing);
        };
        let Some(encoded) = header.strip_prefix("Bearer ") else {
            return TokenValidation::rejected(TokenRejection::Malformed(
                "expected 'Bearer <token>'".into(),
            ));
        };
        match AuthToken::decode(encoded) {
            Ok(token) => self.validate_token(&token, expected_target_host_id),
            Err(e) => TokenValidation::rejected(TokenRejection::Malformed(e.to_string())),
        }
    }

    fn validate_at(&self, token: &AuthToken, expected: &str, now: DateTime<Utc>) -> TokenValidation {
        if token.subject_host_id != expected {
            return TokenValidation::rejected(TokenRejection::WrongTarget {
                expected: expected.to_string(),
                got: token.subject_host_id.clone(),
            });
        }
        if now >= token.expires_at {
            return TokenValidation::rejected(TokenRejection::Expired(token.expires_at));
        }
        if token.issued_at > now + Duration::seconds(TOKEN_CLOCK_SKEW_SECS) {
            return TokenValidation::rejected(TokenRejection::NotYetValid);
        }
        let key = match parse_public_key(&token.issuer_public_key) {
            Ok(key) => key,
            Err(e) => return TokenValidation::rejected(TokenRejection::Malformed(e.to_string())),
        };
        if compute_fingerprint(key.as_bytes()) != token.issuer_fingerprint {
            return TokenValidation::rejected(TokenRejection::FingerprintMismatch);
        }
        if !verify_object(&token.claims(), &token.signature, &token.issuer_public_key) {
            return TokenValidation::rejected(TokenRejection::BadSignature);
        }
        if !self.security.is_trusted(&token.issuer_fingerprint) {
            return TokenValidation::rejected(TokenRejection::UntrustedIssuer(
                token.issuer_fingerprint.clone(),
            ));
        }
        TokenValidation::ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> AuthManager {
        AuthManager::new(Arc::new(Identity::generate()), SecurityConfig::hardened())
    }

    #[test]
    fn test_future_issue_time_rejected() {
        let auth = manager();
        let token = auth.create_token("host-a").unwrap();
        let past = token.issued_at - Duration::minutes(5);
        let v = auth.validate_at(&token, "host-a", past);
        assert_eq!(v.reason, Some(TokenRejection::NotYetValid));
    }

    #[test]
    fn test_header_roundtrip() {
        let auth = manager();
        let header = auth.create_token("host-a").unwrap().to_header_value().unwrap();
        assert!(auth.validate_header(Some(&header), "host-a").valid);
        assert_eq!(
            auth.validate_header(None, "host-a").reason,
            Some(TokenRejection::Missing)
        );
        assert!(matches!(
            auth.validate_header(Some("Basic abc"), "host-a").reason,
            Some(TokenRejection::Malformed(_))
        ));
    }
}
