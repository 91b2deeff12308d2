//! Signed envelopes wrapping a [`TransportMessage`].
//!
//! The signature covers the canonical JSON of every envelope field except
//! `signature` itself: the message id, type, addressing, payload and
//! timestamp plus the sender fingerprint, public key and nonce.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::{self, compute_fingerprint, parse_public_key};
use crate::identity::Identity;
use crate::types::TransportMessage;
use crate::ProtocolError;

/// A `TransportMessage` plus proof of who sent it.
///
/// Absent proof fields deserialize as empty strings so that a malformed
/// envelope reaches [`verify_secure_message`] and is rejected with a
/// specific reason rather than a generic parse failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecureTransportMessage {
    #[serde(flatten)]
    pub message: TransportMessage,
    #[serde(default)]
    pub signature: String,
    #[serde(default)]
    pub sender_fingerprint: String,
    #[serde(default)]
    pub sender_public_key: String,
    #[serde(default)]
    pub nonce: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SigningView<'a> {
    #[serde(flatten)]
    message: &'a TransportMessage,
    sender_fingerprint: &'a str,
    sender_public_key: &'a str,
    nonce: &'a str,
}

/// Why an envelope was refused.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EnvelopeRejection {
    #[error("missing signature")]
    MissingSignature,
    #[error("missing sender public key")]
    MissingPublicKey,
    #[error("missing sender fingerprint")]
    MissingFingerprint,
    #[error("missing nonce")]
    MissingNonce,
    #[error("invalid sender public key: {0}")]
    InvalidPublicKey(String),
    #[error("fingerprint mismatch: claimed {claimed}, computed {computed}")]
    FingerprintMismatch { claimed: String, computed: String },
    #[error("signature does not verify")]
    BadSignature,
}

impl SecureTransportMessage {
    /// Sign `message` with `identity` under a fresh nonce.
    pub fn seal(message: TransportMessage, identity: &Identity) -> Result<Self, ProtocolError> {
        let mut envelope = Self {
            message,
            signature: String::new(),
            sender_fingerprint: identity.fingerprint().to_string(),
            sender_public_key: identity.public_key_hex(),
            nonce: crypto::random_nonce(),
        };
        envelope.signature = identity.sign_object(&envelope.signing_view())?;
        Ok(envelope)
    }

    /// Wrap without proof. Verifying receivers reject these; only useful
    /// when no identity is available.
    pub fn unsigned(message: TransportMessage) -> Self {
        Self {
            message,
            signature: String::new(),
            sender_fingerprint: String::new(),
            sender_public_key: String::new(),
            nonce: crypto::random_nonce(),
        }
    }

    fn signing_view(&self) -> SigningView<'_> {
        SigningView {
            message: &self.message,
            sender_fingerprint: &self.sender_fingerprint,
            sender_public_key: &self.sender_public_key,
            nonce: &self.nonce,
        }
    }

    pub fn verify(&self) -> Result<(), EnvelopeRejection> {
        verify_secure_message(self)
    }
}

/// Receiver-side gate. Every structural and cryptographic check must pass.
pub fn verify_secure_message(msg: &SecureTransportMessage) -> Result<(), EnvelopeRejection> {
    if msg.signature.is_empty() {
        return Err(EnvelopeRejection::MissingSignature);
    }
    if msg.sender_public_key.is_empty() {
        return Err(EnvelopeRejection::MissingPublicKey);
    }
    if msg.sender_fingerprint.is_empty() {
        return Err(EnvelopeRejection::MissingFingerprint);
    }
    if msg.nonce.is_empty() {
        return Err(EnvelopeRejection::MissingNonce);
    }

    let key = parse_public_key(&msg.sender_public_key)
        .map_err(|e| EnvelopeRejection::InvalidPublicKey(e.to_string()))?;
    let computed = compute_fingerprint(key.as_bytes());
    if computed != msg.sender_fingerprint {
        return Err(EnvelopeRejection::FingerprintMismatch {
            claimed: msg.sender_fingerprint.clone(),
            computed,
        });
    }

    if !crypto::verify_object(&msg.signing_view(), &msg.signature, &msg.sender_public_key) {
        return Err(EnvelopeRejection::BadSignature);
    }
    Ok(())
}
