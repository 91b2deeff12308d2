//! Machine identity: an Ed25519 keypair plus its derived fingerprint.
//!
//! The fingerprint is self-certifying: it is recomputed from the public key
//! by every verifier, so no certificate authority is involved.

use ed25519_dalek::{SigningKey, VerifyingKey};
use serde::Serialize;
use zeroize::Zeroizing;

use crate::crypto;
use crate::ProtocolError;

/// The local machine's signing identity.
///
/// The secret half never leaves this struct except through
/// [`Identity::secret_key_hex`], which hands back a zeroizing buffer
/// for the keystore.
#[derive(Clone)]
pub struct Identity {
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
    fingerprint: String,
}

impl Identity {
    /// Generate a fresh identity. Panics only if the OS entropy source fails.
    pub fn generate() -> Self {
        Self::from_signing_key(crypto::generate_keypair())
    }

    pub fn from_signing_key(signing_key: SigningKey) -> Self {
        let verifying_key = signing_key.verifying_key();
        let fingerprint = crypto::compute_fingerprint(verifying_key.as_bytes());
        Self {
            signing_key,
            verifying_key,
            fingerprint,
        }
    }

    /// Rebuild an identity from a hex-encoded 32-byte secret key.
    pub fn from_secret_hex(secret_hex: &str) -> Result<Self, ProtocolError> {
        let bytes = Zeroizing::new(
            hex::decode(secret_hex)
                .map_err(|e| ProtocolError::InvalidKey(format!("secret key is not hex: {e}")))?,
        );
        let arr: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| ProtocolError::InvalidKey("secret key must be 32 bytes".into()))?;
        let arr = Zeroizing::new(arr);
        Ok(Self::from_signing_key(SigningKey::from_bytes(&arr)))
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn verifying_key(&self) -> &VerifyingKey {
        &self.verifying_key
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.verifying_key.as_bytes())
    }

    pub fn secret_key_hex(&self) -> Zeroizing<String> {
        Zeroizing::new(hex::encode(self.signing_key.to_bytes()))
    }

    /// Sign raw bytes, returning a hex signature.
    pub fn sign_bytes(&self, payload: &[u8]) -> String {
        hex::encode(crypto::sign_message(&self.signing_key, payload).to_bytes())
    }

    /// Sign the canonical serialization of `obj`, returning a hex signature.
    pub fn sign_object<T: Serialize + ?Sized>(&self, obj: &T) -> Result<String, ProtocolError> {
        let bytes = crypto::canonical_bytes(obj)?;
        Ok(self.sign_bytes(&bytes))
    }

    /// Verify `signature` over `obj` against an arbitrary hex public key.
    pub fn verify<T: Serialize + ?Sized>(obj: &T, signature: &str, public_key: &str) -> bool {
        crypto::verify_object(obj, signature, public_key)
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("fingerprint", &self.fingerprint)
            .field("public_key", &self.public_key_hex())
            .finish_non_exhaustive()
    }
}
