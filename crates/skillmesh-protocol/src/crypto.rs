use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::constants::{FINGERPRINT_BYTES, SHORT_FINGERPRINT_LEN};
use crate::ProtocolError;

/// Generate a new Ed25519 keypair from the operating system's entropy source.
pub fn generate_keypair() -> SigningKey {
    let mut rng = rand::rngs::OsRng;
    SigningKey::generate(&mut rng)
}

/// Derive the fingerprint of a public key.
///
/// Format: lowercase hex of the first 16 bytes of SHA-256 over the raw
/// 32-byte Ed25519 public key. Pure; any verifier can recompute it.
pub fn compute_fingerprint(public_key: &[u8]) -> String {
    let hash = Sha256::digest(public_key);
    hex::encode(&hash[..FINGERPRINT_BYTES])
}

/// Abbreviated fingerprint for tables and log lines.
pub fn short_fingerprint(fingerprint: &str) -> &str {
    char_prefix(fingerprint, SHORT_FINGERPRINT_LEN)
}

/// The first `max` characters of `s`. Peers choose ids and fingerprints,
/// so the cut must land on a char boundary.
pub fn char_prefix(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((end, _)) => &s[..end],
        None => s,
    }
}

/// Sign raw bytes with the signing key.
pub fn sign_message(signing_key: &SigningKey, payload: &[u8]) -> Signature {
    signing_key.sign(payload)
}

/// Verify a signature over raw bytes.
pub fn verify_signature(
    verifying_key: &VerifyingKey,
    payload: &[u8],
    signature: &Signature,
) -> Result<(), ProtocolError> {
    verifying_key
        .verify(payload, signature)
        .map_err(|e| ProtocolError::InvalidSignature(e.to_string()))
}

/// Canonical bytes of any serializable object.
///
/// The object is converted to a JSON value and written with object keys
/// sorted lexicographically at every depth and no whitespace, so the same
/// logical object always produces the same bytes.
pub fn canonical_bytes<T: Serialize + ?Sized>(obj: &T) -> Result<Vec<u8>, ProtocolError> {
    let value = serde_json::to_value(obj)?;
    let mut out = String::new();
    write_canonical(&value, &mut out);
    Ok(out.into_bytes())
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (key, item)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(item, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Parse a hex-encoded Ed25519 public key.
pub fn parse_public_key(hex_key: &str) -> Result<VerifyingKey, ProtocolError> {
    let bytes = hex::decode(hex_key)
        .map_err(|e| ProtocolError::InvalidKey(format!("public key is not hex: {e}")))?;
    let arr: [u8; 32] = bytes
        .try_into()
        .map_err(|_| ProtocolError::InvalidKey("public key must be 32 bytes".into()))?;
    VerifyingKey::from_bytes(&arr).map_err(|e| ProtocolError::InvalidKey(e.to_string()))
}

/// Parse a hex-encoded Ed25519 signature.
pub fn parse_signature(hex_sig: &str) -> Result<Signature, ProtocolError> {
    let bytes = hex::decode(hex_sig)
        .map_err(|e| ProtocolError::InvalidSignature(format!("signature is not hex: {e}")))?;
    let arr: [u8; 64] = bytes
        .try_into()
        .map_err(|_| ProtocolError::InvalidSignature("signature must be 64 bytes".into()))?;
    Ok(Signature::from_bytes(&arr))
}

/// Verify a hex signature over the canonical form of `obj` with a hex public key.
///
/// Any malformed input (bad hex, wrong length, unserializable object) is
/// reported as `false`.
pub fn verify_object<T: Serialize + ?Sized>(obj: &T, signature: &str, public_key: &str) -> bool {
    let Ok(key) = parse_public_key(public_key) else {
        return false;
    };
    let Ok(sig) = parse_signature(signature) else {
        return false;
    };
    let Ok(bytes) = canonical_bytes(obj) else {
        return false;
    };
    verify_signature(&key, &bytes, &sig).is_ok()
}

/// Random nonce, 16 bytes hex-encoded.
pub fn random_nonce() -> String {
    hex::encode(rand::random::<[u8; 16]>())
}
