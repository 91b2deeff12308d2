//! On-disk persistence of the machine identity.
//!
//! The identity file is created once per machine with owner-only
//! permissions. Two processes racing on first run both generate a key, but
//! only one wins the exclusive create; the loser discards its key and
//! loads the winner's, so the machine never ends up with two identities.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::constants::IDENTITY_FILE_VERSION;
use crate::crypto;
use crate::fsutil::{self, PRIVATE_FILE_MODE};
use crate::identity::Identity;
use crate::ProtocolError;

const IDENTITY_FILE_NAME: &str = "identity.json";

/// Serialized form of the keypair.
#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(rename_all = "camelCase")]
struct IdentityFile {
    version: u32,
    public_key: String,
    secret_key: String,
    fingerprint: String,
    #[zeroize(skip)]
    created_at: DateTime<Utc>,
}

/// Loads and persists the one [`Identity`] of this machine.
#[derive(Debug, Clone)]
pub struct Keystore {
    dir: PathBuf,
}

impl Keystore {
    /// Keystore rooted at `dir`; the identity lives at `dir/identity.json`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Default keystore directory: `~/.skillkit/mesh`.
    pub fn default_dir() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".skillkit").join("mesh"))
    }

    pub fn identity_path(&self) -> PathBuf {
        self.dir.join(IDENTITY_FILE_NAME)
    }

    pub fn exists(&self) -> bool {
        self.identity_path().exists()
    }

    /// Return the persisted identity, creating and persisting one on first use.
    pub fn load_or_create_identity(&self) -> Result<Identity, ProtocolError> {
        let path = self.identity_path();
        if path.exists() {
            return self.load();
        }

        fsutil::ensure_private_dir(&self.dir)?;
        let identity = Identity::generate();
        let bytes = encode(&identity)?;
        if fsutil::create_exclusive(&path, &bytes, Some(PRIVATE_FILE_MODE))? {
            tracing::info!(
                fingerprint = %identity.fingerprint(),
                path = %path.display(),
                "Created mesh identity"
            );
            Ok(identity)
        } else {
            tracing::debug!(path = %path.display(), "Identity created concurrently, loading it");
            self.load()
        }
    }

    /// Load the persisted identity, validating its recorded fingerprint.
    pub fn load(&self) -> Result<Identity, ProtocolError> {
        let path = self.identity_path();
        let content = Zeroizing::new(std::fs::read_to_string(&path)?);
        let file: IdentityFile = serde_json::from_str(&content)?;
        if file.version != IDENTITY_FILE_VERSION {
            return Err(ProtocolError::Keystore(format!(
                "unsupported identity file version {}",
                file.version
            )));
        }
        let identity = Identity::from_secret_hex(&file.secret_key)?;
        if identity.public_key_hex() != file.public_key
            || identity.fingerprint() != file.fingerprint
        {
            return Err(ProtocolError::Keystore(format!(
                "identity file {} is inconsistent with its key material",
                path.display()
            )));
        }
        Ok(identity)
    }

    /// Replace the identity with a freshly generated one.
    ///
    /// User-triggered only; peers that pinned the old fingerprint will
    /// stop trusting this machine.
    pub fn reset(&self) -> Result<Identity, ProtocolError> {
        fsutil::ensure_private_dir(&self.dir)?;
        let identity = Identity::generate();
        let bytes = encode(&identity)?;
        fsutil::write_atomic(&self.identity_path(), &bytes, Some(PRIVATE_FILE_MODE))?;
        tracing::warn!(
            fingerprint = %identity.fingerprint(),
            "Mesh identity regenerated"
        );
        Ok(identity)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

fn encode(identity: &Identity) -> Result<Zeroizing<Vec<u8>>, ProtocolError> {
    let file = IdentityFile {
        version: IDENTITY_FILE_VERSION,
        public_key: identity.public_key_hex(),
        secret_key: identity.secret_key_hex().to_string(),
        fingerprint: crypto::compute_fingerprint(identity.verifying_key().as_bytes()),
        created_at: Utc::now(),
    };
    Ok(Zeroizing::new(serde_json::to_vec_pretty(&file)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_or_create_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let keystore = Keystore::new(dir.path());
        let first = keystore.load_or_create_identity().unwrap();
        let second = keystore.load_or_create_identity().unwrap();
        assert_eq!(first.fingerprint(), second.fingerprint());
    }

    #[test]
    fn test_reset_changes_fingerprint() {
        let dir = tempfile::tempdir().unwrap();
        let keystore = Keystore::new(dir.path());
        let first = keystore.load_or_create_identity().unwrap();
        let reset = keystore.reset().unwrap();
        assert_ne!(first.fingerprint(), reset.fingerprint());
        assert_eq!(keystore.load().unwrap().fingerprint(), reset.fingerprint());
    }
}
