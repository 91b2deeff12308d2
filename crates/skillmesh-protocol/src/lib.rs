//! SkillMesh protocol - identity, envelopes and shared wire types
//!
//! Implements the self-certifying peer identity used by the SkillKit agent
//! mesh: Ed25519 keypairs with SHA-256 fingerprints, canonical-JSON object
//! signing, signed transport envelopes and host-scoped bearer tokens.

pub mod auth;
pub mod constants;
pub mod crypto;
pub mod envelope;
pub mod error;
pub mod fsutil;
pub mod identity;
pub mod keystore;
pub mod security;
pub mod types;

pub use auth::*;
pub use constants::*;
pub use envelope::*;
pub use error::*;
pub use identity::Identity;
pub use keystore::Keystore;
pub use security::*;
pub use types::*;
