use serde::{Deserialize, Serialize};

use crate::constants::DEFAULT_TOKEN_TTL_SECS;

/// Transport-level confidentiality mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    /// Plain HTTP / WS. Payloads are signed but travel in the clear.
    #[default]
    None,
    /// HTTPS / WSS.
    Tls,
}

impl TransportMode {
    pub fn http_scheme(&self) -> &'static str {
        match self {
            TransportMode::None => "http",
            TransportMode::Tls => "https",
        }
    }

    pub fn ws_scheme(&self) -> &'static str {
        match self {
            TransportMode::None => "ws",
            TransportMode::Tls => "wss",
        }
    }
}

/// Security profile shared by transports, servers and the auth manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Reject requests without a valid bearer token.
    #[serde(default)]
    pub require_auth: bool,
    /// Whether clients speak TLS to peers.
    #[serde(default)]
    pub transport: TransportMode,
    /// Accept self-signed peer certificates. Only honored when `transport`
    /// is `tls`; never enabled by a preset.
    #[serde(default)]
    pub allow_self_signed: bool,
    /// Lifetime of issued tokens, in seconds.
    #[serde(default = "default_token_ttl")]
    pub token_ttl_secs: i64,
    /// When non-empty, only tokens issued by these fingerprints are accepted.
    #[serde(default)]
    pub trusted_fingerprints: Vec<String>,
}

fn default_token_ttl() -> i64 {
    DEFAULT_TOKEN_TTL_SECS
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self::development()
    }
}

impl SecurityConfig {
    /// Local or standalone use: no auth, no TLS.
    pub fn development() -> Self {
        Self {
            require_auth: false,
            transport: TransportMode::None,
            allow_self_signed: false,
            token_ttl_secs: DEFAULT_TOKEN_TTL_SECS,
            trusted_fingerprints: Vec::new(),
        }
    }

    /// Auth required, TLS with strict certificate validation.
    pub fn hardened() -> Self {
        Self {
            require_auth: true,
            transport: TransportMode::Tls,
            allow_self_signed: false,
            token_ttl_secs: DEFAULT_TOKEN_TTL_SECS,
            trusted_fingerprints: Vec::new(),
        }
    }

    /// Whether a TLS client should skip certificate validation.
    pub fn accept_invalid_certs(&self) -> bool {
        self.transport == TransportMode::Tls && self.allow_self_signed
    }

    pub fn is_trusted(&self, fingerprint: &str) -> bool {
        self.trusted_fingerprints.is_empty()
            || self.trusted_fingerprints.iter().any(|f| f == fingerprint)
    }
}
