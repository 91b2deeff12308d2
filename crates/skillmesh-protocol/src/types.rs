use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::constants::{DEFAULT_MESH_PORT, MAX_WIRE_ID_LEN};

/// Reachability of a host as last classified by a health probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostStatus {
    /// Never probed.
    #[default]
    Unknown,
    Online,
    Offline,
}

impl std::fmt::Display for HostStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            HostStatus::Unknown => "unknown",
            HostStatus::Online => "online",
            HostStatus::Offline => "offline",
        };
        f.write_str(s)
    }
}

/// A machine participating in the mesh.
///
/// `id` never changes once assigned; only the health checker updates
/// `status` and `last_seen`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Host {
    pub id: String,
    pub name: String,
    pub address: String,
    pub port: u16,
    #[serde(default)]
    pub status: HostStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
    #[serde(default, rename = "tailscaleIP", skip_serializing_if = "Option::is_none")]
    pub tailscale_ip: Option<String>,
    /// Fingerprint the host announced, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
}

impl Host {
    pub fn new(name: impl Into<String>, address: impl Into<String>, port: u16) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            address: address.into(),
            port,
            status: HostStatus::Unknown,
            last_seen: None,
            tailscale_ip: None,
            fingerprint: None,
        }
    }

    /// Address to dial: the overlay address when present, else `address`.
    pub fn dial_address(&self) -> &str {
        self.tailscale_ip.as_deref().unwrap_or(&self.address)
    }

    /// `host:port` authority, bracketing IPv6 literals.
    pub fn authority(&self) -> String {
        let addr = self.dial_address();
        if addr.contains(':') && !addr.starts_with('[') {
            format!("[{}]:{}", addr, self.port)
        } else {
            format!("{}:{}", addr, self.port)
        }
    }

    pub fn short_id(&self) -> &str {
        crate::crypto::char_prefix(&self.id, 8)
    }
}

/// Host and message ids arriving from peers are UUIDs in practice; accept
/// only the ASCII alphabet those use, bounded in length.
pub fn is_valid_wire_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_WIRE_ID_LEN
        && id.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_'))
}

impl Default for Host {
    fn default() -> Self {
        Self::new("localhost", "127.0.0.1", DEFAULT_MESH_PORT)
    }
}

/// Logical message moved between hosts.
///
/// `payload` is opaque at this layer; consumers decode it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportMessage {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
}

impl TransportMessage {
    pub fn new(
        kind: impl Into<String>,
        from: impl Into<String>,
        to: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind: kind.into(),
            from: from.into(),
            to: to.into(),
            payload,
            timestamp: Utc::now().timestamp_millis(),
        }
    }
}

/// Well-known `TransportMessage::kind` values.
pub mod kinds {
    pub const MAILBOX: &str = "mailbox";
    pub const PEER_REGISTER: &str = "peer-register";
    pub const PING: &str = "ping";
    pub const BROADCAST: &str = "broadcast";
}

/// Payload of a `POST /peer/register` envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerAnnouncement {
    pub host_id: String,
    pub name: String,
    pub address: String,
    pub port: u16,
}

/// Body of `GET /health`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub host_id: String,
    pub name: String,
    pub fingerprint: String,
    pub version: String,
    pub uptime_secs: u64,
}

/// One entry of `GET /peers`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfo {
    pub fingerprint: String,
    pub host_id: String,
    pub name: String,
    pub address: String,
    pub port: u16,
    pub last_seen_in_session: DateTime<Utc>,
}
