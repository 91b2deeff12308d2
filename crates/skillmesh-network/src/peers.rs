//! Peer registry: the in-session view of currently reachable peers.
//!
//! Unlike the known-hosts file this is never persisted. It is filled by
//! `/peer/register` calls and discovery during the life of one process.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Duration, Utc};

use skillmesh_protocol::{Host, HostStatus, PeerAnnouncement, PeerInfo};

/// A peer seen during this session, keyed by its fingerprint.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerEntry {
    pub fingerprint: String,
    pub host_id: String,
    pub name: String,
    pub address: String,
    pub port: u16,
    pub last_seen_in_session: DateTime<Utc>,
}

impl PeerEntry {
    pub fn from_announcement(fingerprint: impl Into<String>, announcement: &PeerAnnouncement) -> Self {
        Self {
            fingerprint: fingerprint.into(),
            host_id: announcement.host_id.clone(),
            name: announcement.name.clone(),
            address: announcement.address.clone(),
            port: announcement.port,
            last_seen_in_session: Utc::now(),
        }
    }

    /// Host record for dialing this peer. The peer answered recently, so
    /// it is reported online.
    pub fn to_host(&self) -> Host {
        Host {
            id: self.host_id.clone(),
            name: self.name.clone(),
            address: self.address.clone(),
            port: self.port,
            status: HostStatus::Online,
            last_seen: Some(self.last_seen_in_session),
            tailscale_ip: None,
            fingerprint: Some(self.fingerprint.clone()),
        }
    }

    pub fn to_info(&self) -> PeerInfo {
        PeerInfo {
            fingerprint: self.fingerprint.clone(),
            host_id: self.host_id.clone(),
            name: self.name.clone(),
            address: self.address.clone(),
            port: self.port,
            last_seen_in_session: self.last_seen_in_session,
        }
    }
}

/// Thread-safe registry of peers seen this session.
#[derive(Debug, Clone, Default)]
pub struct PeerRegistry {
    peers: Arc<RwLock<HashMap<String, PeerEntry>>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or refresh a peer. A peer that changed address keeps its
    /// fingerprint key and takes the new address.
    pub fn upsert(&self, entry: PeerEntry) {
        let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
        peers.insert(entry.fingerprint.clone(), entry);
    }

    pub fn remove(&self, fingerprint: &str) -> Option<PeerEntry> {
        let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
        peers.remove(fingerprint)
    }

    /// Refresh `last_seen_in_session` for a known peer.
    pub fn mark_seen(&self, fingerprint: &str) {
        let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = peers.get_mut(fingerprint) {
            entry.last_seen_in_session = Utc::now();
        }
    }

    pub fn get(&self, fingerprint: &str) -> Option<PeerEntry> {
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        peers.get(fingerprint).cloned()
    }

    /// Find a peer by host id, then by exact host name.
    pub fn resolve(&self, host: &str) -> Option<PeerEntry> {
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        peers
            .values()
            .find(|p| p.host_id == host)
            .or_else(|| peers.values().find(|p| p.name == host))
            .cloned()
    }

    /// All peers, most recently seen first.
    pub fn all(&self) -> Vec<PeerEntry> {
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        let mut all: Vec<PeerEntry> = peers.values().cloned().collect();
        all.sort_by(|a, b| b.last_seen_in_session.cmp(&a.last_seen_in_session));
        all
    }

    pub fn infos(&self) -> Vec<PeerInfo> {
        self.all().iter().map(PeerEntry::to_info).collect()
    }

    /// Drop peers not seen within `max_age`. Returns how many were removed.
    pub fn prune_older_than(&self, max_age: Duration) -> usize {
        let cutoff = Utc::now() - max_age;
        let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
        let before = peers.len();
        peers.retain(|_, p| p.last_seen_in_session >= cutoff);
        let removed = before - peers.len();
        if removed > 0 {
            tracing::debug!(removed, "Pruned stale peers");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.peers.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
