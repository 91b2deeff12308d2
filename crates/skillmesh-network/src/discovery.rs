//! Local-subnet discovery over UDP broadcast, plus overlay enumeration.
//!
//! A node looking for peers broadcasts one probe datagram and collects
//! announcements until its deadline. Every running node keeps a
//! [`DiscoveryResponder`] that answers probes with its host id, name,
//! mesh port and fingerprint. Discovery is best-effort: whatever arrived
//! before the deadline is the result.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use skillmesh_protocol::{is_valid_wire_id, Host, DEFAULT_DISCOVERY_PORT, PROTOCOL_VERSION};

use crate::capabilities::MeshCapabilities;
use crate::tailscale::TailscaleClient;
use crate::NetworkError;

const MAX_DATAGRAM: usize = 2048;

/// What a responder says about its node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryAnnouncement {
    pub host_id: String,
    pub name: String,
    pub port: u16,
    pub fingerprint: String,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
enum DiscoveryPacket {
    #[serde(rename = "skillmesh-discover", rename_all = "camelCase")]
    Probe { host_id: String, version: String },
    #[serde(rename = "skillmesh-announce")]
    Announce(DiscoveryAnnouncement),
}

#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// UDP port responders listen on.
    pub port: u16,
    /// Where probes are sent, normally the limited broadcast address.
    pub broadcast_addr: String,
    /// This node's host id; its own announcements are ignored.
    pub local_host_id: String,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_DISCOVERY_PORT,
            broadcast_addr: "255.255.255.255".into(),
            local_host_id: String::new(),
        }
    }
}

/// Finds candidate hosts on the local subnet and the overlay network.
pub struct MeshDiscovery {
    config: DiscoveryConfig,
    capabilities: MeshCapabilities,
    tailscale: Option<TailscaleClient>,
}

impl MeshDiscovery {
    pub fn new(
        config: DiscoveryConfig,
        capabilities: MeshCapabilities,
        tailscale: Option<TailscaleClient>,
    ) -> Self {
        Self {
            config,
            capabilities,
            tailscale,
        }
    }

    pub fn capabilities(&self) -> MeshCapabilities {
        self.capabilities
    }

    /// Broadcast one probe and collect announcements until `timeout`.
    /// Results are deduplicated by host id.
    pub async fn discover_once(&self, timeout: Duration) -> Result<Vec<Host>, NetworkError> {
        if !self.capabilities.udp_broadcast {
            tracing::debug!("UDP broadcast unavailable; skipping subnet discovery");
            return Ok(Vec::new());
        }

        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.set_broadcast(true)?;
        let probe = serde_json::to_vec(&DiscoveryPacket::Probe {
            host_id: self.config.local_host_id.clone(),
            version: PROTOCOL_VERSION.into(),
        })?;
        let target = format!("{}:{}", self.config.broadcast_addr, self.config.port);
        socket
            .send_to(&probe, &target)
            .await
            .map_err(|e| NetworkError::Discovery(format!("failed to send probe to {target}: {e}")))?;

        let deadline = Instant::now() + timeout;
        let mut seen = HashSet::new();
        let mut hosts = Vec::new();
        let mut buf = [0u8; MAX_DATAGRAM];

        loop {
            let (len, from) = match tokio::time::timeout_at(deadline, socket.recv_from(&mut buf)).await {
                Ok(Ok(received)) => received,
                Ok(Err(e)) => {
                    tracing::debug!(error = %e, "Discovery receive failed");
                    continue;
                }
                Err(_) => break,
            };
            let Some(announcement) = parse_announcement(&buf[..len]) else {
                continue;
            };
            if announcement.host_id == self.config.local_host_id
                || !seen.insert(announcement.host_id.clone())
            {
                continue;
            }
            tracing::debug!(host = %announcement.name, from = %from, "Discovered host");
            hosts.push(announcement_to_host(announcement, from));
        }

        Ok(hosts)
    }

    /// Overlay peers exposing the mesh `port`. Empty when the overlay
    /// network is absent.
    pub async fn discover_tailscale_hosts(&self, port: u16) -> Result<Vec<Host>, NetworkError> {
        match (&self.tailscale, self.capabilities.tailscale) {
            (Some(client), true) => client.discover_tailscale_hosts(port).await,
            _ => Ok(Vec::new()),
        }
    }

    pub fn is_tailscale_available(&self) -> bool {
        self.capabilities.tailscale && self.tailscale.is_some()
    }
}

fn parse_announcement(bytes: &[u8]) -> Option<DiscoveryAnnouncement> {
    match serde_json::from_slice::<DiscoveryPacket>(bytes) {
        Ok(DiscoveryPacket::Announce(a)) if is_valid_wire_id(&a.host_id) => Some(a),
        _ => None,
    }
}

fn announcement_to_host(announcement: DiscoveryAnnouncement, from: SocketAddr) -> Host {
    Host {
        id: announcement.host_id,
        fingerprint: Some(announcement.fingerprint),
        ..Host::new(announcement.name, from.ip().to_string(), announcement.port)
    }
}

/// Answers discovery probes for the local node.
pub struct DiscoveryResponder {
    local_addr: SocketAddr,
    task: JoinHandle<()>,
}

impl DiscoveryResponder {
    pub async fn bind(addr: &str, announcement: DiscoveryAnnouncement) -> Result<Self, NetworkError> {
        let socket = UdpSocket::bind(addr).await?;
        let local_addr = socket.local_addr()?;
        let reply = serde_json::to_vec(&DiscoveryPacket::Announce(announcement.clone()))?;

        let task = tokio::spawn(async move {
            let mut buf = [0u8; MAX_DATAGRAM];
            loop {
                let (len, from) = match socket.recv_from(&mut buf).await {
                    Ok(received) => received,
                    Err(e) => {
                        tracing::debug!(error = %e, "Discovery responder receive failed");
                        continue;
                    }
                };
                match serde_json::from_slice::<DiscoveryPacket>(&buf[..len]) {
                    Ok(DiscoveryPacket::Probe { host_id, .. }) if host_id != announcement.host_id => {
                        if let Err(e) = socket.send_to(&reply, from).await {
                            tracing::debug!(to = %from, error = %e, "Failed to answer probe");
                        }
                    }
                    Ok(_) => {}
                    Err(_) => tracing::trace!(from = %from, "Ignoring non-discovery datagram"),
                }
            }
        });
        tracing::info!(addr = %local_addr, "Discovery responder listening");

        Ok(Self { local_addr, task })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn shutdown(self) {
        self.task.abort();
    }
}

impl Drop for DiscoveryResponder {
    fn drop(&mut self) {
        self.task.abort();
    }
}
