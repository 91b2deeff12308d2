//! One-shot detection of optional mesh features.
//!
//! Discovery and transports consult a [`MeshCapabilities`] value computed
//! at startup instead of probing the environment at each call site.

use serde::Serialize;
use tokio::net::UdpSocket;

use skillmesh_protocol::{SecurityConfig, TransportMode};

use crate::tailscale::TailscaleClient;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MeshCapabilities {
    /// The overlay network CLI is installed and its node is running.
    pub tailscale: bool,
    /// Clients speak TLS to peers.
    pub tls: bool,
    /// A broadcast-enabled UDP socket can be opened.
    pub udp_broadcast: bool,
}

impl MeshCapabilities {
    /// Probe the environment once.
    pub async fn detect(security: &SecurityConfig, tailscale: Option<&TailscaleClient>) -> Self {
        let tailscale = match tailscale {
            Some(client) => client.is_available().await,
            None => false,
        };
        let capabilities = Self {
            tailscale,
            tls: security.transport == TransportMode::Tls,
            udp_broadcast: udp_broadcast_available().await,
        };
        tracing::debug!(
            tailscale = capabilities.tailscale,
            tls = capabilities.tls,
            udp_broadcast = capabilities.udp_broadcast,
            "Detected mesh capabilities"
        );
        capabilities
    }

    /// Every optional feature enabled; for tests and explicit overrides.
    pub fn all() -> Self {
        Self {
            tailscale: true,
            tls: true,
            udp_broadcast: true,
        }
    }
}

async fn udp_broadcast_available() -> bool {
    match UdpSocket::bind("0.0.0.0:0").await {
        Ok(socket) => socket.set_broadcast(true).is_ok(),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_detect_without_tailscale() {
        let caps = MeshCapabilities::detect(&SecurityConfig::hardened(), None).await;
        assert!(!caps.tailscale);
        assert!(caps.tls);
    }

    #[tokio::test]
    async fn test_detect_with_missing_tailscale_binary() {
        let client = TailscaleClient::new("/nonexistent/tailscale-binary");
        let caps = MeshCapabilities::detect(&SecurityConfig::development(), Some(&client)).await;
        assert!(!caps.tailscale);
        assert!(!caps.tls);
    }
}
