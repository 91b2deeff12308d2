//! Overlay-network peer enumeration through the `tailscale` CLI.

use std::collections::HashMap;
use std::time::Duration;

use futures::future::join_all;
use serde::Deserialize;
use tokio::net::TcpStream;
use tokio::process::Command;

use skillmesh_protocol::Host;

use crate::NetworkError;

const DEFAULT_BINARY: &str = "tailscale";
const STATUS_TIMEOUT: Duration = Duration::from_secs(5);
const PORT_PROBE_TIMEOUT: Duration = Duration::from_millis(1500);

/// Subset of `tailscale status --json` the mesh reads.
#[derive(Debug, Clone, Deserialize)]
pub struct TailscaleStatus {
    #[serde(rename = "BackendState", default)]
    pub backend_state: String,
    #[serde(rename = "Self")]
    pub self_node: Option<TailscalePeer>,
    #[serde(rename = "Peer", default)]
    pub peers: HashMap<String, TailscalePeer>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TailscalePeer {
    #[serde(rename = "HostName", default)]
    pub host_name: String,
    #[serde(rename = "DNSName", default)]
    pub dns_name: String,
    #[serde(rename = "OS", default)]
    pub os: String,
    #[serde(rename = "TailscaleIPs", default)]
    pub tailscale_ips: Vec<String>,
    #[serde(rename = "Online", default)]
    pub online: bool,
}

impl TailscalePeer {
    /// First IPv4 overlay address, else the first address of any family.
    pub fn primary_ip(&self) -> Option<&str> {
        self.tailscale_ips
            .iter()
            .find(|ip| !ip.contains(':'))
            .or_else(|| self.tailscale_ips.first())
            .map(String::as_str)
    }

    fn display_name(&self) -> &str {
        if !self.host_name.is_empty() {
            return &self.host_name;
        }
        self.dns_name.split('.').next().unwrap_or(&self.dns_name)
    }
}

#[derive(Debug, Clone)]
pub struct TailscaleClient {
    binary: String,
    port_probe_timeout: Duration,
}

impl Default for TailscaleClient {
    fn default() -> Self {
        Self::new(DEFAULT_BINARY)
    }
}

impl TailscaleClient {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            port_probe_timeout: PORT_PROBE_TIMEOUT,
        }
    }

    pub fn with_port_probe_timeout(mut self, timeout: Duration) -> Self {
        self.port_probe_timeout = timeout;
        self
    }

    /// Whether the CLI is installed and the local node is running.
    pub async fn is_available(&self) -> bool {
        match self.status().await {
            Ok(status) => status.backend_state == "Running",
            Err(e) => {
                tracing::debug!(error = %e, "Tailscale unavailable");
                false
            }
        }
    }

    pub async fn status(&self) -> Result<TailscaleStatus, NetworkError> {
        let output = tokio::time::timeout(
            STATUS_TIMEOUT,
            Command::new(&self.binary).args(["status", "--json"]).output(),
        )
        .await
        .map_err(|_| NetworkError::Timeout("tailscale status".into()))??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(NetworkError::Discovery(format!(
                "tailscale status exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }
        Self::parse_status(&String::from_utf8_lossy(&output.stdout))
    }

    pub fn parse_status(json: &str) -> Result<TailscaleStatus, NetworkError> {
        serde_json::from_str(json)
            .map_err(|e| NetworkError::Discovery(format!("unreadable tailscale status: {e}")))
    }

    /// Online overlay peers that accept TCP on `port`.
    pub async fn discover_tailscale_hosts(&self, port: u16) -> Result<Vec<Host>, NetworkError> {
        let status = self.status().await?;
        Ok(self.hosts_from_status(&status, port).await)
    }

    async fn hosts_from_status(&self, status: &TailscaleStatus, port: u16) -> Vec<Host> {
        let candidates: Vec<(&TailscalePeer, &str)> = status
            .peers
            .values()
            .filter(|p| p.online)
            .filter_map(|p| p.primary_ip().map(|ip| (p, ip)))
            .collect();

        let probes = candidates.iter().map(|(peer, ip)| async move {
            let open = port_open(ip, port, self.port_probe_timeout).await;
            tracing::debug!(peer = %peer.display_name(), ip = %ip, open, "Probed overlay peer");
            open.then(|| {
                let mut host = Host::new(peer.display_name(), *ip, port);
                host.tailscale_ip = Some(ip.to_string());
                host
            })
        });
        let mut hosts: Vec<Host> = join_all(probes).await.into_iter().flatten().collect();
        hosts.sort_by(|a, b| a.name.cmp(&b.name));
        hosts
    }
}

async fn port_open(ip: &str, port: u16, timeout: Duration) -> bool {
    let addr = if ip.contains(':') {
        format!("[{ip}]:{port}")
    } else {
        format!("{ip}:{port}")
    };
    matches!(
        tokio::time::timeout(timeout, TcpStream::connect(addr)).await,
        Ok(Ok(_))
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "BackendState": "Running",
        "Self": {"HostName": "me", "DNSName": "me.tail.ts.net.", "OS": "linux",
                 "TailscaleIPs": ["100.64.0.1", "fd7a::1"], "Online": true},
        "Peer": {
            "nodekey:a": {"HostName": "alpha", "DNSName": "alpha.tail.ts.net.", "OS": "linux",
                          "TailscaleIPs": ["fd7a::2", "100.64.0.2"], "Online": true},
            "nodekey:b": {"HostName": "", "DNSName": "beta.tail.ts.net.", "OS": "macOS",
                          "TailscaleIPs": ["100.64.0.3"], "Online": false}
        }
    }"#;

    #[test]
    fn test_parse_status() {
        let status = TailscaleClient::parse_status(SAMPLE).unwrap();
        assert_eq!(status.backend_state, "Running");
        assert_eq!(status.peers.len(), 2);
        let alpha = &status.peers["nodekey:a"];
        assert_eq!(alpha.primary_ip(), Some("100.64.0.2"));
        assert_eq!(status.peers["nodekey:b"].display_name(), "beta");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(
            TailscaleClient::parse_status("not json"),
            Err(NetworkError::Discovery(_))
        ));
    }

    #[tokio::test]
    async fn test_only_open_online_peers_returned() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let status = TailscaleClient::parse_status(&format!(
            r#"{{"BackendState": "Running", "Peer": {{
                "a": {{"HostName": "open", "TailscaleIPs": ["127.0.0.1"], "Online": true}},
                "b": {{"HostName": "offline", "TailscaleIPs": ["127.0.0.1"], "Online": false}}
            }}}}"#
        ))
        .unwrap();

        let client = TailscaleClient::default().with_port_probe_timeout(Duration::from_millis(500));
        let hosts = client.hosts_from_status(&status, port).await;
        assert_eq!(hosts.len(), 1);
        assert_eq!(hosts[0].name, "open");
        assert_eq!(hosts[0].tailscale_ip.as_deref(), Some("127.0.0.1"));
    }

    #[tokio::test]
    async fn test_missing_binary_is_unavailable() {
        let client = TailscaleClient::new("/nonexistent/tailscale-binary");
        assert!(!client.is_available().await);
    }
}
