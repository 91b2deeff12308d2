//! Subnet discovery over loopback.

use std::time::Duration;

use skillmesh_network::{
    DiscoveryAnnouncement, DiscoveryConfig, DiscoveryResponder, MeshCapabilities, MeshDiscovery,
};
use skillmesh_protocol::PROTOCOL_VERSION;

fn announcement(host_id: &str, name: &str) -> DiscoveryAnnouncement {
    DiscoveryAnnouncement {
        host_id: host_id.into(),
        name: name.into(),
        port: 9876,
        fingerprint: "0f".repeat(16),
        version: PROTOCOL_VERSION.into(),
    }
}

fn discovery_for(port: u16, local_host_id: &str) -> MeshDiscovery {
    let config = DiscoveryConfig {
        port,
        broadcast_addr: "127.0.0.1".into(),
        local_host_id: local_host_id.into(),
    };
    let capabilities = MeshCapabilities {
        udp_broadcast: true,
        ..MeshCapabilities::default()
    };
    MeshDiscovery::new(config, capabilities, None)
}

#[tokio::test]
async fn finds_responding_node() {
    let responder = DiscoveryResponder::bind("127.0.0.1:0", announcement("remote", "box"))
        .await
        .unwrap();
    let discovery = discovery_for(responder.local_addr().port(), "me");

    let hosts = discovery.discover_once(Duration::from_millis(300)).await.unwrap();
    assert_eq!(hosts.len(), 1);
    assert_eq!(hosts[0].id, "remote");
    assert_eq!(hosts[0].name, "box");
    assert_eq!(hosts[0].address, "127.0.0.1");
    assert_eq!(hosts[0].port, 9876);
    assert_eq!(hosts[0].fingerprint.as_deref(), Some("0f".repeat(16).as_str()));

    responder.shutdown();
}

#[tokio::test]
async fn own_announcements_are_ignored() {
    let responder = DiscoveryResponder::bind("127.0.0.1:0", announcement("me", "self"))
        .await
        .unwrap();
    let discovery = discovery_for(responder.local_addr().port(), "me");

    let hosts = discovery.discover_once(Duration::from_millis(200)).await.unwrap();
    assert!(hosts.is_empty());
}

#[tokio::test]
async fn silence_yields_empty_result_at_deadline() {
    let socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let discovery = discovery_for(socket.local_addr().unwrap().port(), "me");

    let start = std::time::Instant::now();
    let hosts = discovery.discover_once(Duration::from_millis(150)).await.unwrap();
    assert!(hosts.is_empty());
    assert!(start.elapsed() < Duration::from_secs(2));
}
