//! Health checking against live servers.

use std::sync::Arc;
use std::time::{Duration, Instant};

use skillmesh_network::{
    HealthCheckOptions, HealthChecker, HttpTransportConfig, MeshServer, MeshServerConfig,
    PeerRegistry,
};
use skillmesh_protocol::{Host, HostStatus, Identity, SecurityConfig};
use tokio::net::TcpListener;

async fn live_host(name: &str) -> (skillmesh_network::MeshServerHandle, Host) {
    let identity = Arc::new(Identity::generate());
    let mut host = Host::new(name, "127.0.0.1", 0);
    let config = MeshServerConfig::new("127.0.0.1:0", host.clone(), SecurityConfig::development());
    let handle = MeshServer::new(config, identity, PeerRegistry::new())
        .bind()
        .await
        .unwrap();
    host.port = handle.local_addr().port();
    (handle, host)
}

#[tokio::test]
async fn unresponsive_host_does_not_delay_the_others() {
    let (a, host_a) = live_host("a").await;
    let (c, host_c) = live_host("c").await;

    // Accepts TCP connections but never answers.
    let silent = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let silent_port = silent.local_addr().unwrap().port();
    let hold = tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = silent.accept().await {
            held.push(stream);
        }
    });
    let host_b = Host::new("b", "127.0.0.1", silent_port);

    let checker = HealthChecker::http(
        Some(Arc::new(Identity::generate())),
        HttpTransportConfig::default(),
    );
    let options = HealthCheckOptions {
        timeout: Duration::from_millis(200),
    };

    let start = Instant::now();
    let report = checker
        .check_all_hosts_health(&[host_a.clone(), host_b.clone(), host_c.clone()], &options)
        .await;
    let elapsed = start.elapsed();

    assert!(elapsed < Duration::from_millis(1500), "took {elapsed:?}");
    assert_eq!(report.total(), 3);
    assert_eq!(report.online_count(), 2);
    assert_eq!(report.to_string(), "2/3 hosts online");

    let offline: Vec<_> = report.offline().collect();
    assert_eq!(offline.len(), 1);
    assert_eq!(offline[0].host_id, host_b.id);
    assert!(offline[0].timed_out);
    assert!(offline[0].error.is_some());

    hold.abort();
    a.shutdown().await;
    c.shutdown().await;
}

#[tokio::test]
async fn refused_connection_is_offline_with_reason() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let checker = HealthChecker::http(None, HttpTransportConfig::default());
    let result = checker
        .check_host(
            &Host::new("gone", "127.0.0.1", port),
            &HealthCheckOptions {
                timeout: Duration::from_secs(2),
            },
        )
        .await;

    assert_eq!(result.status, HostStatus::Offline);
    assert!(!result.timed_out);
    assert!(result.error.is_some());
    assert!(result.latency_ms.is_none());
}

#[tokio::test]
async fn auth_rejection_marks_host_offline() {
    let identity = Arc::new(Identity::generate());
    let mut host = Host::new("locked", "127.0.0.1", 0);
    let security = SecurityConfig {
        require_auth: true,
        ..SecurityConfig::development()
    };
    let config = MeshServerConfig::new("127.0.0.1:0", host.clone(), security);
    let handle = MeshServer::new(config, identity, PeerRegistry::new())
        .bind()
        .await
        .unwrap();
    host.port = handle.local_addr().port();

    // No identity: no token.
    let checker = HealthChecker::http(None, HttpTransportConfig::default());
    let result = checker.check_host(&host, &HealthCheckOptions::default()).await;
    assert_eq!(result.status, HostStatus::Offline);
    assert!(result.error.unwrap().contains("Unauthorized"));

    handle.shutdown().await;
}
