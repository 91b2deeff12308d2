//! A running node receiving mail and announcing itself.

use std::sync::Arc;
use std::time::Duration;

use skillmesh_cli::commands::{run_mesh, MeshCommand};
use skillmesh_cli::{MeshConfig, MeshNode, RunningNode};
use skillmesh_mailbox::{
    Folder, MailboxStore, MeshDelivery, MessageKind, MessagingConfig, MessagingService, Priority,
};
use skillmesh_network::{
    PeerRegistry, Transport, WebSocketConfig, WebSocketTransport,
};
use skillmesh_protocol::{Host, HostStatus, Identity, TransportMessage};
use tempfile::TempDir;
use tokio::sync::mpsc;

fn test_config(dir: &TempDir, name: &str) -> MeshConfig {
    let mut config = MeshConfig::default();
    config.paths.data_dir = Some(dir.path().to_path_buf());
    config.node.name = Some(name.to_string());
    config.node.bind_addr = "127.0.0.1".into();
    config.node.port = 0;
    config.discovery.responder_enabled = false;
    config.transport.retries = 0;
    config.transport.request_timeout_ms = 2_000;
    config
}

/// Host record other nodes use to reach `node`.
fn dial_host(node: &RunningNode) -> Host {
    Host {
        address: "127.0.0.1".into(),
        port: node.local_addr().port(),
        ..node.local_host().clone()
    }
}

async fn start(dir: &TempDir, name: &str) -> (MeshConfig, RunningNode) {
    let config = test_config(dir, name);
    let node = MeshNode::new(config.clone()).unwrap().start().await.unwrap();
    (config, node)
}

#[tokio::test]
async fn node_files_inbound_mail() {
    let server_dir = TempDir::new().unwrap();
    let (server_config, server) = start(&server_dir, "server").await;

    let client_dir = TempDir::new().unwrap();
    let client_config = test_config(&client_dir, "laptop");
    let hosts = client_config.known_hosts();
    let local = hosts.initialize_hosts_file("laptop", 0).unwrap();
    hosts.add_known_host(dial_host(&server)).unwrap();

    let delivery = MeshDelivery::new(
        PeerRegistry::new(),
        hosts,
        Arc::new(Identity::generate()),
        client_config.http_transport_config(&local.id),
    );
    let alice = MessagingService::new(
        MessagingConfig::new("alice").with_local_host("laptop", local.id.clone()),
        MailboxStore::new(client_config.mailbox_dir()),
    )
    .unwrap()
    .with_delivery(Arc::new(delivery));

    let report = alice
        .send("bob@server", "deploy", "go", Priority::Urgent, MessageKind::Request)
        .await
        .unwrap();
    assert!(report.delivered, "{:?}", report.error);

    let inbox = MailboxStore::new(server_config.mailbox_dir())
        .list("bob", Folder::Inbox)
        .unwrap();
    assert_eq!(inbox.len(), 1);
    assert_eq!(inbox[0].from, format!("alice@{}", local.id));
    assert_eq!(inbox[0].subject, "deploy");

    server.shutdown().await;
}

#[tokio::test]
async fn inbound_mail_is_announced_on_ws() {
    let server_dir = TempDir::new().unwrap();
    let (_, server) = start(&server_dir, "server").await;

    let (tx, mut rx) = mpsc::unbounded_channel::<TransportMessage>();
    let mut ws_config = WebSocketConfig::new(format!("ws://{}/ws", server.local_addr()));
    ws_config.reconnect = false;
    let watcher = WebSocketTransport::new(ws_config);
    let _subscription = watcher.on_message(Arc::new(move |message: TransportMessage| {
        let _ = tx.send(message);
    }));
    watcher.connect().await.unwrap();
    for _ in 0..50 {
        if server.hub().client_count() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(server.hub().client_count(), 1);

    let client_dir = TempDir::new().unwrap();
    let client_config = test_config(&client_dir, "laptop");
    let hosts = client_config.known_hosts();
    let local = hosts.initialize_hosts_file("laptop", 0).unwrap();
    hosts.add_known_host(dial_host(&server)).unwrap();
    let delivery = MeshDelivery::new(
        PeerRegistry::new(),
        hosts,
        Arc::new(Identity::generate()),
        client_config.http_transport_config(&local.id),
    );
    let alice = MessagingService::new(
        MessagingConfig::new("alice").with_local_host("laptop", local.id.clone()),
        MailboxStore::new(client_config.mailbox_dir()),
    )
    .unwrap()
    .with_delivery(Arc::new(delivery));
    let report = alice
        .send("bob@server", "heads up", "x", Priority::Normal, MessageKind::Notification)
        .await
        .unwrap();
    assert!(report.delivered, "{:?}", report.error);

    let notice = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(notice.kind, "mailbox");
    assert_eq!(notice.payload["agent"], "bob");
    assert_eq!(notice.payload["messageId"], report.message_id.as_str());
    assert_eq!(notice.payload["subject"], "heads up");

    watcher.disconnect().await;
    server.shutdown().await;
}

#[tokio::test]
async fn starting_node_registers_with_known_hosts() {
    let server_dir = TempDir::new().unwrap();
    let (_, server) = start(&server_dir, "server").await;

    let laptop_dir = TempDir::new().unwrap();
    let laptop_config = test_config(&laptop_dir, "laptop");
    let laptop = MeshNode::new(laptop_config.clone()).unwrap();
    let fingerprint = laptop.identity().fingerprint().to_string();
    let laptop_id = laptop.local_host().id.clone();
    laptop_config.known_hosts().add_known_host(dial_host(&server)).unwrap();

    let laptop = laptop.start().await.unwrap();

    let peer = server.peers().get(&fingerprint).expect("laptop registered");
    assert_eq!(peer.host_id, laptop_id);
    assert_eq!(peer.name, "laptop");
    assert_eq!(peer.address, "127.0.0.1");
    assert_eq!(peer.port, laptop.local_addr().port());
    assert_eq!(laptop.announce().await, 1);

    laptop.shutdown().await;
    server.shutdown().await;
}

#[tokio::test]
async fn node_reuses_identity_and_host_record() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir, "box");
    let first = MeshNode::new(config.clone()).unwrap();
    let second = MeshNode::new(config).unwrap();
    assert_eq!(first.local_host().id, second.local_host().id);
    assert_eq!(first.identity().fingerprint(), second.identity().fingerprint());
}

#[tokio::test]
async fn host_added_under_required_auth_is_reachable() {
    let server_dir = TempDir::new().unwrap();
    let mut server_config = test_config(&server_dir, "server");
    server_config.security.require_auth = true;
    let server = MeshNode::new(server_config.clone()).unwrap().start().await.unwrap();

    let client_dir = TempDir::new().unwrap();
    let mut client_config = test_config(&client_dir, "laptop");
    client_config.security.require_auth = true;

    run_mesh(
        MeshCommand::Add {
            address: "127.0.0.1".into(),
            port: Some(server.local_addr().port()),
            name: None,
            id: None,
        },
        &client_config,
        true,
    )
    .await
    .unwrap();

    let hosts = client_config.known_hosts();
    let added = hosts
        .find_host(&server.local_host().id)
        .unwrap()
        .expect("host recorded under its real id");
    assert_eq!(added.name, "server");
    assert_eq!(added.port, server.local_addr().port());

    run_mesh(MeshCommand::Health { timeout_ms: Some(2_000) }, &client_config, true)
        .await
        .unwrap();
    let checked = hosts.find_host(&added.id).unwrap().unwrap();
    assert_eq!(checked.status, HostStatus::Online);

    // Tokens now name the right host, so mail goes through.
    let local = hosts.initialize_hosts_file("laptop", 0).unwrap();
    let identity = Arc::new(client_config.keystore().load_or_create_identity().unwrap());
    let alice = MessagingService::new(
        MessagingConfig::new("alice").with_local_host("laptop", local.id.clone()),
        MailboxStore::new(client_config.mailbox_dir()),
    )
    .unwrap()
    .with_delivery(Arc::new(MeshDelivery::new(
        PeerRegistry::new(),
        hosts,
        identity,
        client_config.http_transport_config(&local.id),
    )));
    let report = alice
        .send("bob@server", "locked", "hi", Priority::Normal, MessageKind::Request)
        .await
        .unwrap();
    assert!(report.delivered, "{:?}", report.error);
    assert_eq!(
        MailboxStore::new(server_config.mailbox_dir())
            .list("bob", Folder::Inbox)
            .unwrap()
            .len(),
        1
    );

    server.shutdown().await;
}
