//! WebSocket transport, hub and server tests.

use std::sync::Arc;
use std::time::Duration;

use futures::SinkExt;
use serde_json::json;
use skillmesh_network::{
    ConnectionState, MeshServer, MeshServerConfig, PeerRegistry, Transport, WebSocketConfig,
    WebSocketHub, WebSocketServer, WebSocketTransport,
};
use skillmesh_protocol::{AuthManager, Host, Identity, SecurityConfig, TransportMessage};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

async fn unreachable_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("ws://{addr}/ws")
}

fn fast_config(url: String, max_attempts: u32) -> WebSocketConfig {
    WebSocketConfig {
        connect_timeout: Duration::from_millis(500),
        reconnect_interval: Duration::from_millis(50),
        max_reconnect_attempts: max_attempts,
        ..WebSocketConfig::new(url)
    }
}

async fn wait_for_clients(hub: &WebSocketHub, count: usize) {
    for _ in 0..100 {
        if hub.client_count() == count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("hub never reached {count} clients");
}

fn collector() -> (skillmesh_network::MessageHandler, mpsc::UnboundedReceiver<TransportMessage>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handler: skillmesh_network::MessageHandler = Arc::new(move |msg| {
        let _ = tx.send(msg);
    });
    (handler, rx)
}

#[tokio::test]
async fn reconnect_stops_after_bound() {
    let transport = WebSocketTransport::new(fast_config(unreachable_url().await, 2));

    assert!(transport.connect().await.is_err());
    tokio::time::sleep(Duration::from_millis(600)).await;

    // One initial dial plus two reconnects.
    assert_eq!(transport.dial_attempts(), 3);
    assert_eq!(transport.state(), ConnectionState::Disconnected);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(transport.dial_attempts(), 3, "no dials after the bound");
}

#[tokio::test]
async fn disconnect_cancels_pending_reconnect() {
    let mut config = fast_config(unreachable_url().await, 10);
    config.reconnect_interval = Duration::from_millis(150);
    let transport = WebSocketTransport::new(config);

    assert!(transport.connect().await.is_err());
    transport.disconnect().await;
    tokio::time::sleep(Duration::from_millis(500)).await;

    assert_eq!(transport.dial_attempts(), 1);
    assert_eq!(transport.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn messages_flow_both_ways_in_order() {
    let server = WebSocketServer::bind("127.0.0.1:0").await.unwrap();
    let (server_handler, mut server_rx) = collector();
    let _server_sub = server.hub().on_message(server_handler);

    let mut config = WebSocketConfig::new(server.url());
    config.local_id = "client".into();
    let transport = WebSocketTransport::new(config);
    let (client_handler, mut client_rx) = collector();
    let _client_sub = transport.on_message(client_handler);

    transport.connect().await.unwrap();
    assert_eq!(transport.state(), ConnectionState::Connected);
    assert!(transport.health_check().await);
    wait_for_clients(server.hub(), 1).await;

    for n in 0..20 {
        transport.send("/event", json!({ "n": n })).await.unwrap();
    }
    for n in 0..20 {
        let msg = tokio::time::timeout(Duration::from_secs(2), server_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg.kind, "event");
        assert_eq!(msg.from, "client");
        assert_eq!(msg.payload["n"], n);
    }

    let delivered = server
        .hub()
        .broadcast(&TransportMessage::new("notice", "server", "", json!({"hi": true})));
    assert_eq!(delivered, 1);
    let msg = tokio::time::timeout(Duration::from_secs(2), client_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(msg.kind, "notice");

    transport.disconnect().await;
    assert!(!transport.health_check().await);
    server.shutdown();
}

#[tokio::test]
async fn undecodable_frames_are_dropped_without_closing() {
    let server = WebSocketServer::bind("127.0.0.1:0").await.unwrap();
    let (handler, mut rx) = collector();
    let _sub = server.hub().on_message(handler);

    let (mut socket, _) = tokio_tungstenite::connect_async(server.url()).await.unwrap();
    socket.send(Message::Text("not json".into())).await.unwrap();
    let valid = TransportMessage::new("ping", "raw", "", json!({}));
    socket
        .send(Message::Text(serde_json::to_string(&valid).unwrap()))
        .await
        .unwrap();

    let msg = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(msg.id, valid.id);
    assert_eq!(server.hub().client_count(), 1);

    socket.close(None).await.unwrap();
    server.shutdown();
}

#[tokio::test]
async fn sends_to_closed_sockets_are_skipped() {
    let server = WebSocketServer::bind("127.0.0.1:0").await.unwrap();
    let hub = server.hub().clone();

    let (mut socket, _) = tokio_tungstenite::connect_async(server.url()).await.unwrap();
    wait_for_clients(&hub, 1).await;
    let id = hub.client_ids()[0];

    socket.close(None).await.unwrap();
    wait_for_clients(&hub, 0).await;
    drop(socket);

    let msg = TransportMessage::new("notice", "server", "", json!({}));
    assert!(!hub.send_to(id, &msg));
    assert_eq!(hub.broadcast(&msg), 0);
    server.shutdown();
}

#[tokio::test]
async fn mesh_server_ws_requires_token_when_auth_enabled() {
    let security = SecurityConfig {
        require_auth: true,
        ..SecurityConfig::development()
    };
    let mut host = Host::new("server", "127.0.0.1", 0);
    let config = MeshServerConfig::new("127.0.0.1:0", host.clone(), security.clone());
    let handle = MeshServer::new(config, Arc::new(Identity::generate()), PeerRegistry::new())
        .bind()
        .await
        .unwrap();
    host.port = handle.local_addr().port();

    let mut ws_config = WebSocketConfig::for_host(&host, security.transport, "client");
    ws_config.reconnect = false;

    let anonymous = WebSocketTransport::new(ws_config.clone());
    assert!(anonymous.connect().await.is_err());

    let auth = AuthManager::new(Arc::new(Identity::generate()), security);
    let authed = WebSocketTransport::with_auth(ws_config, auth);
    authed.connect().await.unwrap();
    assert_eq!(authed.state(), ConnectionState::Connected);

    authed.disconnect().await;
    handle.shutdown().await;
}

#[tokio::test]
async fn dropped_connection_reconnects_and_resets_attempts() {
    let server = WebSocketServer::bind("127.0.0.1:0").await.unwrap();
    let addr = server.local_addr();

    let transport = WebSocketTransport::new(fast_config(server.url(), 50));
    transport.connect().await.unwrap();
    wait_for_clients(server.hub(), 1).await;
    assert_eq!(transport.reconnect_attempts(), 0);

    // The server goes away under an open connection.
    server.shutdown();
    for _ in 0..100 {
        if transport.reconnect_attempts() >= 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(transport.reconnect_attempts() >= 2, "reconnects were scheduled");
    assert_ne!(transport.state(), ConnectionState::Connected);

    // Back on the same address.
    let mut restarted = None;
    for _ in 0..50 {
        match WebSocketServer::bind(&addr.to_string()).await {
            Ok(server) => {
                restarted = Some(server);
                break;
            }
            Err(_) => tokio::time::sleep(Duration::from_millis(20)).await,
        }
    }
    let server = restarted.expect("address free again");
    wait_for_clients(server.hub(), 1).await;
    for _ in 0..100 {
        if transport.state() == ConnectionState::Connected {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(transport.state(), ConnectionState::Connected);
    assert_eq!(transport.reconnect_attempts(), 0);
    assert!(transport.dial_attempts() >= 3);

    transport.send("/event", json!({"after": "restart"})).await.unwrap();
    transport.disconnect().await;
    server.shutdown();
}
