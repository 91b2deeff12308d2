//! Signed HTTP transport against a live mesh server.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use skillmesh_network::{
    broadcast_to_hosts_secure, HttpTransportConfig, MeshServer, MeshServerConfig,
    MeshServerHandle, MessageSink, NetworkError, PeerRegistry, SecureHttpTransport, Transport,
};
use skillmesh_protocol::{
    Host, Identity, PeerAnnouncement, SecureTransportMessage, SecurityConfig, TransportMessage,
    MESSAGE_PATH, PEER_REGISTER_PATH,
};
use tokio::net::TcpListener;

struct EchoSink;

#[async_trait]
impl MessageSink for EchoSink {
    async fn deliver(&self, envelope: SecureTransportMessage) -> Result<Value, NetworkError> {
        Ok(json!({
            "accepted": true,
            "id": envelope.message.id,
            "from": envelope.sender_fingerprint,
            "payload": envelope.message.payload,
        }))
    }
}

/// Fails its first delivery, then accepts.
#[derive(Default)]
struct FlakySink {
    calls: AtomicUsize,
}

#[async_trait]
impl MessageSink for FlakySink {
    async fn deliver(&self, envelope: SecureTransportMessage) -> Result<Value, NetworkError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            return Err(NetworkError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "disk full",
            )));
        }
        Ok(json!({ "accepted": true, "id": envelope.message.id }))
    }
}

struct Node {
    handle: MeshServerHandle,
    host: Host,
    peers: PeerRegistry,
}

async fn spawn_node(name: &str, security: SecurityConfig) -> Node {
    let identity = Arc::new(Identity::generate());
    let mut host = Host::new(name, "127.0.0.1", 0);
    let peers = PeerRegistry::new();
    let config = MeshServerConfig::new("127.0.0.1:0", host.clone(), security);
    let handle = MeshServer::new(config, identity, peers.clone())
        .with_sink(Arc::new(EchoSink))
        .bind()
        .await
        .unwrap();
    host.port = handle.local_addr().port();
    Node {
        handle,
        host,
        peers,
    }
}

fn auth_required() -> SecurityConfig {
    SecurityConfig {
        require_auth: true,
        ..SecurityConfig::development()
    }
}

fn client_config(security: SecurityConfig) -> HttpTransportConfig {
    HttpTransportConfig {
        local_host_id: "client-host".into(),
        security,
        ..HttpTransportConfig::default()
    }
}

async fn unreachable_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

#[tokio::test]
async fn signed_message_reaches_sink() {
    let node = spawn_node("server", SecurityConfig::development()).await;
    let identity = Arc::new(Identity::generate());
    let transport = SecureHttpTransport::new(
        node.host.clone(),
        Some(identity.clone()),
        client_config(SecurityConfig::development()),
    )
    .unwrap();

    let response = transport.send(MESSAGE_PATH, json!({"hello": "world"})).await.unwrap();
    assert_eq!(response["accepted"], true);
    assert_eq!(response["from"], identity.fingerprint());
    assert_eq!(response["payload"]["hello"], "world");
    assert!(transport.health_check().await);

    node.handle.shutdown().await;
}

#[tokio::test]
async fn unsigned_envelope_is_rejected() {
    let node = spawn_node("server", SecurityConfig::development()).await;
    let transport =
        SecureHttpTransport::new(node.host.clone(), None, client_config(SecurityConfig::development()))
            .unwrap();

    let err = transport.send(MESSAGE_PATH, json!({})).await.unwrap_err();
    assert!(matches!(err, NetworkError::Unauthorized(_)), "got {err:?}");

    node.handle.shutdown().await;
}

#[tokio::test]
async fn tampered_payload_is_rejected() {
    let node = spawn_node("server", SecurityConfig::development()).await;
    let identity = Identity::generate();
    let message = TransportMessage::new("mailbox", "a", node.host.id.clone(), json!({"n": 1}));
    let mut envelope = SecureTransportMessage::seal(message, &identity).unwrap();
    envelope.message.payload = json!({"n": 2});

    let response = reqwest::Client::new()
        .post(format!("http://{}{}", node.host.authority(), MESSAGE_PATH))
        .json(&envelope)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 401);

    node.handle.shutdown().await;
}

#[tokio::test]
async fn replayed_envelope_is_rejected() {
    let node = spawn_node("server", SecurityConfig::development()).await;
    let identity = Arc::new(Identity::generate());
    let transport = SecureHttpTransport::new(
        node.host.clone(),
        Some(identity.clone()),
        client_config(SecurityConfig::development()),
    )
    .unwrap();

    let message = TransportMessage::new("mailbox", "client-host", node.host.id.clone(), json!({}));
    let envelope = SecureTransportMessage::seal(message, &identity).unwrap();
    transport.post_envelope(MESSAGE_PATH, &envelope).await.unwrap();

    let err = transport.post_envelope(MESSAGE_PATH, &envelope).await.unwrap_err();
    assert!(matches!(err, NetworkError::Http { status: 409, .. }), "got {err:?}");

    node.handle.shutdown().await;
}

#[tokio::test]
async fn auth_required_checks_token_target() {
    let node = spawn_node("server", auth_required()).await;
    let identity = Arc::new(Identity::generate());

    let good = SecureHttpTransport::new(
        node.host.clone(),
        Some(identity.clone()),
        client_config(auth_required()),
    )
    .unwrap();
    assert!(good.send(MESSAGE_PATH, json!({})).await.is_ok());

    // Same address, but the token names another host.
    let mut wrong_target = node.host.clone();
    wrong_target.id = "some-other-host".into();
    let wrong = SecureHttpTransport::new(wrong_target, Some(identity), client_config(auth_required()))
        .unwrap();
    let err = wrong.send(MESSAGE_PATH, json!({})).await.unwrap_err();
    assert!(matches!(err, NetworkError::Unauthorized(_)), "got {err:?}");

    node.handle.shutdown().await;
}

#[tokio::test]
async fn untrusted_issuer_is_rejected() {
    let mut security = auth_required();
    security.trusted_fingerprints = vec![Identity::generate().fingerprint().to_string()];
    let node = spawn_node("server", security).await;

    let transport = SecureHttpTransport::new(
        node.host.clone(),
        Some(Arc::new(Identity::generate())),
        client_config(auth_required()),
    )
    .unwrap();
    let err = transport.health().await.unwrap_err();
    assert!(matches!(err, NetworkError::Unauthorized(_)), "got {err:?}");

    node.handle.shutdown().await;
}

#[tokio::test]
async fn peer_registration_is_listed() {
    let node = spawn_node("server", SecurityConfig::development()).await;
    let identity = Arc::new(Identity::generate());
    let transport = SecureHttpTransport::new(
        node.host.clone(),
        Some(identity.clone()),
        client_config(SecurityConfig::development()),
    )
    .unwrap();

    let announcement = PeerAnnouncement {
        host_id: "client-host".into(),
        name: "laptop".into(),
        address: String::new(),
        port: 9876,
    };
    let response = transport
        .send(PEER_REGISTER_PATH, serde_json::to_value(&announcement).unwrap())
        .await
        .unwrap();
    assert_eq!(response["registered"], true);
    assert_eq!(response["hostId"], node.host.id);

    let peers = transport.peers().await.unwrap();
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].fingerprint, identity.fingerprint());
    assert_eq!(peers[0].address, "127.0.0.1");
    assert_eq!(node.peers.resolve("laptop").unwrap().host_id, "client-host");

    let health = transport.health().await.unwrap();
    assert_eq!(health.host_id, node.host.id);

    node.handle.shutdown().await;
}

#[tokio::test]
async fn broadcast_reports_partial_failure() {
    let n1 = spawn_node("h1", SecurityConfig::development()).await;
    let n3 = spawn_node("h3", SecurityConfig::development()).await;
    let h2 = Host::new("h2", "127.0.0.1", unreachable_port().await);

    let hosts = vec![n1.host.clone(), h2.clone(), n3.host.clone()];
    let config = HttpTransportConfig {
        retries: 0,
        ..client_config(SecurityConfig::development())
    };
    let results = broadcast_to_hosts_secure(
        &hosts,
        MESSAGE_PATH,
        &json!({"broadcast": true}),
        Some(Arc::new(Identity::generate())),
        &config,
    )
    .await;

    assert_eq!(results.len(), 3);
    assert!(results[&n1.host.id].is_ok());
    assert!(results[&n3.host.id].is_ok());
    let err = results[&h2.id].as_ref().unwrap_err();
    assert!(matches!(err, NetworkError::Connect(_)), "got {err:?}");

    n1.handle.shutdown().await;
    n3.handle.shutdown().await;
}

#[tokio::test]
async fn retry_after_server_failure_succeeds() {
    let identity = Arc::new(Identity::generate());
    let mut host = Host::new("flaky", "127.0.0.1", 0);
    let sink = Arc::new(FlakySink::default());
    let config = MeshServerConfig::new("127.0.0.1:0", host.clone(), SecurityConfig::development());
    let handle = MeshServer::new(config, identity, PeerRegistry::new())
        .with_sink(sink.clone())
        .bind()
        .await
        .unwrap();
    host.port = handle.local_addr().port();

    let client_identity = Arc::new(Identity::generate());
    let transport = SecureHttpTransport::new(
        host.clone(),
        Some(client_identity.clone()),
        HttpTransportConfig {
            retries: 2,
            retry_backoff: Duration::from_millis(10),
            ..client_config(SecurityConfig::development())
        },
    )
    .unwrap();

    let message = TransportMessage::new("mailbox", "client-host", host.id.clone(), json!({"n": 1}));
    let envelope = SecureTransportMessage::seal(message, &client_identity).unwrap();
    let response = transport.post_envelope(MESSAGE_PATH, &envelope).await.unwrap();
    assert_eq!(response["accepted"], true);
    assert_eq!(response["id"], envelope.message.id);
    assert_eq!(sink.calls.load(Ordering::SeqCst), 2);

    handle.shutdown().await;
}

#[tokio::test]
async fn extreme_timestamp_is_rejected_without_killing_the_server() {
    let node = spawn_node("server", SecurityConfig::development()).await;
    let identity = Arc::new(Identity::generate());

    let mut message = TransportMessage::new("mailbox", "client-host", node.host.id.clone(), json!({}));
    message.timestamp = i64::MIN;
    let envelope = SecureTransportMessage::seal(message, &identity).unwrap();
    let response = reqwest::Client::new()
        .post(format!("http://{}{}", node.host.authority(), MESSAGE_PATH))
        .json(&envelope)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 409);

    let transport = SecureHttpTransport::new(
        node.host.clone(),
        Some(identity),
        client_config(SecurityConfig::development()),
    )
    .unwrap();
    assert!(transport.send(MESSAGE_PATH, json!({})).await.is_ok());

    node.handle.shutdown().await;
}

#[tokio::test]
async fn health_answers_a_caller_that_does_not_know_the_host_id() {
    let node = spawn_node("server", auth_required()).await;
    let identity = Arc::new(Identity::generate());

    // What `mesh add` has before its first health check: an address and a fresh id.
    let candidate = Host::new("candidate", "127.0.0.1", node.host.port);
    assert_ne!(candidate.id, node.host.id);
    let transport =
        SecureHttpTransport::new(candidate, Some(identity.clone()), client_config(auth_required()))
            .unwrap();
    let health = transport.health().await.unwrap();
    assert_eq!(health.host_id, node.host.id);
    assert_eq!(health.name, "server");

    // Everything else still needs a token for this host.
    let err = transport.peers().await.unwrap_err();
    assert!(matches!(err, NetworkError::Unauthorized(_)), "got {err:?}");
    let err = transport.send(MESSAGE_PATH, json!({})).await.unwrap_err();
    assert!(matches!(err, NetworkError::Unauthorized(_)), "got {err:?}");

    // No token at all is still refused.
    let anonymous = SecureHttpTransport::new(node.host.clone(), None, client_config(auth_required()))
        .unwrap();
    assert!(matches!(anonymous.health().await, Err(NetworkError::Unauthorized(_))));

    node.handle.shutdown().await;
}
