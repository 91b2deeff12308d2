//! The long-running node: mesh server, discovery responder and mailbox sink.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use skillmesh_mailbox::{MailboxMessage, MailboxSink, MailboxStore};
use skillmesh_network::{
    broadcast_to_hosts_secure, DiscoveryAnnouncement, DiscoveryResponder, KnownHosts, MeshServer,
    MeshServerConfig, MeshServerHandle, MessageSink, NetworkError, PeerRegistry, WebSocketHub,
};
use skillmesh_protocol::{
    kinds, Host, Identity, PeerAnnouncement, SecureTransportMessage, TransportMessage,
    PEER_REGISTER_PATH, PROTOCOL_VERSION,
};

use crate::config::MeshConfig;

/// Peers silent for longer than this are dropped from the session view.
const PEER_TTL_SECS: i64 = 600;
const PRUNE_INTERVAL: Duration = Duration::from_secs(60);
const ANNOUNCE_INTERVAL: Duration = Duration::from_secs(300);

/// Files inbound mail and tells connected `/ws` clients about it.
struct NotifyingSink {
    inner: MailboxSink,
    hub: WebSocketHub,
    local_host_id: String,
}

#[async_trait]
impl MessageSink for NotifyingSink {
    async fn deliver(&self, envelope: SecureTransportMessage) -> Result<Value, NetworkError> {
        let message = serde_json::from_value::<MailboxMessage>(envelope.message.payload.clone()).ok();
        let receipt = self.inner.deliver(envelope).await?;

        if let Some(message) = message {
            let notice = TransportMessage::new(
                kinds::MAILBOX,
                self.local_host_id.clone(),
                "*",
                json!({
                    "agent": receipt["agent"].clone(),
                    "messageId": message.id,
                    "from": receipt["from"].clone(),
                    "subject": message.subject,
                    "priority": message.priority,
                }),
            );
            let notified = self.hub.broadcast(&notice);
            tracing::debug!(message_id = %message.id, clients = notified, "Mail notification sent");
        }
        Ok(receipt)
    }
}

/// A configured node that has not started serving yet.
pub struct MeshNode {
    config: MeshConfig,
    identity: Arc<Identity>,
    hosts: KnownHosts,
    local_host: Host,
    peers: PeerRegistry,
}

impl MeshNode {
    /// Load or create the identity and the hosts file.
    pub fn new(config: MeshConfig) -> Result<Self, anyhow::Error> {
        let identity = Arc::new(config.keystore().load_or_create_identity()?);
        let hosts = config.known_hosts();
        let local_host = hosts.initialize_hosts_file(&config.node_name(), config.node.port)?;
        Ok(Self {
            config,
            identity,
            hosts,
            local_host,
            peers: PeerRegistry::new(),
        })
    }

    pub fn local_host(&self) -> &Host {
        &self.local_host
    }

    pub fn identity(&self) -> &Arc<Identity> {
        &self.identity
    }

    pub fn peers(&self) -> &PeerRegistry {
        &self.peers
    }

    /// Bind the server and the responder, then announce to known hosts.
    pub async fn start(self) -> Result<RunningNode, anyhow::Error> {
        let server_config = MeshServerConfig::new(
            self.config.bind_socket_addr(),
            self.local_host.clone(),
            self.config.security_config(),
        );
        let server = MeshServer::new(server_config, Arc::clone(&self.identity), self.peers.clone());
        let sink = NotifyingSink {
            inner: MailboxSink::new(MailboxStore::new(self.config.mailbox_dir()))
                .with_peers(self.peers.clone())
                .with_known_hosts(self.hosts.clone()),
            hub: server.hub(),
            local_host_id: self.local_host.id.clone(),
        };
        let server = server.with_sink(Arc::new(sink)).bind().await?;
        let port = server.local_addr().port();

        let responder = if self.config.discovery.responder_enabled {
            let announcement = DiscoveryAnnouncement {
                host_id: self.local_host.id.clone(),
                name: self.local_host.name.clone(),
                port,
                fingerprint: self.identity.fingerprint().to_string(),
                version: PROTOCOL_VERSION.into(),
            };
            let addr = format!("0.0.0.0:{}", self.config.discovery.port);
            match DiscoveryResponder::bind(&addr, announcement).await {
                Ok(responder) => Some(responder),
                Err(e) => {
                    tracing::warn!(addr = %addr, error = %e, "Discovery responder unavailable");
                    None
                }
            }
        } else {
            None
        };

        tracing::info!(
            host_id = %self.local_host.id,
            name = %self.local_host.name,
            fingerprint = %self.identity.fingerprint(),
            addr = %server.local_addr(),
            "Mesh node started"
        );

        let node = RunningNode {
            config: self.config,
            identity: self.identity,
            hosts: self.hosts,
            local_host: self.local_host,
            peers: self.peers,
            port,
            server,
            responder,
        };
        node.announce().await;
        Ok(node)
    }
}

/// A node serving requests in the background.
pub struct RunningNode {
    config: MeshConfig,
    identity: Arc<Identity>,
    hosts: KnownHosts,
    local_host: Host,
    peers: PeerRegistry,
    port: u16,
    server: MeshServerHandle,
    responder: Option<DiscoveryResponder>,
}

impl RunningNode {
    pub fn local_addr(&self) -> SocketAddr {
        self.server.local_addr()
    }

    pub fn local_host(&self) -> &Host {
        &self.local_host
    }

    pub fn peers(&self) -> &PeerRegistry {
        &self.peers
    }

    /// Open `/ws` connections; inbound mail notifications go to all of them.
    pub fn hub(&self) -> &WebSocketHub {
        self.server.hub()
    }

    /// Register with every known host. Unreachable hosts are skipped.
    pub async fn announce(&self) -> usize {
        let hosts = match self.hosts.list() {
            Ok(hosts) => hosts,
            Err(e) => {
                tracing::warn!(error = %e, "Cannot read known hosts; skipping announcement");
                return 0;
            }
        };
        if hosts.is_empty() {
            return 0;
        }
        let announcement = PeerAnnouncement {
            host_id: self.local_host.id.clone(),
            name: self.local_host.name.clone(),
            // The receiver fills in the address it sees us connect from.
            address: String::new(),
            port: self.port,
        };
        let payload = match serde_json::to_value(&announcement) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to encode announcement");
                return 0;
            }
        };
        let results = broadcast_to_hosts_secure(
            &hosts,
            PEER_REGISTER_PATH,
            &payload,
            Some(Arc::clone(&self.identity)),
            &self.config.http_transport_config(&self.local_host.id),
        )
        .await;
        let registered = results.values().filter(|r| r.is_ok()).count();
        tracing::info!(registered, total = hosts.len(), "Announced to known hosts");
        registered
    }

    /// Serve until `shutdown` resolves, pruning stale peers and
    /// re-announcing periodically.
    pub async fn run_until<F>(self, shutdown: F) -> Result<(), anyhow::Error>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut prune_interval = tokio::time::interval(PRUNE_INTERVAL);
        let mut announce_interval = tokio::time::interval(ANNOUNCE_INTERVAL);
        // Both intervals fire immediately; startup already announced.
        prune_interval.tick().await;
        announce_interval.tick().await;

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("Shutdown requested");
                    break;
                }
                _ = prune_interval.tick() => {
                    let pruned = self.peers.prune_older_than(chrono::Duration::seconds(PEER_TTL_SECS));
                    if pruned > 0 {
                        tracing::info!(pruned, remaining = self.peers.len(), "Pruned stale peers");
                    }
                }
                _ = announce_interval.tick() => {
                    self.announce().await;
                }
            }
        }

        self.shutdown().await;
        Ok(())
    }

    pub async fn shutdown(self) {
        if let Some(responder) = self.responder {
            responder.shutdown();
        }
        self.server.shutdown().await;
        tracing::info!(host_id = %self.local_host.id, "Mesh node stopped");
    }
}
