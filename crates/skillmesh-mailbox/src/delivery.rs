//! Moving mailbox messages between hosts.
//!
//! Outbound: [`MeshDelivery`] resolves the recipient's host through the
//! in-session peer registry first, then the known-hosts file, and POSTs the
//! message as a signed envelope to that host's `/message` endpoint.
//!
//! Inbound: [`MailboxSink`] is the mesh server's `MessageSink`; it files
//! verified mailbox envelopes into the addressed local agent's inbox.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use skillmesh_network::{
    HttpTransportConfig, KnownHosts, MessageSink, NetworkError, PeerRegistry, SecureHttpTransport,
    Transport,
};
use skillmesh_protocol::{kinds, Host, Identity, ProtocolError, SecureTransportMessage, MESSAGE_PATH};

use crate::message::{DeliveryReport, MailboxMessage, MessageStatus, Recipient};
use crate::store::{validate_agent_id, Folder, MailboxStore};

/// Carries a message to an agent on another host.
///
/// Failures are reported in the returned [`DeliveryReport`], never raised.
#[async_trait]
pub trait Delivery: Send + Sync {
    async fn deliver(&self, recipient: &Recipient, message: &MailboxMessage) -> DeliveryReport;
}

/// Delivery over signed HTTP to the recipient host's mesh server.
pub struct MeshDelivery {
    peers: PeerRegistry,
    hosts: KnownHosts,
    identity: Arc<Identity>,
    config: HttpTransportConfig,
}

impl MeshDelivery {
    pub fn new(
        peers: PeerRegistry,
        hosts: KnownHosts,
        identity: Arc<Identity>,
        config: HttpTransportConfig,
    ) -> Self {
        Self {
            peers,
            hosts,
            identity,
            config,
        }
    }

    /// Session peers first, then the durable registry.
    pub fn resolve_host(&self, query: &str) -> Option<Host> {
        if let Some(peer) = self.peers.resolve(query) {
            return Some(peer.to_host());
        }
        match self.hosts.find_host(query) {
            Ok(found) => found,
            Err(e) => {
                tracing::debug!(query, error = %e, "Known-hosts lookup failed");
                None
            }
        }
    }
}

#[async_trait]
impl Delivery for MeshDelivery {
    async fn deliver(&self, recipient: &Recipient, message: &MailboxMessage) -> DeliveryReport {
        let Some(host_query) = recipient.host.as_deref() else {
            return DeliveryReport::failed(&message.id, "none", "recipient has no host part");
        };
        let Some(host) = self.resolve_host(host_query) else {
            return DeliveryReport::failed(&message.id, "none", format!("unknown host '{host_query}'"));
        };

        let transport = match SecureHttpTransport::new(
            host.clone(),
            Some(Arc::clone(&self.identity)),
            self.config.clone(),
        ) {
            Ok(t) => t,
            Err(e) => return DeliveryReport::failed(&message.id, "http", e.to_string()),
        };
        let payload = match serde_json::to_value(message) {
            Ok(p) => p,
            Err(e) => return DeliveryReport::failed(&message.id, "http", e.to_string()),
        };

        match transport.send(MESSAGE_PATH, payload).await {
            Ok(_) => {
                tracing::info!(message_id = %message.id, host = %host.name, "Message delivered");
                DeliveryReport::delivered(&message.id, transport.name())
            }
            Err(e) => {
                tracing::warn!(message_id = %message.id, host = %host.name, error = %e, "Message delivery failed");
                DeliveryReport::failed(&message.id, transport.name(), e.to_string())
            }
        }
    }
}

/// Files verified inbound mailbox envelopes into local inboxes.
///
/// The host part of a message's `from` address must name the host that
/// signed the envelope: its envelope host id, or a name or id bound to the
/// signing fingerprint by a peer announcement or a known-hosts record.
/// Anything else is rewritten to the best verified name before filing.
pub struct MailboxSink {
    store: MailboxStore,
    peers: Option<PeerRegistry>,
    hosts: Option<KnownHosts>,
}

impl MailboxSink {
    pub fn new(store: MailboxStore) -> Self {
        Self {
            store,
            peers: None,
            hosts: None,
        }
    }

    /// Accept the names peers registered under with this node.
    pub fn with_peers(mut self, peers: PeerRegistry) -> Self {
        self.peers = Some(peers);
        self
    }

    /// Accept the names of known hosts whose fingerprint is on record.
    pub fn with_known_hosts(mut self, hosts: KnownHosts) -> Self {
        self.hosts = Some(hosts);
        self
    }

    /// Names the signer of `envelope` may use for itself, preferred first.
    fn sender_names(&self, envelope: &SecureTransportMessage) -> Vec<String> {
        let fingerprint = envelope.sender_fingerprint.as_str();
        let mut names = Vec::new();
        if let Some(peer) = self.peers.as_ref().and_then(|p| p.get(fingerprint)) {
            names.push(peer.name);
            names.push(peer.host_id);
        }
        if let Some(hosts) = &self.hosts {
            match hosts.list() {
                Ok(hosts) => {
                    for host in hosts {
                        if host.fingerprint.as_deref() == Some(fingerprint) {
                            names.push(host.name);
                            names.push(host.id);
                        }
                    }
                }
                Err(e) => tracing::debug!(error = %e, "Known-hosts lookup failed"),
            }
        }
        names.push(envelope.message.from.clone());
        names
    }

    /// `from` as filed: kept when its host part names the signer, else
    /// re-addressed to the signer's preferred name.
    fn verified_sender(
        &self,
        envelope: &SecureTransportMessage,
        from: &str,
    ) -> Result<String, NetworkError> {
        let sender = Recipient::parse(from).map_err(|_| {
            ProtocolError::InvalidMessage(format!("invalid sender address '{from}'"))
        })?;
        let names = self.sender_names(envelope);
        if let Some(host) = sender.host.as_deref() {
            if names.iter().any(|name| name == host) {
                return Ok(from.to_string());
            }
        }
        // `names` always ends with the envelope host id.
        let preferred = names.first().cloned().unwrap_or_default();
        let rewritten = format!("{}@{}", sender.agent, preferred);
        tracing::warn!(
            claimed = %from,
            filed_as = %rewritten,
            sender = %envelope.sender_fingerprint,
            "Sender address does not name the signing host"
        );
        Ok(rewritten)
    }
}

fn storage_error(e: crate::MailboxError) -> NetworkError {
    NetworkError::Io(std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
}

#[async_trait]
impl MessageSink for MailboxSink {
    async fn deliver(&self, envelope: SecureTransportMessage) -> Result<Value, NetworkError> {
        if envelope.message.kind != kinds::MAILBOX {
            return Err(ProtocolError::InvalidMessage(format!(
                "unsupported message type '{}'",
                envelope.message.kind
            ))
            .into());
        }
        let mut message: MailboxMessage = serde_json::from_value(envelope.message.payload.clone())?;
        message.from = self.verified_sender(&envelope, &message.from)?;
        let recipient = Recipient::parse(&message.to)
            .map_err(|_| NetworkError::NotFound(format!("recipient '{}'", message.to)))?;
        validate_agent_id(&recipient.agent)
            .map_err(|_| NetworkError::NotFound(format!("agent '{}'", recipient.agent)))?;

        let already_filed = self
            .store
            .get(&recipient.agent, Folder::Inbox, &message.id)
            .map_err(storage_error)?
            .is_some()
            || self
                .store
                .get(&recipient.agent, Folder::Archive, &message.id)
                .map_err(storage_error)?
                .is_some();
        if !already_filed {
            message.status = MessageStatus::Unread;
            self.store
                .put(&recipient.agent, Folder::Inbox, &message)
                .map_err(storage_error)?;
            tracing::info!(
                message_id = %message.id,
                agent = %recipient.agent,
                sender = %envelope.sender_fingerprint,
                "Inbound message filed"
            );
        }

        Ok(json!({
            "delivered": true,
            "messageId": message.id,
            "agent": recipient.agent,
            "from": message.from,
        }))
    }
}
