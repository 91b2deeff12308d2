//! SkillMesh Network - transports and host management for the agent mesh
//!
//! Provides everything needed to move signed envelopes between hosts:
//! - Two interchangeable transports behind the [`Transport`] trait:
//!   a persistent WebSocket and signed request/response over HTTP
//! - The mesh server answering `/message`, `/peer/register`, `/peers`,
//!   `/health` and `/ws`
//! - The durable known-hosts registry and the in-session peer registry
//! - Local-subnet and overlay-network discovery
//! - Concurrent health probing

pub mod capabilities;
pub mod discovery;
pub mod health;
pub mod hosts;
pub mod http;
pub mod peers;
pub mod server;
pub mod tailscale;
pub mod transport;
pub mod ws;

pub use capabilities::MeshCapabilities;
pub use discovery::{DiscoveryAnnouncement, DiscoveryConfig, DiscoveryResponder, MeshDiscovery};
pub use health::{
    HealthCheckOptions, HealthChecker, HealthProbe, HealthReport, HealthResult, HttpHealthProbe,
};
pub use hosts::{HostsFile, KnownHosts};
pub use http::{broadcast_to_hosts_secure, HttpTransportConfig, SecureHttpTransport};
pub use peers::{PeerEntry, PeerRegistry};
pub use server::{MeshServer, MeshServerConfig, MeshServerHandle, MessageSink};
pub use tailscale::{TailscaleClient, TailscalePeer, TailscaleStatus};
pub use transport::{HandlerRegistry, MessageHandler, Subscription, Transport};
pub use ws::{
    ClientId, ConnectionState, WebSocketConfig, WebSocketHub, WebSocketServer, WebSocketTransport,
};

use thiserror::Error;

/// Errors originating from the network layer.
///
/// Transport-class variants (`Timeout`, `Connect`, `Tls`, `Http`,
/// `Unauthorized`) are recoverable and are usually turned into result
/// values by callers rather than propagated.
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Discovery error: {0}")]
    Discovery(String),

    #[error("Internal channel closed")]
    ChannelClosed,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] skillmesh_protocol::ProtocolError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl NetworkError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, NetworkError::Timeout(_))
    }

    /// Transport-class failures: the peer may succeed on a later attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            NetworkError::Timeout(_) | NetworkError::Connect(_) | NetworkError::Transport(_) => true,
            NetworkError::Http { status, .. } => *status >= 500,
            _ => false,
        }
    }
}
