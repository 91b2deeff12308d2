//! Mesh server: the HTTP and WebSocket endpoints every node exposes.
//!
//! Routes:
//! - `POST /message` - verified envelope handed to the [`MessageSink`]
//! - `POST /peer/register` - verified announcement recorded in the peer registry
//! - `GET /peers` - the session peer list
//! - `GET /health` - liveness plus local identity
//! - `/ws` - WebSocket upgrade into the node's [`WebSocketHub`]
//!
//! Every POST body must be a `SecureTransportMessage` that passes
//! envelope verification and the replay guard. When the security profile
//! requires auth, every route also needs a bearer token issued for this
//! host (on `/health`, a valid token for any host), and on POST routes the
//! token issuer must be the envelope sender.
//! Rejections happen before any handler or sink sees the message.

use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::body::Bytes;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, State};
use axum::http::{header::AUTHORIZATION, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use skillmesh_protocol::{
    AuthManager, AuthToken, HealthResponse, Host, Identity, PeerAnnouncement, ProtocolError,
    SecureTransportMessage, SecurityConfig, TokenRejection, FINGERPRINT_HEADER, HEALTH_PATH,
    MESSAGE_PATH, PEERS_PATH, PEER_REGISTER_PATH, PROTOCOL_VERSION, REPLAY_WINDOW_SECS, WS_PATH,
};

use crate::peers::{PeerEntry, PeerRegistry};
use crate::ws::WebSocketHub;
use crate::NetworkError;

/// Receiver of verified `/message` envelopes.
#[async_trait]
pub trait MessageSink: Send + Sync {
    /// Accept one envelope. The returned value is sent back as the
    /// response body; `NetworkError::NotFound` becomes a 404.
    async fn deliver(&self, envelope: SecureTransportMessage) -> Result<Value, NetworkError>;
}

#[derive(Debug, Clone)]
pub struct MeshServerConfig {
    pub bind_addr: String,
    /// This node's own host record; its id is the token audience.
    pub local_host: Host,
    pub security: SecurityConfig,
    /// Envelopes older than this are refused.
    pub replay_window: Duration,
    /// Upper bound on remembered nonces.
    pub nonce_cache_capacity: usize,
}

impl MeshServerConfig {
    pub fn new(bind_addr: impl Into<String>, local_host: Host, security: SecurityConfig) -> Self {
        Self {
            bind_addr: bind_addr.into(),
            local_host,
            security,
            replay_window: Duration::from_secs(REPLAY_WINDOW_SECS as u64),
            nonce_cache_capacity: 10_000,
        }
    }
}

/// Remembers recent nonces so a captured envelope cannot be replayed.
struct ReplayGuard {
    seen: HashSet<String>,
    order: VecDeque<(i64, String)>,
    window_ms: i64,
    capacity: usize,
}

impl ReplayGuard {
    fn new(window: Duration, capacity: usize) -> Self {
        Self {
            seen: HashSet::new(),
            order: VecDeque::new(),
            window_ms: window.as_millis() as i64,
            capacity: capacity.max(1),
        }
    }

    fn check(&mut self, nonce: &str, timestamp_ms: i64, now_ms: i64) -> Result<(), &'static str> {
        // The timestamp is chosen by the sender; it may sit at either end of i64.
        if now_ms.saturating_sub(timestamp_ms) > self.window_ms {
            return Err("envelope is older than the replay window");
        }
        if timestamp_ms.saturating_sub(now_ms) > self.window_ms {
            return Err("envelope timestamp is in the future");
        }
        while let Some((seen_at, _)) = self.order.front() {
            if now_ms.saturating_sub(*seen_at) <= self.window_ms {
                break;
            }
            if let Some((_, old)) = self.order.pop_front() {
                self.seen.remove(&old);
            }
        }
        if self.seen.contains(nonce) {
            return Err("nonce already used");
        }
        self.seen.insert(nonce.to_string());
        self.order.push_back((now_ms, nonce.to_string()));
        while self.order.len() > self.capacity {
            if let Some((_, old)) = self.order.pop_front() {
                self.seen.remove(&old);
            }
        }
        Ok(())
    }
}

struct ServerState {
    config: MeshServerConfig,
    identity: Arc<Identity>,
    auth: AuthManager,
    peers: PeerRegistry,
    sink: Option<Arc<dyn MessageSink>>,
    replay: Mutex<ReplayGuard>,
    hub: WebSocketHub,
    started: Instant,
}

/// Builder for the node's HTTP/WebSocket endpoint.
pub struct MeshServer {
    config: MeshServerConfig,
    identity: Arc<Identity>,
    peers: PeerRegistry,
    sink: Option<Arc<dyn MessageSink>>,
    hub: WebSocketHub,
}

impl MeshServer {
    pub fn new(config: MeshServerConfig, identity: Arc<Identity>, peers: PeerRegistry) -> Self {
        Self {
            config,
            identity,
            peers,
            sink: None,
            hub: WebSocketHub::new(),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn MessageSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// The socket set behind `/ws`.
    pub fn hub(&self) -> WebSocketHub {
        self.hub.clone()
    }

    pub fn router(self) -> Router {
        let state = Arc::new(ServerState {
            auth: AuthManager::new(Arc::clone(&self.identity), self.config.security.clone()),
            replay: Mutex::new(ReplayGuard::new(
                self.config.replay_window,
                self.config.nonce_cache_capacity,
            )),
            config: self.config,
            identity: self.identity,
            peers: self.peers,
            sink: self.sink,
            hub: self.hub,
            started: Instant::now(),
        });

        Router::new()
            .route(MESSAGE_PATH, post(handle_message))
            .route(PEER_REGISTER_PATH, post(handle_peer_register))
            .route(PEERS_PATH, get(handle_peers))
            .route(HEALTH_PATH, get(handle_health))
            .route(WS_PATH, get(handle_ws))
            .with_state(state)
    }

    /// Bind and serve in the background.
    pub async fn bind(self) -> Result<MeshServerHandle, NetworkError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        let local_addr = listener.local_addr()?;
        let hub = self.hub.clone();
        let router = self.router();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            let service = router.into_make_service_with_connect_info::<SocketAddr>();
            let result = axum::serve(listener, service)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await;
            if let Err(e) = result {
                tracing::error!(error = %e, "Mesh server error");
            }
        });
        tracing::info!(addr = %local_addr, "Mesh server listening");

        Ok(MeshServerHandle {
            local_addr,
            hub,
            shutdown_tx: Some(shutdown_tx),
            task,
        })
    }

    /// Serve in the foreground until `shutdown` resolves.
    pub async fn serve<F>(self, shutdown: F) -> Result<(), NetworkError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        tracing::info!(addr = %listener.local_addr()?, "Mesh server listening");
        let hub = self.hub.clone();
        let service = self.router().into_make_service_with_connect_info::<SocketAddr>();
        axum::serve(listener, service)
            .with_graceful_shutdown(async move {
                shutdown.await;
                hub.close_all();
            })
            .await?;
        Ok(())
    }
}

/// A mesh server running in the background.
pub struct MeshServerHandle {
    local_addr: SocketAddr,
    hub: WebSocketHub,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl MeshServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn hub(&self) -> &WebSocketHub {
        &self.hub
    }

    pub async fn shutdown(mut self) {
        self.hub.close_all();
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if tokio::time::timeout(Duration::from_secs(5), &mut self.task).await.is_err() {
            self.task.abort();
        }
    }
}

// ---------------------------------------------------------------------------
// Request gates
// ---------------------------------------------------------------------------

fn reject(status: StatusCode, reason: impl Into<String>) -> Response {
    (status, Json(json!({ "error": reason.into() }))).into_response()
}

fn bearer_token(headers: &HeaderMap) -> Result<AuthToken, TokenRejection> {
    let header = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or(TokenRejection::Missing)?;
    let encoded = header
        .strip_prefix("Bearer ")
        .ok_or_else(|| TokenRejection::Malformed("expected 'Bearer <token>'".into()))?;
    AuthToken::decode(encoded).map_err(|e| TokenRejection::Malformed(e.to_string()))
}

/// Which host a bearer token must be issued for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TokenScope {
    /// Issued for this node's host id.
    LocalHost,
    /// Any host id. `/health` uses this so a caller that has not learned
    /// our id yet can still identify us.
    AnyHost,
}

/// Token check for routes without an envelope. Returns the issuer
/// fingerprint when a valid token was presented.
fn check_token(
    state: &ServerState,
    headers: &HeaderMap,
    scope: TokenScope,
) -> Result<Option<String>, Response> {
    if !state.auth.require_auth() {
        return Ok(None);
    }
    let token = match bearer_token(headers) {
        Ok(token) => token,
        Err(reason) => {
            tracing::warn!(reason = %reason, "Rejected request without usable token");
            return Err(reject(StatusCode::UNAUTHORIZED, reason.to_string()));
        }
    };
    let expected = match scope {
        TokenScope::LocalHost => state.config.local_host.id.as_str(),
        TokenScope::AnyHost => token.subject_host_id.as_str(),
    };
    if let Err(reason) = state.auth.validate_token(&token, expected).into_result() {
        tracing::warn!(reason = %reason, issuer = %token.issuer_fingerprint, "Rejected token");
        return Err(reject(StatusCode::UNAUTHORIZED, reason.to_string()));
    }
    Ok(Some(token.issuer_fingerprint))
}

/// Full gate for POST routes: decode, verify, authorize, replay check.
fn admit_envelope(
    state: &ServerState,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<SecureTransportMessage, Response> {
    let envelope: SecureTransportMessage = serde_json::from_slice(body).map_err(|e| {
        tracing::warn!(error = %e, "Rejected undecodable envelope");
        reject(StatusCode::BAD_REQUEST, format!("invalid envelope: {e}"))
    })?;

    if let Err(reason) = envelope.verify() {
        tracing::warn!(
            reason = %reason,
            sender = %envelope.sender_fingerprint,
            message_id = %envelope.message.id,
            "Rejected envelope"
        );
        return Err(reject(StatusCode::UNAUTHORIZED, reason.to_string()));
    }

    if let Some(claimed) = headers.get(FINGERPRINT_HEADER).and_then(|v| v.to_str().ok()) {
        if claimed != envelope.sender_fingerprint {
            tracing::warn!(header = %claimed, sender = %envelope.sender_fingerprint, "Fingerprint header mismatch");
            return Err(reject(StatusCode::UNAUTHORIZED, "fingerprint header does not match sender"));
        }
    }

    if let Some(issuer) = check_token(state, headers, TokenScope::LocalHost)? {
        if issuer != envelope.sender_fingerprint {
            tracing::warn!(issuer = %issuer, sender = %envelope.sender_fingerprint, "Token issuer is not the sender");
            return Err(reject(StatusCode::UNAUTHORIZED, "token issuer does not match sender"));
        }
    }

    let now_ms = Utc::now().timestamp_millis();
    let replay = state
        .replay
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .check(&envelope.nonce, envelope.message.timestamp, now_ms);
    if let Err(reason) = replay {
        tracing::warn!(reason, message_id = %envelope.message.id, "Rejected replayed envelope");
        return Err(reject(StatusCode::CONFLICT, reason));
    }

    Ok(envelope)
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn handle_message(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let envelope = match admit_envelope(&state, &headers, &body) {
        Ok(envelope) => envelope,
        Err(response) => return response,
    };
    state.peers.mark_seen(&envelope.sender_fingerprint);

    let Some(sink) = state.sink.clone() else {
        return reject(StatusCode::SERVICE_UNAVAILABLE, "no message sink configured");
    };
    let message_id = envelope.message.id.clone();
    match sink.deliver(envelope).await {
        Ok(value) => Json(value).into_response(),
        Err(NetworkError::NotFound(what)) => reject(StatusCode::NOT_FOUND, what),
        Err(NetworkError::Protocol(ProtocolError::InvalidMessage(why))) => {
            reject(StatusCode::BAD_REQUEST, why)
        }
        Err(e) => {
            tracing::warn!(message_id = %message_id, error = %e, "Message sink failed");
            reject(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

async fn handle_peer_register(
    State(state): State<Arc<ServerState>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let envelope = match admit_envelope(&state, &headers, &body) {
        Ok(envelope) => envelope,
        Err(response) => return response,
    };
    let mut announcement: PeerAnnouncement = match serde_json::from_value(envelope.message.payload.clone()) {
        Ok(a) => a,
        Err(e) => return reject(StatusCode::BAD_REQUEST, format!("invalid announcement: {e}")),
    };
    if announcement.address.is_empty() || announcement.address == "0.0.0.0" {
        announcement.address = remote.ip().to_string();
    }

    let entry = PeerEntry::from_announcement(envelope.sender_fingerprint.clone(), &announcement);
    tracing::info!(
        peer = %entry.name,
        fingerprint = %entry.fingerprint,
        address = %entry.address,
        "Peer registered"
    );
    state.peers.upsert(entry);

    Json(json!({
        "registered": true,
        "hostId": state.config.local_host.id,
        "name": state.config.local_host.name,
        "fingerprint": state.identity.fingerprint(),
    }))
    .into_response()
}

async fn handle_peers(State(state): State<Arc<ServerState>>, headers: HeaderMap) -> Response {
    if let Err(response) = check_token(&state, &headers, TokenScope::LocalHost) {
        return response;
    }
    Json(state.peers.infos()).into_response()
}

async fn handle_health(State(state): State<Arc<ServerState>>, headers: HeaderMap) -> Response {
    if let Err(response) = check_token(&state, &headers, TokenScope::AnyHost) {
        return response;
    }
    Json(HealthResponse {
        status: "ok".into(),
        host_id: state.config.local_host.id.clone(),
        name: state.config.local_host.name.clone(),
        fingerprint: state.identity.fingerprint().to_string(),
        version: PROTOCOL_VERSION.into(),
        uptime_secs: state.started.elapsed().as_secs(),
    })
    .into_response()
}

async fn handle_ws(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    if let Err(response) = check_token(&state, &headers, TokenScope::LocalHost) {
        return response;
    }
    let hub = state.hub.clone();
    ws.on_upgrade(move |socket| hub.handle_socket(socket))
}
