//! Persistent WebSocket transport and its companion server.
//!
//! Architecture:
//! - `WebSocketTransport` is the client side. It owns one socket at a time,
//!   a writer task fed by an unbounded channel (so frames leave in FIFO
//!   order) and a reader task that decodes frames into `TransportMessage`s.
//! - On close or failed dial it schedules a reconnect after a fixed
//!   interval, up to `max_reconnect_attempts` consecutive attempts. The
//!   pending reconnect is the only long-lived timer and is aborted by
//!   `disconnect()`.
//! - `WebSocketHub` is the server side: the set of open client sockets with
//!   `broadcast` and `send_to`. `WebSocketServer` serves a hub on `/ws`.
//!
//! Inbound frames that fail to decode are dropped; a bad frame never
//! tears down the connection.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{Message as ServerFrame, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, HeaderValue};
use tokio_tungstenite::tungstenite::Message as ClientFrame;

use skillmesh_protocol::{
    AuthManager, Host, TransportMessage, TransportMode, FINGERPRINT_HEADER, DEFAULT_MAX_RECONNECT_ATTEMPTS,
    DEFAULT_RECONNECT_INTERVAL_MS, DEFAULT_REQUEST_TIMEOUT_MS, WS_PATH,
};

use crate::transport::{HandlerRegistry, MessageHandler, Subscription, Transport};
use crate::NetworkError;

// ---------------------------------------------------------------------------
// Client transport
// ---------------------------------------------------------------------------

/// Lifecycle of a [`WebSocketTransport`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Configuration for a [`WebSocketTransport`].
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// Full URL, e.g. `ws://10.0.0.2:9876/ws`.
    pub url: String,
    /// Identifier placed in the `from` field of outbound messages.
    pub local_id: String,
    /// Identifier placed in the `to` field of outbound messages.
    pub peer_id: String,
    /// Bound on the opening handshake.
    pub connect_timeout: Duration,
    /// Whether to reconnect automatically after a close or failed dial.
    pub reconnect: bool,
    /// Fixed delay before each reconnect attempt.
    pub reconnect_interval: Duration,
    /// Consecutive reconnect attempts allowed before giving up.
    pub max_reconnect_attempts: u32,
}

impl WebSocketConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            local_id: String::new(),
            peer_id: String::new(),
            connect_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
            reconnect: true,
            reconnect_interval: Duration::from_millis(DEFAULT_RECONNECT_INTERVAL_MS),
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
        }
    }

    /// Configuration targeting `host`'s `/ws` endpoint.
    pub fn for_host(host: &Host, mode: TransportMode, local_id: impl Into<String>) -> Self {
        let mut config = Self::new(format!("{}://{}{}", mode.ws_scheme(), host.authority(), WS_PATH));
        config.local_id = local_id.into();
        config.peer_id = host.id.clone();
        config
    }
}

struct WsInner {
    config: WebSocketConfig,
    auth: Option<AuthManager>,
    state: Mutex<ConnectionState>,
    outbound: Mutex<Option<mpsc::UnboundedSender<ClientFrame>>>,
    handlers: HandlerRegistry,
    reconnect_attempts: AtomicU32,
    dial_attempts: AtomicU32,
    closing: AtomicBool,
    generation: AtomicU64,
    reconnect_task: Mutex<Option<JoinHandle<()>>>,
}

impl WsInner {
    fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    fn dial(self: Arc<Self>) -> BoxFuture<'static, Result<(), NetworkError>> {
        Box::pin(async move {
            self.dial_attempts.fetch_add(1, Ordering::SeqCst);
            if self.state() != ConnectionState::Reconnecting {
                self.set_state(ConnectionState::Connecting);
            }

            let request = match self.handshake_request() {
                Ok(request) => request,
                Err(e) => {
                    self.set_state(ConnectionState::Disconnected);
                    return Err(e);
                }
            };
            let handshake = tokio_tungstenite::connect_async(request);
            let stream = match tokio::time::timeout(self.config.connect_timeout, handshake).await {
                Ok(Ok((stream, _response))) => stream,
                Ok(Err(e)) => {
                    tracing::debug!(url = %self.config.url, error = %e, "WebSocket dial failed");
                    self.on_dial_failure();
                    return Err(NetworkError::Connect(e.to_string()));
                }
                Err(_) => {
                    tracing::debug!(url = %self.config.url, "WebSocket handshake timed out");
                    self.on_dial_failure();
                    return Err(NetworkError::Timeout(format!(
                        "WebSocket handshake with {} exceeded {:?}",
                        self.config.url, self.config.connect_timeout
                    )));
                }
            };

            if self.closing.load(Ordering::SeqCst) {
                self.set_state(ConnectionState::Disconnected);
                return Err(NetworkError::NotConnected);
            }

            let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
            let (mut sink, mut source) = stream.split();
            let (tx, mut rx) = mpsc::unbounded_channel::<ClientFrame>();
            *self.outbound.lock().unwrap_or_else(|e| e.into_inner()) = Some(tx);
            self.reconnect_attempts.store(0, Ordering::SeqCst);
            self.set_state(ConnectionState::Connected);
            tracing::info!(url = %self.config.url, "WebSocket connected");

            tokio::spawn(async move {
                while let Some(frame) = rx.recv().await {
                    let closing = matches!(frame, ClientFrame::Close(_));
                    if sink.send(frame).await.is_err() || closing {
                        break;
                    }
                }
                let _ = sink.close().await;
            });

            let inner = Arc::clone(&self);
            tokio::spawn(async move {
                while let Some(frame) = source.next().await {
                    match frame {
                        Ok(ClientFrame::Text(text)) => inner.handle_frame(&text),
                        Ok(ClientFrame::Binary(bytes)) => {
                            if let Ok(text) = std::str::from_utf8(&bytes) {
                                inner.handle_frame(text);
                            }
                        }
                        Ok(ClientFrame::Close(_)) => break,
                        Ok(_) => {}
                        Err(e) => {
                            tracing::debug!(url = %inner.config.url, error = %e, "WebSocket read error");
                            break;
                        }
                    }
                }
                inner.handle_close(generation);
            });

            Ok(())
        })
    }

    /// Upgrade request carrying a fresh token when auth is configured.
    fn handshake_request(
        &self,
    ) -> Result<tokio_tungstenite::tungstenite::handshake::client::Request, NetworkError> {
        let mut request = self
            .config
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| NetworkError::Connect(format!("invalid WebSocket URL: {e}")))?;
        if let Some(auth) = &self.auth {
            let token = auth.create_token(&self.config.peer_id)?;
            let bearer = HeaderValue::from_str(&token.to_header_value()?)
                .map_err(|e| NetworkError::Transport(e.to_string()))?;
            let fingerprint = HeaderValue::from_str(auth.identity().fingerprint())
                .map_err(|e| NetworkError::Transport(e.to_string()))?;
            request.headers_mut().insert(AUTHORIZATION, bearer);
            request.headers_mut().insert(FINGERPRINT_HEADER, fingerprint);
        }
        Ok(request)
    }

    fn handle_frame(&self, text: &str) {
        match serde_json::from_str::<TransportMessage>(text) {
            Ok(message) => self.handlers.dispatch(&message),
            Err(e) => tracing::debug!(error = %e, "Dropping undecodable WebSocket frame"),
        }
    }

    fn handle_close(self: &Arc<Self>, generation: u64) {
        if self.generation.load(Ordering::SeqCst) != generation {
            return;
        }
        self.outbound.lock().unwrap_or_else(|e| e.into_inner()).take();
        self.set_state(ConnectionState::Disconnected);
        if self.closing.load(Ordering::SeqCst) {
            return;
        }
        tracing::info!(url = %self.config.url, "WebSocket closed");
        self.schedule_reconnect();
    }

    fn on_dial_failure(self: &Arc<Self>) {
        self.set_state(ConnectionState::Disconnected);
        if !self.closing.load(Ordering::SeqCst) {
            self.schedule_reconnect();
        }
    }

    fn schedule_reconnect(self: &Arc<Self>) {
        if !self.config.reconnect || self.closing.load(Ordering::SeqCst) {
            return;
        }
        let attempt = self.reconnect_attempts.load(Ordering::SeqCst);
        if attempt >= self.config.max_reconnect_attempts {
            tracing::warn!(
                url = %self.config.url,
                attempts = attempt,
                "Reconnect attempts exhausted; call connect() to retry"
            );
            self.set_state(ConnectionState::Disconnected);
            return;
        }
        self.reconnect_attempts.store(attempt + 1, Ordering::SeqCst);
        self.set_state(ConnectionState::Reconnecting);

        let inner = Arc::clone(self);
        let interval = self.config.reconnect_interval;
        let task = tokio::spawn(async move {
            tokio::time::sleep(interval).await;
            if inner.closing.load(Ordering::SeqCst) {
                return;
            }
            tracing::debug!(url = %inner.config.url, attempt = attempt + 1, "Reconnecting");
            let _ = inner.dial().await;
        });
        *self.reconnect_task.lock().unwrap_or_else(|e| e.into_inner()) = Some(task);
    }

    fn cancel_reconnect(&self) {
        if let Some(task) = self.reconnect_task.lock().unwrap_or_else(|e| e.into_inner()).take() {
            task.abort();
        }
    }
}

/// Client side of the persistent duplex transport.
pub struct WebSocketTransport {
    inner: Arc<WsInner>,
}

impl WebSocketTransport {
    pub fn new(config: WebSocketConfig) -> Self {
        Self::build(config, None)
    }

    /// Transport whose handshakes carry a bearer token for `peer_id`.
    pub fn with_auth(config: WebSocketConfig, auth: AuthManager) -> Self {
        Self::build(config, Some(auth))
    }

    fn build(config: WebSocketConfig, auth: Option<AuthManager>) -> Self {
        Self {
            inner: Arc::new(WsInner {
                config,
                auth,
                state: Mutex::new(ConnectionState::Disconnected),
                outbound: Mutex::new(None),
                handlers: HandlerRegistry::new(),
                reconnect_attempts: AtomicU32::new(0),
                dial_attempts: AtomicU32::new(0),
                closing: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                reconnect_task: Mutex::new(None),
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    /// Total dials performed, initial and automatic.
    pub fn dial_attempts(&self) -> u32 {
        self.inner.dial_attempts.load(Ordering::SeqCst)
    }

    /// Consecutive reconnect attempts since the last successful connect.
    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.reconnect_attempts.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &WebSocketConfig {
        &self.inner.config
    }

    /// Queue a message on the open socket.
    pub fn send_message(&self, message: &TransportMessage) -> Result<(), NetworkError> {
        let text = serde_json::to_string(message)?;
        let outbound = self.inner.outbound.lock().unwrap_or_else(|e| e.into_inner());
        match outbound.as_ref() {
            Some(tx) => tx
                .send(ClientFrame::Text(text))
                .map_err(|_| NetworkError::NotConnected),
            None => Err(NetworkError::NotConnected),
        }
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    fn name(&self) -> &'static str {
        "websocket"
    }

    async fn connect(&self) -> Result<(), NetworkError> {
        self.inner.closing.store(false, Ordering::SeqCst);
        self.inner.cancel_reconnect();
        if self.state() == ConnectionState::Connected {
            return Ok(());
        }
        Arc::clone(&self.inner).dial().await
    }

    /// Frames `payload` as a message whose type is `path` without its
    /// leading slash. WebSocket delivery has no reply; the response is an
    /// acknowledgement carrying the message id.
    async fn send(
        &self,
        path: &str,
        payload: serde_json::Value,
    ) -> Result<serde_json::Value, NetworkError> {
        let message = TransportMessage::new(
            path.trim_start_matches('/'),
            self.inner.config.local_id.clone(),
            self.inner.config.peer_id.clone(),
            payload,
        );
        self.send_message(&message)?;
        Ok(serde_json::json!({ "id": message.id, "queued": true }))
    }

    fn on_message(&self, handler: MessageHandler) -> Subscription {
        self.inner.handlers.subscribe(handler)
    }

    async fn health_check(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    async fn disconnect(&self) {
        self.inner.closing.store(true, Ordering::SeqCst);
        self.inner.cancel_reconnect();
        if let Some(tx) = self.inner.outbound.lock().unwrap_or_else(|e| e.into_inner()).take() {
            let _ = tx.send(ClientFrame::Close(None));
        }
        self.inner.set_state(ConnectionState::Disconnected);
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        self.inner.closing.store(true, Ordering::SeqCst);
        self.inner.cancel_reconnect();
        if let Some(tx) = self.inner.outbound.lock().unwrap_or_else(|e| e.into_inner()).take() {
            let _ = tx.send(ClientFrame::Close(None));
        }
    }
}

// ---------------------------------------------------------------------------
// Server side: open-socket set
// ---------------------------------------------------------------------------

/// Identifier of a socket accepted by a [`WebSocketHub`].
pub type ClientId = u64;

struct HubInner {
    clients: Mutex<HashMap<ClientId, mpsc::UnboundedSender<ServerFrame>>>,
    next_id: AtomicU64,
    handlers: HandlerRegistry,
}

/// The set of sockets accepted by this process.
#[derive(Clone)]
pub struct WebSocketHub {
    inner: Arc<HubInner>,
}

impl WebSocketHub {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(HubInner {
                clients: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                handlers: HandlerRegistry::new(),
            }),
        }
    }

    pub fn on_message(&self, handler: MessageHandler) -> Subscription {
        self.inner.handlers.subscribe(handler)
    }

    pub fn client_count(&self) -> usize {
        self.inner.clients.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn client_ids(&self) -> Vec<ClientId> {
        let clients = self.inner.clients.lock().unwrap_or_else(|e| e.into_inner());
        let mut ids: Vec<ClientId> = clients.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Send to every open socket. Closed sockets are skipped and pruned.
    /// Returns the number of sockets the frame was queued on.
    pub fn broadcast(&self, message: &TransportMessage) -> usize {
        let text = match serde_json::to_string(message) {
            Ok(t) => t,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to encode broadcast frame");
                return 0;
            }
        };
        let mut clients = self.inner.clients.lock().unwrap_or_else(|e| e.into_inner());
        let mut delivered = 0;
        clients.retain(|_, tx| {
            let ok = tx.send(ServerFrame::Text(text.clone().into())).is_ok();
            delivered += usize::from(ok);
            ok
        });
        delivered
    }

    /// Send to one socket. Returns false if it is unknown or closed.
    pub fn send_to(&self, client: ClientId, message: &TransportMessage) -> bool {
        let Ok(text) = serde_json::to_string(message) else {
            return false;
        };
        let mut clients = self.inner.clients.lock().unwrap_or_else(|e| e.into_inner());
        match clients.get(&client) {
            Some(tx) => {
                if tx.send(ServerFrame::Text(text.into())).is_ok() {
                    true
                } else {
                    clients.remove(&client);
                    false
                }
            }
            None => false,
        }
    }

    /// Ask every client to close and forget them.
    pub fn close_all(&self) {
        let mut clients = self.inner.clients.lock().unwrap_or_else(|e| e.into_inner());
        for (_, tx) in clients.drain() {
            let _ = tx.send(ServerFrame::Close(None));
        }
    }

    /// Drive one accepted socket until it closes.
    pub async fn handle_socket(self, socket: WebSocket) {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let (mut sink, mut stream) = socket.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<ServerFrame>();
        self.inner
            .clients
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, tx);
        tracing::debug!(client = id, "WebSocket client connected");

        let writer = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                let closing = matches!(frame, ServerFrame::Close(_));
                if sink.send(frame).await.is_err() || closing {
                    break;
                }
            }
        });

        while let Some(frame) = stream.next().await {
            match frame {
                Ok(ServerFrame::Text(text)) => self.handle_frame(id, text.as_str()),
                Ok(ServerFrame::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!(client = id, error = %e, "WebSocket client error");
                    break;
                }
            }
        }

        self.inner
            .clients
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
        writer.abort();
        tracing::debug!(client = id, "WebSocket client disconnected");
    }

    fn handle_frame(&self, client: ClientId, text: &str) {
        match serde_json::from_str::<TransportMessage>(text) {
            Ok(message) => self.inner.handlers.dispatch(&message),
            Err(e) => tracing::debug!(client, error = %e, "Dropping undecodable WebSocket frame"),
        }
    }

    /// Router exposing this hub on `/ws`.
    pub fn router(&self) -> Router {
        Router::new()
            .route(WS_PATH, get(upgrade))
            .with_state(self.clone())
    }
}

impl Default for WebSocketHub {
    fn default() -> Self {
        Self::new()
    }
}

async fn upgrade(ws: WebSocketUpgrade, State(hub): State<WebSocketHub>) -> Response {
    ws.on_upgrade(move |socket| hub.handle_socket(socket))
}

/// Standalone server exposing a [`WebSocketHub`] on `/ws`.
pub struct WebSocketServer {
    hub: WebSocketHub,
    local_addr: SocketAddr,
    task: JoinHandle<()>,
}

impl WebSocketServer {
    pub async fn bind(addr: &str) -> Result<Self, NetworkError> {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let hub = WebSocketHub::new();
        let router = hub.router();
        let task = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router).await {
                tracing::error!(error = %e, "WebSocket server error");
            }
        });
        tracing::info!(addr = %local_addr, "WebSocket server listening");
        Ok(Self {
            hub,
            local_addr,
            task,
        })
    }

    pub fn hub(&self) -> &WebSocketHub {
        &self.hub
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn url(&self) -> String {
        format!("ws://{}{}", self.local_addr, WS_PATH)
    }

    pub fn shutdown(self) {
        self.hub.close_all();
        self.task.abort();
    }
}
