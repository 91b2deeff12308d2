//! Signed request/response transport over HTTP(S).
//!
//! Every outbound call builds a `TransportMessage`, seals it into a
//! `SecureTransportMessage` with a fresh nonce and attaches a bearer token
//! scoped to the target host plus the sender fingerprint header. Calls are
//! bounded by a timeout and retried on transport-class failures, each retry
//! under a fresh nonce.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::join_all;
use reqwest::header::AUTHORIZATION;
use serde_json::Value;

use skillmesh_protocol::{
    kinds, AuthManager, HealthResponse, Host, Identity, PeerInfo, SecureTransportMessage,
    SecurityConfig, TransportMessage, DEFAULT_HTTP_RETRIES, DEFAULT_REQUEST_TIMEOUT_MS,
    FINGERPRINT_HEADER, HEALTH_PATH, MESSAGE_PATH, PEERS_PATH, PEER_REGISTER_PATH,
};

use crate::transport::{HandlerRegistry, MessageHandler, Subscription, Transport};
use crate::NetworkError;

/// Client-side settings shared by every [`SecureHttpTransport`].
#[derive(Debug, Clone)]
pub struct HttpTransportConfig {
    /// Host id placed in the `from` field of outbound envelopes.
    pub local_host_id: String,
    pub security: SecurityConfig,
    /// Bound on each individual attempt.
    pub timeout: Duration,
    /// Extra attempts after the first on retryable failures.
    pub retries: u32,
    /// Base delay between attempts; grows linearly.
    pub retry_backoff: Duration,
}

impl Default for HttpTransportConfig {
    fn default() -> Self {
        Self {
            local_host_id: String::new(),
            security: SecurityConfig::development(),
            timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
            retries: DEFAULT_HTTP_RETRIES,
            retry_backoff: Duration::from_millis(200),
        }
    }
}

/// Signed request/response transport to one remote host.
pub struct SecureHttpTransport {
    target: Host,
    base_url: String,
    config: HttpTransportConfig,
    client: reqwest::Client,
    identity: Option<Arc<Identity>>,
    auth: Option<AuthManager>,
    handlers: HandlerRegistry,
}

impl SecureHttpTransport {
    /// Build a transport to `target`. Without an identity envelopes go out
    /// unsigned and without a token; verifying receivers refuse them.
    pub fn new(
        target: Host,
        identity: Option<Arc<Identity>>,
        config: HttpTransportConfig,
    ) -> Result<Self, NetworkError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .danger_accept_invalid_certs(config.security.accept_invalid_certs())
            .build()
            .map_err(|e| NetworkError::Tls(format!("failed to build HTTP client: {e}")))?;
        let base_url = format!(
            "{}://{}",
            config.security.transport.http_scheme(),
            target.authority()
        );
        let auth = identity
            .as_ref()
            .map(|id| AuthManager::new(Arc::clone(id), config.security.clone()));
        Ok(Self {
            target,
            base_url,
            config,
            client,
            identity,
            auth,
            handlers: HandlerRegistry::new(),
        })
    }

    pub fn target(&self) -> &Host {
        &self.target
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Seal `payload` as a message of type `kind` and POST it to `path`.
    pub async fn send_typed(&self, path: &str, kind: &str, payload: Value) -> Result<Value, NetworkError> {
        let message = TransportMessage::new(
            kind,
            self.config.local_host_id.clone(),
            self.target.id.clone(),
            payload,
        );
        let envelope = self.seal(message)?;
        self.post_envelope(path, &envelope).await
    }

    /// POST an already sealed envelope.
    ///
    /// The first attempt sends `envelope` as given. Each retry reseals the
    /// same message under a fresh nonce, since the receiver has already
    /// spent the earlier one; receivers dedupe on the message id.
    pub async fn post_envelope(
        &self,
        path: &str,
        envelope: &SecureTransportMessage,
    ) -> Result<Value, NetworkError> {
        let url = self.url(path);
        let mut attempt = 0;
        let mut resealed: Option<SecureTransportMessage> = None;
        loop {
            let body = resealed.as_ref().unwrap_or(envelope);
            let request = self.with_headers(self.client.post(&url))?.json(body);
            match self.execute(request).await {
                Ok(value) => {
                    if let Ok(message) = serde_json::from_value::<TransportMessage>(value.clone()) {
                        self.handlers.dispatch(&message);
                    }
                    return Ok(value);
                }
                Err(e) if e.is_retryable() && attempt < self.config.retries => {
                    attempt += 1;
                    tracing::debug!(
                        url = %url,
                        attempt,
                        message_id = %envelope.message.id,
                        error = %e,
                        "Retrying mesh request"
                    );
                    tokio::time::sleep(self.config.retry_backoff * attempt).await;
                    resealed = Some(self.seal(envelope.message.clone())?);
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn seal(&self, message: TransportMessage) -> Result<SecureTransportMessage, NetworkError> {
        Ok(match &self.identity {
            Some(identity) => SecureTransportMessage::seal(message, identity)?,
            None => SecureTransportMessage::unsigned(message),
        })
    }

    /// `GET /health` on the target.
    pub async fn health(&self) -> Result<HealthResponse, NetworkError> {
        let value = self.get(HEALTH_PATH).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// `GET /peers` on the target.
    pub async fn peers(&self) -> Result<Vec<PeerInfo>, NetworkError> {
        let value = self.get(PEERS_PATH).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Round-trip latency of one health request, in milliseconds.
    pub async fn ping(&self) -> Result<u64, NetworkError> {
        let start = Instant::now();
        self.health().await?;
        Ok(start.elapsed().as_millis() as u64)
    }

    async fn get(&self, path: &str) -> Result<Value, NetworkError> {
        let request = self.with_headers(self.client.get(self.url(path)))?;
        self.execute(request).await
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }

    fn with_headers(
        &self,
        mut request: reqwest::RequestBuilder,
    ) -> Result<reqwest::RequestBuilder, NetworkError> {
        if let Some(identity) = &self.identity {
            request = request.header(FINGERPRINT_HEADER, identity.fingerprint());
        }
        if let Some(auth) = &self.auth {
            let token = auth.create_token(&self.target.id)?;
            request = request.header(AUTHORIZATION, token.to_header_value()?);
        }
        Ok(request)
    }

    async fn execute(&self, request: reqwest::RequestBuilder) -> Result<Value, NetworkError> {
        let response = request.send().await.map_err(classify_reqwest_error)?;
        let status = response.status();
        let body = response.text().await.map_err(classify_reqwest_error)?;

        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(NetworkError::Unauthorized(body));
        }
        if !status.is_success() {
            return Err(NetworkError::Http {
                status: status.as_u16(),
                body,
            });
        }
        if body.trim().is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&body)?)
    }
}

/// Map a `reqwest` failure onto the transport error taxonomy.
fn classify_reqwest_error(e: reqwest::Error) -> NetworkError {
    if e.is_timeout() {
        return NetworkError::Timeout(e.to_string());
    }
    let detail = error_chain(&e);
    let lower = detail.to_lowercase();
    if lower.contains("certificate") || lower.contains("tls") || lower.contains("handshake") {
        return NetworkError::Tls(detail);
    }
    if e.is_connect() {
        return NetworkError::Connect(detail);
    }
    NetworkError::Transport(detail)
}

fn error_chain(e: &dyn std::error::Error) -> String {
    let mut out = e.to_string();
    let mut source = e.source();
    while let Some(inner) = source {
        out.push_str(": ");
        out.push_str(&inner.to_string());
        source = inner.source();
    }
    out
}

fn kind_for_path(path: &str) -> &str {
    match path {
        MESSAGE_PATH => kinds::MAILBOX,
        PEER_REGISTER_PATH => kinds::PEER_REGISTER,
        other => other.trim_start_matches('/'),
    }
}

#[async_trait]
impl Transport for SecureHttpTransport {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn connect(&self) -> Result<(), NetworkError> {
        self.health().await.map(|_| ())
    }

    async fn send(&self, path: &str, payload: Value) -> Result<Value, NetworkError> {
        self.send_typed(path, kind_for_path(path), payload).await
    }

    /// Handlers see response bodies that decode as a `TransportMessage`.
    fn on_message(&self, handler: MessageHandler) -> Subscription {
        self.handlers.subscribe(handler)
    }

    async fn health_check(&self) -> bool {
        match self.health().await {
            Ok(_) => true,
            Err(e) => {
                tracing::debug!(host = %self.target.name, error = %e, "Health check failed");
                false
            }
        }
    }

    async fn disconnect(&self) {}
}

/// POST `payload` to `path` on every host concurrently.
///
/// Returns one entry per host id: the response or the error that host
/// produced. One host failing never affects the others.
pub async fn broadcast_to_hosts_secure(
    hosts: &[Host],
    path: &str,
    payload: &Value,
    identity: Option<Arc<Identity>>,
    config: &HttpTransportConfig,
) -> HashMap<String, Result<Value, NetworkError>> {
    let sends = hosts.iter().map(|host| {
        let identity = identity.clone();
        let payload = payload.clone();
        async move {
            let result = match SecureHttpTransport::new(host.clone(), identity, config.clone()) {
                Ok(transport) => transport.send(path, payload).await,
                Err(e) => Err(e),
            };
            if let Err(e) = &result {
                tracing::debug!(host = %host.name, error = %e, "Broadcast to host failed");
            }
            (host.id.clone(), result)
        }
    });
    join_all(sends).await.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use skillmesh_protocol::TransportMode;

    #[test]
    fn test_base_url_follows_transport_mode() {
        let host = Host::new("box", "10.0.0.2", 9876);
        let plain = SecureHttpTransport::new(host.clone(), None, HttpTransportConfig::default()).unwrap();
        assert_eq!(plain.base_url(), "http://10.0.0.2:9876");

        let mut config = HttpTransportConfig::default();
        config.security.transport = TransportMode::Tls;
        let tls = SecureHttpTransport::new(host, None, config).unwrap();
        assert_eq!(tls.base_url(), "https://10.0.0.2:9876");
        assert_eq!(tls.url("health"), "https://10.0.0.2:9876/health");
    }

    #[test]
    fn test_kind_for_path() {
        assert_eq!(kind_for_path("/message"), "mailbox");
        assert_eq!(kind_for_path("/peer/register"), "peer-register");
        assert_eq!(kind_for_path("/custom"), "custom");
    }
}
