//! Configuration loading from TOML and environment variables.
//!
//! The node and the commands read their configuration from:
//! 1. A TOML config file (default: ~/.skillkit/mesh/config.toml)
//! 2. Environment variables (override TOML values)
//! 3. Command-line flags (override both, applied by the binary)
//!
//! Environment variable prefix: SKILLKIT_

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use skillmesh_network::{
    DiscoveryConfig, HealthCheckOptions, HttpTransportConfig, KnownHosts, WebSocketConfig,
};
use skillmesh_protocol::{
    Host, Keystore, SecurityConfig, TransportMode, AGENT_ID_ENV, DEFAULT_DISCOVERY_PORT,
    DEFAULT_HEALTH_TIMEOUT_MS, DEFAULT_HTTP_RETRIES, DEFAULT_MAX_RECONNECT_ATTEMPTS,
    DEFAULT_MESH_PORT, DEFAULT_RECONNECT_INTERVAL_MS, DEFAULT_REQUEST_TIMEOUT_MS,
    DEFAULT_TOKEN_TTL_SECS,
};

const CONFIG_FILE_NAME: &str = "config.toml";

/// Top-level mesh configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MeshConfig {
    /// This node's name and listening address.
    #[serde(default)]
    pub node: NodeConfig,
    /// Authentication and TLS profile.
    #[serde(default)]
    pub security: SecuritySection,
    /// Subnet and overlay discovery.
    #[serde(default)]
    pub discovery: DiscoverySection,
    #[serde(default)]
    pub health: HealthSection,
    /// Client-side transport tuning.
    #[serde(default)]
    pub transport: TransportSection,
    #[serde(default)]
    pub messaging: MessagingSection,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Name announced to peers. Defaults to the machine's hostname.
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "default_mesh_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecuritySection {
    #[serde(default)]
    pub require_auth: bool,
    /// `"none"` or `"tls"`.
    #[serde(default)]
    pub transport: TransportMode,
    #[serde(default)]
    pub allow_self_signed: bool,
    #[serde(default = "default_token_ttl")]
    pub token_ttl_secs: i64,
    #[serde(default)]
    pub trusted_fingerprints: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoverySection {
    #[serde(default = "default_discovery_port")]
    pub port: u16,
    #[serde(default = "default_broadcast_addr")]
    pub broadcast_addr: String,
    /// Answer discovery probes while the node runs.
    #[serde(default = "default_true")]
    pub responder_enabled: bool,
    #[serde(default = "default_true")]
    pub tailscale_enabled: bool,
    #[serde(default = "default_tailscale_bin")]
    pub tailscale_bin: String,
    #[serde(default = "default_discovery_timeout")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSection {
    #[serde(default = "default_health_timeout")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportSection {
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_retries")]
    pub retries: u32,
    #[serde(default = "default_reconnect_interval")]
    pub reconnect_interval_ms: u64,
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagingSection {
    /// Agent whose mailbox the `message` commands act on.
    #[serde(default = "default_agent_id")]
    pub agent_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Holds the identity, the hosts file and the mailboxes.
    /// Defaults to ~/.skillkit/mesh.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "skillmesh_network=debug").
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Whether to output JSON-formatted logs.
    #[serde(default)]
    pub json_format: bool,
}

// -- Defaults --

fn default_bind_addr() -> String {
    "0.0.0.0".to_string()
}
fn default_mesh_port() -> u16 {
    DEFAULT_MESH_PORT
}
fn default_token_ttl() -> i64 {
    DEFAULT_TOKEN_TTL_SECS
}
fn default_discovery_port() -> u16 {
    DEFAULT_DISCOVERY_PORT
}
fn default_broadcast_addr() -> String {
    "255.255.255.255".to_string()
}
fn default_true() -> bool {
    true
}
fn default_tailscale_bin() -> String {
    "tailscale".to_string()
}
fn default_discovery_timeout() -> u64 {
    3_000
}
fn default_health_timeout() -> u64 {
    DEFAULT_HEALTH_TIMEOUT_MS
}
fn default_request_timeout() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_MS
}
fn default_retries() -> u32 {
    DEFAULT_HTTP_RETRIES
}
fn default_reconnect_interval() -> u64 {
    DEFAULT_RECONNECT_INTERVAL_MS
}
fn default_max_reconnect_attempts() -> u32 {
    DEFAULT_MAX_RECONNECT_ATTEMPTS
}
fn default_agent_id() -> String {
    "default".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

// -- Trait impls --

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: None,
            bind_addr: default_bind_addr(),
            port: default_mesh_port(),
        }
    }
}

impl Default for SecuritySection {
    fn default() -> Self {
        Self {
            require_auth: false,
            transport: TransportMode::None,
            allow_self_signed: false,
            token_ttl_secs: default_token_ttl(),
            trusted_fingerprints: Vec::new(),
        }
    }
}

impl Default for DiscoverySection {
    fn default() -> Self {
        Self {
            port: default_discovery_port(),
            broadcast_addr: default_broadcast_addr(),
            responder_enabled: true,
            tailscale_enabled: true,
            tailscale_bin: default_tailscale_bin(),
            timeout_ms: default_discovery_timeout(),
        }
    }
}

impl Default for HealthSection {
    fn default() -> Self {
        Self {
            timeout_ms: default_health_timeout(),
        }
    }
}

impl Default for TransportSection {
    fn default() -> Self {
        Self {
            request_timeout_ms: default_request_timeout(),
            retries: default_retries(),
            reconnect_interval_ms: default_reconnect_interval(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
        }
    }
}

impl Default for MessagingSection {
    fn default() -> Self {
        Self {
            agent_id: default_agent_id(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json_format: false,
        }
    }
}

impl MeshConfig {
    /// Default config file location: `~/.skillkit/mesh/config.toml`.
    pub fn default_path() -> Option<PathBuf> {
        Keystore::default_dir().map(|dir| dir.join(CONFIG_FILE_NAME))
    }

    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)?;
        let config: MeshConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load configuration with environment variable overrides.
    ///
    /// An explicit `path` that does not exist falls back to defaults; without
    /// one the default location is tried silently. Loading runs before
    /// logging is set up, so problems that did not stop it come back as
    /// warnings for the caller to log.
    pub fn load(path: Option<&Path>) -> Result<(Self, Vec<String>), anyhow::Error> {
        let mut warnings = Vec::new();
        let mut config = match path {
            Some(path) if path.exists() => Self::from_file(path)?,
            Some(path) => {
                warnings.push(format!(
                    "config file {} not found, using defaults",
                    path.display()
                ));
                Self::default()
            }
            None => match Self::default_path() {
                Some(default) if default.exists() => Self::from_file(&default)?,
                _ => Self::default(),
            },
        };

        warnings.extend(config.apply_env_overrides());

        Ok((config, warnings))
    }

    /// Apply `SKILLKIT_*` environment variable overrides.
    pub fn apply_env_overrides(&mut self) -> Vec<String> {
        self.apply_overrides_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary variable source. Returns a warning
    /// per value that was ignored.
    pub fn apply_overrides_from<F>(&mut self, var: F) -> Vec<String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut warnings = Vec::new();
        if let Some(val) = var(AGENT_ID_ENV) {
            self.messaging.agent_id = val;
        }
        if let Some(val) = var("SKILLKIT_MESH_DIR") {
            self.paths.data_dir = Some(PathBuf::from(val));
        }
        if let Some(val) = var("SKILLKIT_MESH_PORT") {
            match val.parse() {
                Ok(port) => self.node.port = port,
                Err(_) => warnings.push(format!("ignoring invalid SKILLKIT_MESH_PORT '{val}'")),
            }
        }
        if let Some(val) = var("SKILLKIT_HOST_NAME") {
            self.node.name = Some(val);
        }
        if let Some(val) = var("SKILLKIT_REQUIRE_AUTH") {
            self.security.require_auth = val == "true" || val == "1";
        }
        if let Some(val) = var("SKILLKIT_LOG_LEVEL") {
            self.logging.level = val;
        }
        warnings
    }

    /// Directory holding the identity, hosts file and mailboxes.
    pub fn data_dir(&self) -> PathBuf {
        self.paths
            .data_dir
            .clone()
            .or_else(Keystore::default_dir)
            .unwrap_or_else(|| PathBuf::from(".skillkit").join("mesh"))
    }

    pub fn keystore(&self) -> Keystore {
        Keystore::new(self.data_dir())
    }

    pub fn known_hosts(&self) -> KnownHosts {
        KnownHosts::in_dir(&self.data_dir())
    }

    pub fn mailbox_dir(&self) -> PathBuf {
        self.data_dir().join("mailboxes")
    }

    /// Name for this node: configured, else the machine's hostname.
    pub fn node_name(&self) -> String {
        self.node
            .name
            .clone()
            .or_else(|| std::env::var("HOSTNAME").ok())
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| "skillmesh-node".to_string())
    }

    pub fn bind_socket_addr(&self) -> String {
        format!("{}:{}", self.node.bind_addr, self.node.port)
    }

    pub fn security_config(&self) -> SecurityConfig {
        SecurityConfig {
            require_auth: self.security.require_auth,
            transport: self.security.transport,
            allow_self_signed: self.security.allow_self_signed,
            token_ttl_secs: self.security.token_ttl_secs,
            trusted_fingerprints: self.security.trusted_fingerprints.clone(),
        }
    }

    /// Client transport settings for requests sent on behalf of `local_host_id`.
    pub fn http_transport_config(&self, local_host_id: &str) -> HttpTransportConfig {
        HttpTransportConfig {
            local_host_id: local_host_id.to_string(),
            security: self.security_config(),
            timeout: Duration::from_millis(self.transport.request_timeout_ms),
            retries: self.transport.retries,
            ..HttpTransportConfig::default()
        }
    }

    /// Persistent link to `host`'s `/ws` endpoint with the configured
    /// reconnect policy.
    pub fn websocket_config(&self, host: &Host, local_id: &str) -> WebSocketConfig {
        let mut config = WebSocketConfig::for_host(host, self.security.transport, local_id);
        config.connect_timeout = Duration::from_millis(self.transport.request_timeout_ms);
        config.reconnect_interval = Duration::from_millis(self.transport.reconnect_interval_ms);
        config.max_reconnect_attempts = self.transport.max_reconnect_attempts;
        config
    }

    pub fn health_options(&self) -> HealthCheckOptions {
        HealthCheckOptions {
            timeout: Duration::from_millis(self.health.timeout_ms),
        }
    }

    pub fn discovery_config(&self, local_host_id: &str) -> DiscoveryConfig {
        DiscoveryConfig {
            port: self.discovery.port,
            broadcast_addr: self.discovery.broadcast_addr.clone(),
            local_host_id: local_host_id.to_string(),
        }
    }

    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_millis(self.discovery.timeout_ms)
    }
}
