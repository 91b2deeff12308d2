/// Default TCP port a mesh node serves HTTP and WebSocket traffic on.
pub const DEFAULT_MESH_PORT: u16 = 9876;

/// Default UDP port used for local-subnet discovery probes.
pub const DEFAULT_DISCOVERY_PORT: u16 = 9877;

/// Default lifetime of an issued bearer token, in seconds (1 hour).
pub const DEFAULT_TOKEN_TTL_SECS: i64 = 3600;

/// Clock skew tolerated when a token's issue time lies in the future.
pub const TOKEN_CLOCK_SKEW_SECS: i64 = 30;

/// Envelopes older than this are rejected as possible replays.
pub const REPLAY_WINDOW_SECS: i64 = 300;

/// Header carrying the sender fingerprint on HTTP requests.
pub const FINGERPRINT_HEADER: &str = "X-SkillKit-Fingerprint";

/// WebSocket endpoint path.
pub const WS_PATH: &str = "/ws";

/// HTTP endpoint paths.
pub const MESSAGE_PATH: &str = "/message";
pub const PEER_REGISTER_PATH: &str = "/peer/register";
pub const PEERS_PATH: &str = "/peers";
pub const HEALTH_PATH: &str = "/health";

/// Protocol version string advertised in health responses and discovery.
pub const PROTOCOL_VERSION: &str = "skillmesh/1.0";

/// Version of the on-disk identity file format.
pub const IDENTITY_FILE_VERSION: u32 = 1;

/// Number of SHA-256 bytes kept in a fingerprint (32 hex characters).
pub const FINGERPRINT_BYTES: usize = 16;

/// Characters shown when a fingerprint is abbreviated for display.
pub const SHORT_FINGERPRINT_LEN: usize = 8;

/// Upper bound on host and message ids accepted from peers.
pub const MAX_WIRE_ID_LEN: usize = 128;

/// Default per-request timeout for transports, in milliseconds.
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 10_000;

/// Default timeout for a single health probe, in milliseconds.
pub const DEFAULT_HEALTH_TIMEOUT_MS: u64 = 5_000;

/// Default number of retries after a failed HTTP request.
pub const DEFAULT_HTTP_RETRIES: u32 = 2;

/// Default delay between WebSocket reconnect attempts, in milliseconds.
pub const DEFAULT_RECONNECT_INTERVAL_MS: u64 = 5_000;

/// Default bound on consecutive WebSocket reconnect attempts.
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;

/// Environment variable selecting the default mailbox agent.
pub const AGENT_ID_ENV: &str = "SKILLKIT_AGENT_ID";
