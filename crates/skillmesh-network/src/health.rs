//! Concurrent health probing of known hosts.
//!
//! Each host gets its own probe bounded by its own timeout; all probes run
//! at once and the report waits for every one of them to settle. This is
//! the only place a host's online/offline status is decided.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;

use skillmesh_protocol::{Host, HostStatus, Identity, DEFAULT_HEALTH_TIMEOUT_MS};

use crate::http::{HttpTransportConfig, SecureHttpTransport};
use crate::NetworkError;

/// One way of asking a host whether it is alive.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self, host: &Host) -> Result<(), NetworkError>;
}

/// Probes `GET /health` through a [`SecureHttpTransport`].
pub struct HttpHealthProbe {
    identity: Option<Arc<Identity>>,
    config: HttpTransportConfig,
}

impl HttpHealthProbe {
    pub fn new(identity: Option<Arc<Identity>>, mut config: HttpTransportConfig) -> Self {
        // The checker owns the deadline; a probe is a single attempt.
        config.retries = 0;
        Self { identity, config }
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn probe(&self, host: &Host) -> Result<(), NetworkError> {
        let transport = SecureHttpTransport::new(host.clone(), self.identity.clone(), self.config.clone())?;
        transport.health().await.map(|_| ())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct HealthCheckOptions {
    /// Deadline for each individual probe.
    pub timeout: Duration,
}

impl Default for HealthCheckOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(DEFAULT_HEALTH_TIMEOUT_MS),
        }
    }
}

/// Outcome of probing one host.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResult {
    pub host_id: String,
    pub host_name: String,
    pub status: HostStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// The probe hit its deadline rather than failing outright.
    pub timed_out: bool,
    pub checked_at: DateTime<Utc>,
}

/// Results for a set of hosts, in input order.
#[derive(Debug, Clone, Default, Serialize)]
pub struct HealthReport {
    pub results: Vec<HealthResult>,
}

impl HealthReport {
    pub fn online_count(&self) -> usize {
        self.results
            .iter()
            .filter(|r| r.status == HostStatus::Online)
            .count()
    }

    pub fn total(&self) -> usize {
        self.results.len()
    }

    pub fn all_online(&self) -> bool {
        self.online_count() == self.total()
    }

    pub fn offline(&self) -> impl Iterator<Item = &HealthResult> {
        self.results.iter().filter(|r| r.status != HostStatus::Online)
    }
}

impl std::fmt::Display for HealthReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{} hosts online", self.online_count(), self.total())
    }
}

pub struct HealthChecker {
    probe: Arc<dyn HealthProbe>,
}

impl HealthChecker {
    pub fn new(probe: Arc<dyn HealthProbe>) -> Self {
        Self { probe }
    }

    /// Checker probing over signed HTTP.
    pub fn http(identity: Option<Arc<Identity>>, config: HttpTransportConfig) -> Self {
        Self::new(Arc::new(HttpHealthProbe::new(identity, config)))
    }

    pub async fn check_host(&self, host: &Host, options: &HealthCheckOptions) -> HealthResult {
        let start = Instant::now();
        let outcome = tokio::time::timeout(options.timeout, self.probe.probe(host)).await;
        let elapsed = start.elapsed().as_millis() as u64;

        let (status, latency_ms, error, timed_out) = match outcome {
            Ok(Ok(())) => (HostStatus::Online, Some(elapsed), None, false),
            Ok(Err(e)) => {
                let timed_out = e.is_timeout();
                (HostStatus::Offline, None, Some(e.to_string()), timed_out)
            }
            Err(_) => {
                let e = NetworkError::Timeout(format!(
                    "no response within {}ms",
                    options.timeout.as_millis()
                ));
                (HostStatus::Offline, None, Some(e.to_string()), true)
            }
        };
        tracing::debug!(
            host = %host.name,
            status = %status,
            latency_ms = ?latency_ms,
            error = ?error,
            "Health probe finished"
        );

        HealthResult {
            host_id: host.id.clone(),
            host_name: host.name.clone(),
            status,
            latency_ms,
            error,
            timed_out,
            checked_at: Utc::now(),
        }
    }

    /// Probe every host concurrently and wait for all of them.
    pub async fn check_all_hosts_health(&self, hosts: &[Host], options: &HealthCheckOptions) -> HealthReport {
        let probes = hosts.iter().map(|host| self.check_host(host, options));
        let results = join_all(probes).await;
        let report = HealthReport { results };
        tracing::info!(online = report.online_count(), total = report.total(), "Health check complete");
        report
    }
}
