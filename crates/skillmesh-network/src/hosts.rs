//! Durable known-hosts registry.
//!
//! The file is a JSON document `{localHost, hosts}` rewritten atomically on
//! every mutation. Status fields are only written from health results; the
//! registry never infers reachability on its own.

use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use skillmesh_protocol::fsutil::{create_exclusive, ensure_private_dir, write_atomic};
use skillmesh_protocol::{Host, HostStatus};

use crate::health::HealthResult;
use crate::NetworkError;

const HOSTS_FILE_NAME: &str = "hosts.json";

/// On-disk shape of the known-hosts file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostsFile {
    pub local_host: Host,
    #[serde(default)]
    pub hosts: Vec<Host>,
}

/// Handle on the known-hosts file. Every call re-reads the file so that
/// concurrent CLI invocations see each other's changes.
#[derive(Debug, Clone)]
pub struct KnownHosts {
    path: PathBuf,
}

impl KnownHosts {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `hosts.json` inside the mesh data directory.
    pub fn in_dir(dir: &Path) -> Self {
        Self::new(dir.join(HOSTS_FILE_NAME))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Create the local host record on first run; return the existing one
    /// afterwards. Concurrent first runs agree on a single record.
    pub fn initialize_hosts_file(&self, name: &str, port: u16) -> Result<Host, NetworkError> {
        if self.exists() {
            return Ok(self.load()?.local_host);
        }
        if let Some(parent) = self.path.parent() {
            ensure_private_dir(parent)?;
        }
        let local = Host {
            status: HostStatus::Online,
            last_seen: Some(Utc::now()),
            ..Host::new(name, "0.0.0.0", port)
        };
        let file = HostsFile {
            local_host: local,
            hosts: Vec::new(),
        };
        let bytes = serde_json::to_vec_pretty(&file)?;
        if create_exclusive(&self.path, &bytes, None)? {
            tracing::info!(path = %self.path.display(), host_id = %file.local_host.id, "Created hosts file");
            Ok(file.local_host)
        } else {
            Ok(self.load()?.local_host)
        }
    }

    /// Read the whole file. Missing file is a typed not-found.
    pub fn load(&self) -> Result<HostsFile, NetworkError> {
        let bytes = match std::fs::read(&self.path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(NetworkError::NotFound(format!(
                    "hosts file {} not initialized",
                    self.path.display()
                )));
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_slice(&bytes)?)
    }

    fn save(&self, file: &HostsFile) -> Result<(), NetworkError> {
        let bytes = serde_json::to_vec_pretty(file)?;
        write_atomic(&self.path, &bytes, None)?;
        Ok(())
    }

    pub fn local_host(&self) -> Result<Host, NetworkError> {
        Ok(self.load()?.local_host)
    }

    pub fn list(&self) -> Result<Vec<Host>, NetworkError> {
        Ok(self.load()?.hosts)
    }

    /// Add a host, or refresh the entry with the same id or the same
    /// address and port. An existing entry keeps its id.
    pub fn add_known_host(&self, host: Host) -> Result<Host, NetworkError> {
        let mut file = self.load()?;
        let existing = file
            .hosts
            .iter()
            .position(|h| h.id == host.id)
            .or_else(|| {
                file.hosts
                    .iter()
                    .position(|h| h.address == host.address && h.port == host.port)
            });

        let stored = match existing {
            Some(index) => {
                let entry = &mut file.hosts[index];
                entry.name = host.name;
                entry.address = host.address;
                entry.port = host.port;
                if host.tailscale_ip.is_some() {
                    entry.tailscale_ip = host.tailscale_ip;
                }
                if host.fingerprint.is_some() {
                    entry.fingerprint = host.fingerprint;
                }
                entry.clone()
            }
            None => {
                file.hosts.push(host.clone());
                host
            }
        };
        self.save(&file)?;
        tracing::debug!(host_id = %stored.id, name = %stored.name, "Known host saved");
        Ok(stored)
    }

    /// Remove the host matching `query` by exact id, then id prefix, then
    /// exact name. The first match wins.
    pub fn remove_known_host(&self, query: &str) -> Result<Host, NetworkError> {
        let mut file = self.load()?;
        let index = resolve_index(&file.hosts, query)
            .ok_or_else(|| NetworkError::NotFound(format!("no host matches '{query}'")))?;
        let removed = file.hosts.remove(index);
        self.save(&file)?;
        tracing::info!(host_id = %removed.id, name = %removed.name, "Known host removed");
        Ok(removed)
    }

    /// Look up a host with the same resolution order as removal.
    pub fn find_host(&self, query: &str) -> Result<Option<Host>, NetworkError> {
        let file = self.load()?;
        Ok(resolve_index(&file.hosts, query).map(|i| file.hosts[i].clone()))
    }

    /// Record probe outcomes. Hosts absent from `results` are untouched and
    /// `last_seen` only advances for hosts found online.
    pub fn apply_health(&self, results: &[HealthResult]) -> Result<usize, NetworkError> {
        let mut file = self.load()?;
        let mut updated = 0;
        for result in results {
            if let Some(host) = file.hosts.iter_mut().find(|h| h.id == result.host_id) {
                host.status = result.status;
                if result.status == HostStatus::Online {
                    host.last_seen = Some(result.checked_at);
                }
                updated += 1;
            }
        }
        if updated > 0 {
            self.save(&file)?;
        }
        Ok(updated)
    }
}

fn resolve_index(hosts: &[Host], query: &str) -> Option<usize> {
    if query.is_empty() {
        return None;
    }
    hosts
        .iter()
        .position(|h| h.id == query)
        .or_else(|| hosts.iter().position(|h| h.id.starts_with(query)))
        .or_else(|| hosts.iter().position(|h| h.name == query))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn registry() -> (TempDir, KnownHosts) {
        let dir = TempDir::new().unwrap();
        let hosts = KnownHosts::in_dir(dir.path());
        hosts.initialize_hosts_file("local", 9876).unwrap();
        (dir, hosts)
    }

    #[test]
    fn test_initialize_is_idempotent() {
        let (_dir, hosts) = registry();
        let first = hosts.local_host().unwrap();
        let again = hosts.initialize_hosts_file("other-name", 1234).unwrap();
        assert_eq!(first.id, again.id);
        assert_eq!(again.name, "local");
    }

    #[test]
    fn test_load_before_init_is_not_found() {
        let dir = TempDir::new().unwrap();
        let hosts = KnownHosts::in_dir(dir.path());
        assert!(matches!(hosts.list(), Err(NetworkError::NotFound(_))));
    }

    #[test]
    fn test_add_same_address_keeps_id() {
        let (_dir, hosts) = registry();
        let first = hosts.add_known_host(Host::new("box", "10.0.0.2", 9876)).unwrap();
        let second = hosts.add_known_host(Host::new("renamed", "10.0.0.2", 9876)).unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(hosts.list().unwrap().len(), 1);
        assert_eq!(hosts.list().unwrap()[0].name, "renamed");
    }

    #[test]
    fn test_empty_query_matches_nothing() {
        let (_dir, hosts) = registry();
        hosts.add_known_host(Host::new("box", "10.0.0.2", 9876)).unwrap();
        assert!(hosts.find_host("").unwrap().is_none());
    }
}
