//! Tests for the durable known-hosts registry.

use chrono::Utc;
use skillmesh_network::{HealthResult, KnownHosts, NetworkError};
use skillmesh_protocol::{Host, HostStatus};

fn host(id: &str, name: &str, address: &str) -> Host {
    Host {
        id: id.into(),
        ..Host::new(name, address, 9876)
    }
}

fn registry_with_two_hosts() -> (tempfile::TempDir, KnownHosts) {
    let dir = tempfile::tempdir().unwrap();
    let hosts = KnownHosts::in_dir(dir.path());
    hosts.initialize_hosts_file("local", 9876).unwrap();
    hosts.add_known_host(host("abcd1234", "box", "10.0.0.2")).unwrap();
    hosts.add_known_host(host("ffff0000", "other", "10.0.0.3")).unwrap();
    (dir, hosts)
}

#[test]
fn remove_by_id_prefix_or_name_removes_the_same_host_once() {
    for query in ["abcd", "abcd1234", "box"] {
        let (_dir, hosts) = registry_with_two_hosts();

        let removed = hosts.remove_known_host(query).unwrap();
        assert_eq!(removed.id, "abcd1234", "query {query}");

        let remaining = hosts.list().unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, "ffff0000");

        assert!(matches!(
            hosts.remove_known_host(query),
            Err(NetworkError::NotFound(_))
        ));
    }
}

#[test]
fn id_prefix_wins_over_name() {
    let dir = tempfile::tempdir().unwrap();
    let hosts = KnownHosts::in_dir(dir.path());
    hosts.initialize_hosts_file("local", 9876).unwrap();
    hosts.add_known_host(host("abcd1234", "first", "10.0.0.2")).unwrap();
    hosts.add_known_host(host("ffff0000", "abcd", "10.0.0.3")).unwrap();

    assert_eq!(hosts.find_host("abcd").unwrap().unwrap().id, "abcd1234");
    assert_eq!(hosts.remove_known_host("abcd").unwrap().id, "abcd1234");
    // With the prefix match gone, the name now resolves.
    assert_eq!(hosts.remove_known_host("abcd").unwrap().id, "ffff0000");
}

#[test]
fn apply_health_updates_only_probed_hosts() {
    let (_dir, hosts) = registry_with_two_hosts();
    let checked_at = Utc::now();
    let results = vec![HealthResult {
        host_id: "abcd1234".into(),
        host_name: "box".into(),
        status: HostStatus::Online,
        latency_ms: Some(3),
        error: None,
        timed_out: false,
        checked_at,
    }];

    assert_eq!(hosts.apply_health(&results).unwrap(), 1);
    let box_host = hosts.find_host("box").unwrap().unwrap();
    assert_eq!(box_host.status, HostStatus::Online);
    assert_eq!(box_host.last_seen, Some(checked_at));

    let other = hosts.find_host("other").unwrap().unwrap();
    assert_eq!(other.status, HostStatus::Unknown);
    assert!(other.last_seen.is_none());
}

#[test]
fn offline_result_keeps_previous_last_seen() {
    let (_dir, hosts) = registry_with_two_hosts();
    let seen = Utc::now();
    let mut result = HealthResult {
        host_id: "abcd1234".into(),
        host_name: "box".into(),
        status: HostStatus::Online,
        latency_ms: Some(1),
        error: None,
        timed_out: false,
        checked_at: seen,
    };
    hosts.apply_health(std::slice::from_ref(&result)).unwrap();

    result.status = HostStatus::Offline;
    result.error = Some("Connection failed: refused".into());
    result.checked_at = seen + chrono::Duration::seconds(30);
    hosts.apply_health(&[result]).unwrap();

    let box_host = hosts.find_host("abcd1234").unwrap().unwrap();
    assert_eq!(box_host.status, HostStatus::Offline);
    assert_eq!(box_host.last_seen, Some(seen));
}

#[test]
fn file_is_camel_case_json_and_leaves_no_temp_files() {
    let (dir, hosts) = registry_with_two_hosts();
    let raw: serde_json::Value =
        serde_json::from_slice(&std::fs::read(hosts.path()).unwrap()).unwrap();
    assert!(raw["localHost"]["id"].is_string());
    assert_eq!(raw["hosts"].as_array().unwrap().len(), 2);

    let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
    assert_eq!(entries.len(), 1);
}
