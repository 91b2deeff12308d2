//! `mesh` and `message` subcommands.
//!
//! Each command maps onto one library operation and prints its result as
//! text or, with `--json`, as a JSON document. Per-item failures are
//! reported in the output; only persistence and identity failures abort.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context as _};
use clap::Subcommand;
use serde::Serialize;
use serde_json::json;

use skillmesh_mailbox::{
    DeliveryReport, MailboxMessage, MailboxStore, MeshDelivery, MessageFilter, MessageKind,
    MessageStatus, MessagingConfig, MessagingService, Priority,
};
use skillmesh_network::{
    HealthChecker, MeshCapabilities, MeshDiscovery, NetworkError, PeerEntry, PeerRegistry,
    SecureHttpTransport, TailscaleClient, Transport, WebSocketTransport,
};
use skillmesh_protocol::crypto::short_fingerprint;
use skillmesh_protocol::{AuthManager, Host, HostStatus, Identity, TransportMessage, DEFAULT_MESH_PORT};

use crate::config::MeshConfig;

/// How long the CLI waits for the local node's peer list.
const LOCAL_NODE_TIMEOUT: Duration = Duration::from_millis(750);

#[derive(Subcommand, Debug)]
pub enum MeshCommand {
    /// Create the identity and the hosts file for this machine.
    Init {
        /// Name for this host (defaults to the configured node name).
        #[arg(long)]
        name: Option<String>,
        /// Mesh port recorded for this host.
        #[arg(long)]
        port: Option<u16>,
        /// Replace the existing identity with a new one.
        #[arg(long)]
        reset_identity: bool,
    },
    /// Add a host by address. Its id and name are learned from its /health.
    Add {
        address: String,
        #[arg(short, long)]
        port: Option<u16>,
        #[arg(short, long)]
        name: Option<String>,
        /// Host id to record when the host cannot be asked for it.
        #[arg(long)]
        id: Option<String>,
    },
    /// Remove a host by id, id prefix or name.
    Remove { host: String },
    /// List known hosts.
    List,
    /// Probe every known host and record the outcome.
    Health {
        /// Per-host deadline in milliseconds.
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
    /// Look for hosts on the local subnet and the overlay network.
    Discover {
        #[arg(long)]
        timeout_ms: Option<u64>,
        /// Add discovered hosts to the known hosts.
        #[arg(long)]
        save: bool,
    },
    /// Show this host, its identity and the mesh capabilities.
    Status,
}

#[derive(Subcommand, Debug)]
pub enum MessageCommand {
    /// Send a message to `agent` or `agent@host`.
    Send {
        to: String,
        #[arg(short, long)]
        subject: String,
        /// Message body.
        body: String,
        #[arg(short, long, default_value = "normal")]
        priority: Priority,
        #[arg(short = 't', long = "type", default_value = "request")]
        kind: MessageKind,
    },
    /// List the inbox, newest first.
    Inbox {
        #[arg(short, long)]
        unread: bool,
        #[arg(short, long)]
        priority: Option<Priority>,
        #[arg(long)]
        from: Option<String>,
        #[arg(short, long)]
        limit: Option<usize>,
    },
    /// Show a message and mark it read.
    Read { id: String },
    /// Reply to the sender of a message.
    Reply { id: String, body: String },
    /// Move a message from the inbox to the archive.
    Archive { id: String },
    /// Forward a message to another agent.
    Forward {
        id: String,
        to: String,
        #[arg(short, long)]
        note: Option<String>,
    },
    /// List sent messages, newest first.
    Sent {
        #[arg(short, long)]
        limit: Option<usize>,
    },
    /// Show mailbox counts.
    Status,
    /// Print notifications of inbound mail from the local node until Ctrl-C.
    Watch,
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn host_line(host: &Host) -> String {
    let fingerprint = host
        .fingerprint
        .as_deref()
        .map(short_fingerprint)
        .unwrap_or("-");
    let last_seen = host
        .last_seen
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "never".to_string());
    format!(
        "{:<10} {:<20} {:<24} {:<8} {:<10} {}",
        host.short_id(),
        host.name,
        host.authority(),
        host.status,
        fingerprint,
        last_seen
    )
}

fn message_line(message: &MailboxMessage) -> String {
    let marker = if message.status == MessageStatus::Unread { "*" } else { " " };
    format!(
        "{} {:<10} {:<7} {:<20} {}",
        marker,
        message.short_id(),
        message.priority,
        message.from,
        message.subject
    )
}

fn print_message(message: &MailboxMessage) {
    println!("Id:       {}", message.id);
    println!("From:     {}", message.from);
    println!("To:       {}", message.to);
    println!("Subject:  {}", message.subject);
    println!("Date:     {}", message.created_at.to_rfc3339());
    println!("Priority: {}  Type: {}  Status: {}", message.priority, message.kind, message.status);
    if let Some(reply_to) = &message.reply_to {
        println!("Reply-To: {reply_to}");
    }
    println!();
    println!("{}", message.body);
}

fn report_delivery(report: &DeliveryReport, json: bool) -> anyhow::Result<ExitCode> {
    if json {
        print_json(report)?;
    } else if report.delivered {
        println!("Delivered {} via {}", &report.message_id, report.via);
    } else {
        println!(
            "Not delivered ({}): {}. A copy is kept in sent.",
            report.via,
            report.error.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(if report.delivered {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

// ---------------------------------------------------------------------------
// Shared setup
// ---------------------------------------------------------------------------

fn load_identity(config: &MeshConfig) -> anyhow::Result<Arc<Identity>> {
    let identity = config
        .keystore()
        .load_or_create_identity()
        .context("failed to load identity")?;
    Ok(Arc::new(identity))
}

fn local_host(config: &MeshConfig) -> anyhow::Result<Host> {
    config
        .known_hosts()
        .initialize_hosts_file(&config.node_name(), config.node.port)
        .context("failed to initialize hosts file")
}

/// Session peers as seen by the node running on this machine, if any.
async fn local_node_peers(config: &MeshConfig, identity: &Arc<Identity>, local: &Host) -> PeerRegistry {
    let registry = PeerRegistry::new();
    let node = Host {
        address: "127.0.0.1".into(),
        port: config.node.port,
        tailscale_ip: None,
        ..local.clone()
    };
    let mut http = config.http_transport_config(&local.id);
    http.timeout = LOCAL_NODE_TIMEOUT;
    http.retries = 0;

    let peers = match SecureHttpTransport::new(node, Some(Arc::clone(identity)), http) {
        Ok(transport) => transport.peers().await,
        Err(e) => Err(e),
    };
    match peers {
        Ok(peers) => {
            for info in peers {
                registry.upsert(PeerEntry {
                    fingerprint: info.fingerprint,
                    host_id: info.host_id,
                    name: info.name,
                    address: info.address,
                    port: info.port,
                    last_seen_in_session: info.last_seen_in_session,
                });
            }
        }
        Err(e) => tracing::debug!(error = %e, "Local node not reachable; using known hosts only"),
    }
    registry
}

async fn messaging_service(
    config: &MeshConfig,
    with_delivery: bool,
) -> anyhow::Result<MessagingService> {
    let local = local_host(config)?;
    let messaging = MessagingConfig::new(config.messaging.agent_id.clone())
        .with_local_host(local.name.clone(), local.id.clone());
    let service = MessagingService::new(messaging, MailboxStore::new(config.mailbox_dir()))?;
    if !with_delivery {
        return Ok(service);
    }

    let identity = load_identity(config)?;
    let peers = local_node_peers(config, &identity, &local).await;
    let delivery = MeshDelivery::new(
        peers,
        config.known_hosts(),
        identity,
        config.http_transport_config(&local.id),
    );
    Ok(service.with_delivery(Arc::new(delivery)))
}

/// Replace `host`'s id and fingerprint (and name, unless `keep_name`) with
/// what it reports on `/health`.
async fn identify_host(
    config: &MeshConfig,
    identity: &Arc<Identity>,
    local: &Host,
    host: &mut Host,
    keep_name: bool,
) -> Result<(), NetworkError> {
    let mut http = config.http_transport_config(&local.id);
    http.retries = 0;
    let health = SecureHttpTransport::new(host.clone(), Some(Arc::clone(identity)), http)?
        .health()
        .await?;
    host.id = health.host_id;
    host.fingerprint = Some(health.fingerprint);
    if !keep_name {
        host.name = health.name;
    }
    Ok(())
}

async fn wait_for_ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for Ctrl-C");
    }
}

// ---------------------------------------------------------------------------
// mesh
// ---------------------------------------------------------------------------

pub async fn run_mesh(command: MeshCommand, config: &MeshConfig, json: bool) -> anyhow::Result<ExitCode> {
    match command {
        MeshCommand::Init {
            name,
            port,
            reset_identity,
        } => {
            let keystore = config.keystore();
            let identity = if reset_identity {
                keystore.reset()?
            } else {
                keystore.load_or_create_identity()?
            };
            let name = name.unwrap_or_else(|| config.node_name());
            let local = config
                .known_hosts()
                .initialize_hosts_file(&name, port.unwrap_or(config.node.port))?;
            if json {
                print_json(&json!({
                    "localHost": local,
                    "fingerprint": identity.fingerprint(),
                    "dataDir": config.data_dir(),
                }))?;
            } else {
                println!("Host:        {} ({})", local.name, local.id);
                println!("Fingerprint: {}", identity.fingerprint());
                println!("Data dir:    {}", config.data_dir().display());
            }
        }

        MeshCommand::Add {
            address,
            port,
            name,
            id,
        } => {
            let local = local_host(config)?;
            let identity = load_identity(config)?;
            let mut candidate = Host::new(
                name.clone().unwrap_or_else(|| address.clone()),
                address,
                port.unwrap_or(DEFAULT_MESH_PORT),
            );
            if let Some(id) = &id {
                candidate.id = id.clone();
            }

            match identify_host(config, &identity, &local, &mut candidate, name.is_some()).await {
                Ok(()) => {}
                Err(e) if id.is_some() => {
                    tracing::warn!(host = %candidate.authority(), error = %e, "Host not reachable; adding with the given id");
                }
                Err(e) => bail!(
                    "could not reach {}: {e}. Pass --id <host-id> to add it anyway",
                    candidate.authority()
                ),
            }

            let stored = config.known_hosts().add_known_host(candidate)?;
            if json {
                print_json(&stored)?;
            } else {
                println!("Added {} ({}) at {}", stored.name, stored.id, stored.authority());
            }
        }

        MeshCommand::Remove { host } => {
            let removed = config.known_hosts().remove_known_host(&host)?;
            if json {
                print_json(&removed)?;
            } else {
                println!("Removed {} ({})", removed.name, removed.id);
            }
        }

        MeshCommand::List => {
            local_host(config)?;
            let hosts = config.known_hosts().list()?;
            if json {
                print_json(&hosts)?;
            } else if hosts.is_empty() {
                println!("No known hosts. Add one with `skillmesh mesh add <address>`.");
            } else {
                for host in &hosts {
                    println!("{}", host_line(host));
                }
            }
        }

        MeshCommand::Health { timeout_ms } => {
            let local = local_host(config)?;
            let identity = load_identity(config)?;
            let hosts = config.known_hosts().list()?;
            let mut options = config.health_options();
            if let Some(ms) = timeout_ms {
                options.timeout = Duration::from_millis(ms);
            }

            let checker = HealthChecker::http(Some(identity), config.http_transport_config(&local.id));
            let report = checker.check_all_hosts_health(&hosts, &options).await;
            config.known_hosts().apply_health(&report.results)?;

            if json {
                print_json(&json!({
                    "online": report.online_count(),
                    "total": report.total(),
                    "results": report.results,
                }))?;
            } else {
                for result in &report.results {
                    match (&result.latency_ms, &result.error) {
                        (Some(ms), _) => println!("  {:<20} {:<8} {}ms", result.host_name, result.status, ms),
                        (None, Some(error)) => println!("  {:<20} {:<8} {}", result.host_name, result.status, error),
                        (None, None) => println!("  {:<20} {}", result.host_name, result.status),
                    }
                }
                println!("{report}");
            }
            if !report.all_online() {
                return Ok(ExitCode::FAILURE);
            }
        }

        MeshCommand::Discover { timeout_ms, save } => {
            let local = local_host(config)?;
            let security = config.security_config();
            let tailscale = config
                .discovery
                .tailscale_enabled
                .then(|| TailscaleClient::new(config.discovery.tailscale_bin.clone()));
            let capabilities = MeshCapabilities::detect(&security, tailscale.as_ref()).await;
            let discovery = MeshDiscovery::new(config.discovery_config(&local.id), capabilities, tailscale);

            let timeout = timeout_ms
                .map(Duration::from_millis)
                .unwrap_or_else(|| config.discovery_timeout());
            let mut found = discovery.discover_once(timeout).await?;
            match discovery.discover_tailscale_hosts(config.node.port).await {
                Ok(overlay) => {
                    for host in overlay {
                        let duplicate = found
                            .iter()
                            .any(|h| h.id == host.id || h.address == host.address || h.dial_address() == host.dial_address());
                        if !duplicate {
                            found.push(host);
                        }
                    }
                }
                Err(e) => tracing::warn!(error = %e, "Overlay discovery failed"),
            }

            let mut saved = Vec::new();
            if save {
                let identity = load_identity(config)?;
                let hosts = config.known_hosts();
                for host in &found {
                    let mut host = host.clone();
                    // Overlay peers come with placeholder ids; tokens need the real one.
                    if let Err(e) = identify_host(config, &identity, &local, &mut host, true).await {
                        tracing::debug!(host = %host.authority(), error = %e, "Saving host without confirmed id");
                    }
                    saved.push(hosts.add_known_host(host)?);
                }
            }

            if json {
                print_json(&json!({ "discovered": found, "saved": saved.len() }))?;
            } else if found.is_empty() {
                println!("No hosts found.");
            } else {
                for host in &found {
                    println!("{}", host_line(host));
                }
                println!("{} host(s) found", found.len());
                if save {
                    println!("{} host(s) saved", saved.len());
                }
            }
        }

        MeshCommand::Status => {
            let local = local_host(config)?;
            let identity = load_identity(config)?;
            let hosts = config.known_hosts().list()?;
            let security = config.security_config();
            let tailscale = config
                .discovery
                .tailscale_enabled
                .then(|| TailscaleClient::new(config.discovery.tailscale_bin.clone()));
            let capabilities = MeshCapabilities::detect(&security, tailscale.as_ref()).await;
            let online = hosts
                .iter()
                .filter(|h| h.status == HostStatus::Online)
                .count();

            if json {
                print_json(&json!({
                    "localHost": local,
                    "fingerprint": identity.fingerprint(),
                    "knownHosts": hosts.len(),
                    "onlineHosts": online,
                    "requireAuth": security.require_auth,
                    "transport": security.transport,
                    "capabilities": capabilities,
                }))?;
            } else {
                println!("Host:         {} ({})", local.name, local.id);
                println!("Fingerprint:  {}", identity.fingerprint());
                println!("Known hosts:  {} ({} online at last check)", hosts.len(), online);
                println!(
                    "Security:     auth {}, transport {}",
                    if security.require_auth { "required" } else { "optional" },
                    security.transport.http_scheme()
                );
                println!(
                    "Capabilities: tailscale={} tls={} udp_broadcast={}",
                    capabilities.tailscale, capabilities.tls, capabilities.udp_broadcast
                );
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}

// ---------------------------------------------------------------------------
// message
// ---------------------------------------------------------------------------

pub async fn run_message(
    command: MessageCommand,
    config: &MeshConfig,
    json: bool,
) -> anyhow::Result<ExitCode> {
    match command {
        MessageCommand::Send {
            to,
            subject,
            body,
            priority,
            kind,
        } => {
            let service = messaging_service(config, true).await?;
            let report = service.send(&to, &subject, body, priority, kind).await?;
            return report_delivery(&report, json);
        }

        MessageCommand::Inbox {
            unread,
            priority,
            from,
            limit,
        } => {
            let service = messaging_service(config, false).await?;
            let filter = MessageFilter {
                status: unread.then_some(MessageStatus::Unread),
                priority,
                from,
                limit,
                ..MessageFilter::default()
            };
            let messages = service.get_inbox(&filter)?;
            if json {
                print_json(&messages)?;
            } else if messages.is_empty() {
                println!("Inbox of {} is empty.", service.agent_id());
            } else {
                for message in &messages {
                    println!("{}", message_line(message));
                }
                let summary = service.get_inbox_summary()?;
                println!("{} message(s), {} unread", summary.total, summary.unread);
            }
        }

        MessageCommand::Read { id } => {
            let service = messaging_service(config, false).await?;
            let message = service.mark_as_read(&id)?;
            if json {
                print_json(&message)?;
            } else {
                print_message(&message);
            }
        }

        MessageCommand::Reply { id, body } => {
            let service = messaging_service(config, true).await?;
            let report = service.reply(&id, body).await?;
            return report_delivery(&report, json);
        }

        MessageCommand::Archive { id } => {
            let service = messaging_service(config, false).await?;
            let message = service.archive(&id)?;
            if json {
                print_json(&message)?;
            } else {
                println!("Archived {}", message.short_id());
            }
        }

        MessageCommand::Forward { id, to, note } => {
            let service = messaging_service(config, true).await?;
            let report = service.forward(&id, &to, note.as_deref()).await?;
            return report_delivery(&report, json);
        }

        MessageCommand::Sent { limit } => {
            let service = messaging_service(config, false).await?;
            let messages = service.get_sent(&MessageFilter {
                limit,
                ..MessageFilter::default()
            })?;
            if json {
                print_json(&messages)?;
            } else {
                for message in &messages {
                    println!("  {:<10} {:<20} {}", message.short_id(), message.to, message.subject);
                }
                println!("{} sent message(s)", messages.len());
            }
        }

        MessageCommand::Status => {
            let service = messaging_service(config, false).await?;
            let status = service.status()?;
            if json {
                print_json(&status)?;
            } else {
                println!("Agent:    {}", status.agent_id);
                println!("Inbox:    {} ({} unread)", status.inbox.total, status.inbox.unread);
                let by_priority: Vec<String> = status
                    .inbox
                    .by_priority
                    .iter()
                    .map(|(p, n)| format!("{p}={n}"))
                    .collect();
                println!("Priority: {}", by_priority.join(" "));
                println!("Sent:     {}", status.sent);
                println!("Archived: {}", status.archived);
            }
        }

        MessageCommand::Watch => {
            watch(config, json).await?;
        }
    }
    Ok(ExitCode::SUCCESS)
}

/// Follow the local node's `/ws` feed and print mail for this agent.
async fn watch(config: &MeshConfig, json: bool) -> anyhow::Result<()> {
    let local = local_host(config)?;
    let identity = load_identity(config)?;
    let node = Host {
        address: "127.0.0.1".into(),
        port: config.node.port,
        tailscale_ip: None,
        ..local.clone()
    };
    let ws_config = config.websocket_config(&node, &local.id);
    let transport = if config.security.require_auth {
        WebSocketTransport::with_auth(ws_config, AuthManager::new(identity, config.security_config()))
    } else {
        WebSocketTransport::new(ws_config)
    };

    let agent = config.messaging.agent_id.clone();
    let _subscription = transport.on_message(Arc::new(move |message: TransportMessage| {
        if message.payload["agent"].as_str() != Some(agent.as_str()) {
            return;
        }
        if json {
            println!("{}", message.payload);
        } else {
            println!(
                "New message {} from {}: {}",
                message.payload["messageId"].as_str().unwrap_or("?"),
                message.payload["from"].as_str().unwrap_or("?"),
                message.payload["subject"].as_str().unwrap_or("")
            );
        }
    }));

    transport
        .connect()
        .await
        .with_context(|| format!("no node listening on {}", node.authority()))?;
    tracing::info!(agent = %config.messaging.agent_id, "Watching for new mail");
    wait_for_ctrl_c().await;
    transport.disconnect().await;
    Ok(())
}

/// Run the node until Ctrl-C.
pub async fn serve(config: MeshConfig) -> anyhow::Result<ExitCode> {
    let node = crate::node::MeshNode::new(config)?.start().await?;
    node.run_until(wait_for_ctrl_c()).await?;
    Ok(ExitCode::SUCCESS)
}
