//! CLI binary entry point for the SkillMesh node and operator commands.
//!
//! Usage:
//!   skillmesh [OPTIONS] <COMMAND>
//!
//! Commands:
//!   serve      Run the mesh node until Ctrl-C
//!   mesh       Manage hosts: init, add, remove, list, health, discover, status
//!   message    Per-agent mailbox: send, inbox, read, reply, archive, forward, sent, status
//!
//! Options:
//!   -c, --config <FILE>    Path to configuration TOML file
//!   -a, --agent <ID>       Agent whose mailbox to use (overrides SKILLKIT_AGENT_ID)
//!   -d, --data-dir <DIR>   Identity, hosts and mailbox directory
//!   --mesh-port <PORT>     Mesh port of this node
//!   -v, --verbose          Increase logging verbosity
//!   --json                 Print results as JSON

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use skillmesh_cli::commands::{self, MeshCommand, MessageCommand};
use skillmesh_cli::config::MeshConfig;

/// SkillMesh - signed messaging between agents across machines.
#[derive(Parser, Debug)]
#[command(name = "skillmesh")]
#[command(about = "Agent mesh node and mailbox CLI")]
#[command(version)]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Agent whose mailbox the message commands act on.
    #[arg(short, long, value_name = "ID", global = true)]
    agent: Option<String>,

    /// Directory holding the identity, hosts file and mailboxes.
    #[arg(short, long, value_name = "DIR", global = true)]
    data_dir: Option<PathBuf>,

    /// Mesh port of this node (overrides config).
    #[arg(long, value_name = "PORT", global = true)]
    mesh_port: Option<u16>,

    /// Increase logging verbosity (can be repeated: -v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Print results as JSON.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the mesh node: server, discovery responder and mailbox sink.
    Serve {
        /// Node name announced to peers.
        #[arg(long)]
        name: Option<String>,
        /// Bind address (e.g., 0.0.0.0).
        #[arg(long)]
        bind: Option<String>,
    },
    /// Manage the hosts of the mesh.
    #[command(subcommand)]
    Mesh(MeshCommand),
    /// Read and send mailbox messages.
    #[command(subcommand)]
    Message(MessageCommand),
}

fn init_logging(config: &MeshConfig, verbose: u8) {
    let log_level = match verbose {
        0 => config.logging.level.as_str(),
        1 => "debug",
        _ => "trace",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    // Logs go to stderr so command output stays parseable.
    if config.logging.json_format {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_writer(std::io::stderr)
            .init();
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Load configuration.
    let (mut config, warnings) = match MeshConfig::load(cli.config.as_deref()) {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("error: failed to load configuration: {e:#}");
            return ExitCode::FAILURE;
        }
    };

    // Apply CLI overrides.
    if let Some(agent) = cli.agent {
        config.messaging.agent_id = agent;
    }
    if let Some(dir) = cli.data_dir {
        config.paths.data_dir = Some(dir);
    }
    if let Some(port) = cli.mesh_port {
        config.node.port = port;
    }

    init_logging(&config, cli.verbose);
    for warning in &warnings {
        tracing::warn!(warning = %warning, "Configuration problem ignored");
    }

    let result = match cli.command {
        Command::Serve { name, bind } => {
            if let Some(name) = name {
                config.node.name = Some(name);
            }
            if let Some(bind) = bind {
                config.node.bind_addr = bind;
            }
            tracing::info!(
                name = %config.node_name(),
                addr = %config.bind_socket_addr(),
                data_dir = %config.data_dir().display(),
                "Starting SkillMesh node"
            );
            commands::serve(config).await
        }
        Command::Mesh(command) => commands::run_mesh(command, &config, cli.json).await,
        Command::Message(command) => commands::run_message(command, &config, cli.json).await,
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            if cli.json {
                println!("{}", serde_json::json!({ "error": format!("{e:#}") }));
            } else {
                eprintln!("error: {e:#}");
            }
            ExitCode::FAILURE
        }
    }
}
