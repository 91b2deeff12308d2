//! SkillMesh CLI - node daemon and operator commands
//!
//! Ties the library crates together for one installation:
//! - Configuration from TOML, `SKILLKIT_*` environment variables and flags
//! - The node daemon serving the mesh endpoints, the discovery responder
//!   and the mailbox sink
//! - `mesh` and `message` subcommands printing text or JSON

pub mod commands;
pub mod config;
pub mod node;

pub use config::MeshConfig;
pub use node::{MeshNode, RunningNode};
