//! SkillMesh Mailbox - per-agent messaging on top of the mesh transports
//!
//! Each agent owns an inbox, a sent folder and an archive stored on disk.
//! [`MessagingService`] is the only writer of an agent's mailbox; it
//! delivers to local agents directly and to remote agents through a
//! [`Delivery`] implementation, normally [`MeshDelivery`] over signed HTTP.
//! [`MailboxSink`] is the receiving end plugged into the mesh server.

pub mod delivery;
pub mod error;
pub mod message;
pub mod service;
pub mod store;

pub use delivery::{Delivery, MailboxSink, MeshDelivery};
pub use error::MailboxError;
pub use message::*;
pub use service::{MessagingConfig, MessagingService};
pub use store::{Folder, MailboxStore};
