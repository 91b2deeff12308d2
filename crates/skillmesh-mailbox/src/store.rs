//! On-disk mailbox storage.
//!
//! Layout: `<root>/<agent>/<folder>/<message-id>.json`, one file per
//! message. Each file is written atomically, so a status change rewrites a
//! single message and a concurrent inbound delivery never races with it.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use skillmesh_protocol::fsutil::{ensure_private_dir, write_atomic};
use skillmesh_protocol::is_valid_wire_id;

use crate::message::MailboxMessage;
use crate::MailboxError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Folder {
    Inbox,
    Sent,
    Archive,
}

impl Folder {
    fn dir_name(&self) -> &'static str {
        match self {
            Folder::Inbox => "inbox",
            Folder::Sent => "sent",
            Folder::Archive => "archive",
        }
    }
}

#[derive(Debug, Clone)]
pub struct MailboxStore {
    root: PathBuf,
}

impl MailboxStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn folder_dir(&self, agent: &str, folder: Folder) -> Result<PathBuf, MailboxError> {
        validate_agent_id(agent)?;
        Ok(self.root.join(agent).join(folder.dir_name()))
    }

    fn message_path(&self, agent: &str, folder: Folder, id: &str) -> Result<PathBuf, MailboxError> {
        if !is_valid_wire_id(id) {
            return Err(MailboxError::NotFound(id.to_string()));
        }
        Ok(self.folder_dir(agent, folder)?.join(format!("{id}.json")))
    }

    /// Write `message` into `folder`, replacing any previous copy.
    pub fn put(&self, agent: &str, folder: Folder, message: &MailboxMessage) -> Result<(), MailboxError> {
        let dir = self.folder_dir(agent, folder)?;
        ensure_private_dir(&dir)?;
        let path = self.message_path(agent, folder, &message.id)?;
        write_atomic(&path, &serde_json::to_vec_pretty(message)?, None)?;
        Ok(())
    }

    pub fn get(&self, agent: &str, folder: Folder, id: &str) -> Result<Option<MailboxMessage>, MailboxError> {
        let path = self.message_path(agent, folder, id)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Every message in `folder`. Unreadable files are skipped with a warning.
    pub fn list(&self, agent: &str, folder: Folder) -> Result<Vec<MailboxMessage>, MailboxError> {
        let dir = self.folder_dir(agent, folder)?;
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut messages = Vec::new();
        for entry in entries {
            let path = entry?.path();
            let is_message = path.extension().is_some_and(|ext| ext == "json")
                && !path
                    .file_name()
                    .is_some_and(|n| n.to_string_lossy().starts_with('.'));
            if !is_message {
                continue;
            }
            match fs::read(&path).map_err(MailboxError::from).and_then(|bytes| {
                serde_json::from_slice::<MailboxMessage>(&bytes).map_err(MailboxError::from)
            }) {
                Ok(message) => messages.push(message),
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable message"),
            }
        }
        Ok(messages)
    }

    pub fn remove(&self, agent: &str, folder: Folder, id: &str) -> Result<bool, MailboxError> {
        let path = self.message_path(agent, folder, id)?;
        match fs::remove_file(path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Store `message` in `to`, then drop it from `from`.
    pub fn relocate(
        &self,
        agent: &str,
        from: Folder,
        to: Folder,
        message: &MailboxMessage,
    ) -> Result<(), MailboxError> {
        self.put(agent, to, message)?;
        self.remove(agent, from, &message.id)?;
        Ok(())
    }

    /// Exact id, else the newest message whose id starts with `prefix`.
    pub fn find_by_prefix(
        &self,
        agent: &str,
        folder: Folder,
        prefix: &str,
    ) -> Result<Option<MailboxMessage>, MailboxError> {
        if prefix.is_empty() {
            return Ok(None);
        }
        if let Ok(Some(exact)) = self.get(agent, folder, prefix) {
            return Ok(Some(exact));
        }
        let mut candidates: Vec<MailboxMessage> = self
            .list(agent, folder)?
            .into_iter()
            .filter(|m| m.id.starts_with(prefix))
            .collect();
        candidates.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(candidates.into_iter().next())
    }

    pub fn count(&self, agent: &str, folder: Folder) -> Result<usize, MailboxError> {
        Ok(self.list(agent, folder)?.len())
    }
}

/// Agent ids become directory names; keep them to a safe alphabet.
pub fn validate_agent_id(agent: &str) -> Result<(), MailboxError> {
    let valid = !agent.is_empty()
        && agent != "."
        && agent != ".."
        && agent
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(MailboxError::InvalidAgentId(agent.to_string()))
    }
}
