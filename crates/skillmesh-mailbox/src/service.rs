//! The per-agent messaging service.

use std::sync::Arc;

use crate::delivery::Delivery;
use crate::message::{
    DeliveryReport, InboxSummary, MailboxMessage, MailboxStatus, MessageBody, MessageFilter,
    MessageKind, MessageStatus, Priority, Recipient,
};
use crate::store::{validate_agent_id, Folder, MailboxStore};
use crate::MailboxError;

const REPLY_PREFIX: &str = "Re: ";
const FORWARD_PREFIX: &str = "Fwd: ";
const FORWARD_HEADER: &str = "---------- Forwarded message ----------";

/// Who the service acts for and how this host names itself.
#[derive(Debug, Clone)]
pub struct MessagingConfig {
    pub agent_id: String,
    /// Host part of outbound `from` addresses; a recipient host equal to this
    /// name (or to `local_host_id`) is delivered locally.
    pub local_host_name: Option<String>,
    pub local_host_id: Option<String>,
}

impl MessagingConfig {
    pub fn new(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            local_host_name: None,
            local_host_id: None,
        }
    }

    pub fn with_local_host(mut self, name: impl Into<String>, id: impl Into<String>) -> Self {
        self.local_host_name = Some(name.into());
        self.local_host_id = Some(id.into());
        self
    }

    fn is_local_host(&self, host: &str) -> bool {
        self.local_host_name.as_deref() == Some(host)
            || self.local_host_id.as_deref() == Some(host)
            || host == "localhost"
    }
}

/// Mailbox operations for one agent.
///
/// The service is the only writer of its agent's sent folder and of inbox
/// status changes. Remote recipients go through the configured [`Delivery`];
/// without one, remote sends are reported as undelivered.
pub struct MessagingService {
    config: MessagingConfig,
    store: MailboxStore,
    delivery: Option<Arc<dyn Delivery>>,
}

impl MessagingService {
    pub fn new(config: MessagingConfig, store: MailboxStore) -> Result<Self, MailboxError> {
        validate_agent_id(&config.agent_id)?;
        Ok(Self {
            config,
            store,
            delivery: None,
        })
    }

    pub fn with_delivery(mut self, delivery: Arc<dyn Delivery>) -> Self {
        self.delivery = Some(delivery);
        self
    }

    pub fn agent_id(&self) -> &str {
        &self.config.agent_id
    }

    /// Compose and send a new message. The sent copy is stored before
    /// delivery is attempted and is kept whatever the outcome.
    pub async fn send(
        &self,
        to: &str,
        subject: &str,
        body: impl Into<MessageBody>,
        priority: Priority,
        kind: MessageKind,
    ) -> Result<DeliveryReport, MailboxError> {
        let recipient = Recipient::parse(to)?;
        let message = MailboxMessage::new(
            self.sender_address(&recipient),
            recipient.to_string(),
            subject,
            body,
            priority,
            kind,
        );
        self.dispatch(recipient, message).await
    }

    /// Reply to the sender of `id`. The original is left untouched.
    pub async fn reply(
        &self,
        id: &str,
        body: impl Into<MessageBody>,
    ) -> Result<DeliveryReport, MailboxError> {
        let original = self.get_message(id)?;
        let recipient = Recipient::parse(&original.from)?;
        let mut message = MailboxMessage::new(
            self.sender_address(&recipient),
            recipient.to_string(),
            prefixed(REPLY_PREFIX, &original.subject),
            body,
            original.priority,
            MessageKind::Response,
        );
        message.reply_to = Some(original.id.clone());
        message.thread_id = Some(original.thread_id.clone().unwrap_or_else(|| original.id.clone()));
        self.dispatch(recipient, message).await
    }

    /// Forward `id` to `to`, optionally with a note above the quoted original.
    pub async fn forward(
        &self,
        id: &str,
        to: &str,
        note: Option<&str>,
    ) -> Result<DeliveryReport, MailboxError> {
        let original = self.get_message(id)?;
        let recipient = Recipient::parse(to)?;
        let mut message = MailboxMessage::new(
            self.sender_address(&recipient),
            recipient.to_string(),
            prefixed(FORWARD_PREFIX, &original.subject),
            forwarded_body(&original, note),
            original.priority,
            original.kind,
        );
        message.thread_id = original.thread_id.clone();
        self.dispatch(recipient, message).await
    }

    pub fn get_inbox(&self, filter: &MessageFilter) -> Result<Vec<MailboxMessage>, MailboxError> {
        self.folder(Folder::Inbox, filter)
    }

    pub fn get_sent(&self, filter: &MessageFilter) -> Result<Vec<MailboxMessage>, MailboxError> {
        self.folder(Folder::Sent, filter)
    }

    pub fn get_archived(&self, filter: &MessageFilter) -> Result<Vec<MailboxMessage>, MailboxError> {
        self.folder(Folder::Archive, filter)
    }

    /// Look a message up by id or unique prefix: inbox, then archive, then sent.
    pub fn get_message(&self, id: &str) -> Result<MailboxMessage, MailboxError> {
        for folder in [Folder::Inbox, Folder::Archive, Folder::Sent] {
            if let Some(message) = self.store.find_by_prefix(self.agent_id(), folder, id)? {
                return Ok(message);
            }
        }
        Err(MailboxError::NotFound(id.to_string()))
    }

    /// Idempotent. An archived message is returned as it is.
    pub fn mark_as_read(&self, id: &str) -> Result<MailboxMessage, MailboxError> {
        let agent = self.agent_id();
        if let Some(mut message) = self.store.find_by_prefix(agent, Folder::Inbox, id)? {
            if message.status == MessageStatus::Unread {
                message.status = MessageStatus::Read;
                self.store.put(agent, Folder::Inbox, &message)?;
                tracing::debug!(message_id = %message.id, agent, "Marked message read");
            }
            return Ok(message);
        }
        self.store
            .find_by_prefix(agent, Folder::Archive, id)?
            .ok_or_else(|| MailboxError::NotFound(id.to_string()))
    }

    /// Move an inbox message to the archive. Archiving twice is a no-op.
    pub fn archive(&self, id: &str) -> Result<MailboxMessage, MailboxError> {
        let agent = self.agent_id();
        if let Some(mut message) = self.store.find_by_prefix(agent, Folder::Inbox, id)? {
            message.status = MessageStatus::Archived;
            self.store.relocate(agent, Folder::Inbox, Folder::Archive, &message)?;
            tracing::info!(message_id = %message.id, agent, "Archived message");
            return Ok(message);
        }
        self.store
            .find_by_prefix(agent, Folder::Archive, id)?
            .ok_or_else(|| MailboxError::NotFound(id.to_string()))
    }

    pub fn get_inbox_summary(&self) -> Result<InboxSummary, MailboxError> {
        let inbox = self.store.list(self.agent_id(), Folder::Inbox)?;
        Ok(InboxSummary::from_messages(&inbox))
    }

    pub fn status(&self) -> Result<MailboxStatus, MailboxError> {
        Ok(MailboxStatus {
            agent_id: self.config.agent_id.clone(),
            inbox: self.get_inbox_summary()?,
            sent: self.store.count(self.agent_id(), Folder::Sent)?,
            archived: self.store.count(self.agent_id(), Folder::Archive)?,
        })
    }

    fn folder(&self, folder: Folder, filter: &MessageFilter) -> Result<Vec<MailboxMessage>, MailboxError> {
        Ok(filter.apply(self.store.list(self.agent_id(), folder)?))
    }

    /// Remote recipients see `agent@host` so their replies find their way back.
    fn sender_address(&self, recipient: &Recipient) -> String {
        match (&recipient.host, &self.config.local_host_name) {
            (Some(host), Some(local)) if !self.config.is_local_host(host) => {
                format!("{}@{}", self.config.agent_id, local)
            }
            _ => self.config.agent_id.clone(),
        }
    }

    async fn dispatch(
        &self,
        recipient: Recipient,
        message: MailboxMessage,
    ) -> Result<DeliveryReport, MailboxError> {
        let agent = self.agent_id();
        // The sent copy starts unread, like the delivered one.
        let mut sent_copy = message.clone();
        sent_copy.status = MessageStatus::Unread;
        self.store.put(agent, Folder::Sent, &sent_copy)?;

        let report = match recipient.host.as_deref() {
            Some(host) if !self.config.is_local_host(host) => match &self.delivery {
                Some(delivery) => delivery.deliver(&recipient, &message).await,
                None => DeliveryReport::failed(&message.id, "none", "no remote delivery configured"),
            },
            _ => self.deliver_local(&recipient.agent, &message),
        };

        if report.delivered {
            tracing::info!(message_id = %message.id, to = %recipient, via = %report.via, "Message sent");
        } else {
            tracing::warn!(
                message_id = %message.id,
                to = %recipient,
                error = report.error.as_deref().unwrap_or_default(),
                "Message not delivered"
            );
        }
        Ok(report)
    }

    fn deliver_local(&self, agent: &str, message: &MailboxMessage) -> DeliveryReport {
        let mut inbound = message.clone();
        inbound.status = MessageStatus::Unread;
        match self.store.put(agent, Folder::Inbox, &inbound) {
            Ok(()) => DeliveryReport::delivered(&message.id, "local"),
            Err(e) => DeliveryReport::failed(&message.id, "local", e.to_string()),
        }
    }
}

fn prefixed(prefix: &str, subject: &str) -> String {
    if subject.starts_with(prefix) {
        subject.to_string()
    } else {
        format!("{prefix}{subject}")
    }
}

fn forwarded_body(original: &MailboxMessage, note: Option<&str>) -> String {
    let mut body = String::new();
    if let Some(note) = note.filter(|n| !n.trim().is_empty()) {
        body.push_str(note);
        body.push_str("\n\n");
    }
    body.push_str(FORWARD_HEADER);
    body.push('\n');
    body.push_str(&format!("From: {}\n", original.from));
    body.push_str(&format!("Date: {}\n", original.created_at.to_rfc3339()));
    body.push_str(&format!("Subject: {}\n\n", original.subject));
    for line in original.body.to_string().lines() {
        body.push_str("> ");
        body.push_str(line);
        body.push('\n');
    }
    body
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_applied_once() {
        assert_eq!(prefixed(REPLY_PREFIX, "status"), "Re: status");
        assert_eq!(prefixed(REPLY_PREFIX, "Re: status"), "Re: status");
        assert_eq!(prefixed(FORWARD_PREFIX, "Re: status"), "Fwd: Re: status");
    }

    #[test]
    fn test_forwarded_body_quotes_original() {
        let original = MailboxMessage::new(
            "alice",
            "bob",
            "build",
            "line one\nline two",
            Priority::Normal,
            MessageKind::Notification,
        );
        let body = forwarded_body(&original, Some("fyi"));
        assert!(body.starts_with("fyi\n\n"));
        assert!(body.contains(FORWARD_HEADER));
        assert!(body.contains("From: alice"));
        assert!(body.contains("> line one\n> line two\n"));

        let bare = forwarded_body(&original, None);
        assert!(bare.starts_with(FORWARD_HEADER));
    }

    #[test]
    fn test_sender_address() {
        let dir = tempfile::tempdir().unwrap();
        let config = MessagingConfig::new("alice").with_local_host("laptop", "host-1");
        let service = MessagingService::new(config, MailboxStore::new(dir.path())).unwrap();

        let remote = Recipient::parse("bob@server").unwrap();
        assert_eq!(service.sender_address(&remote), "alice@laptop");
        let local = Recipient::parse("bob@laptop").unwrap();
        assert_eq!(service.sender_address(&local), "alice");
        let bare = Recipient::parse("bob").unwrap();
        assert_eq!(service.sender_address(&bare), "alice");
    }

    #[test]
    fn test_invalid_agent_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let result = MessagingService::new(MessagingConfig::new("../x"), MailboxStore::new(dir.path()));
        assert!(matches!(result, Err(MailboxError::InvalidAgentId(_))));
    }
}
