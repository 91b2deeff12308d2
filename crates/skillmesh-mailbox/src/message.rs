//! Mailbox message types.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use skillmesh_protocol::crypto::char_prefix;
use uuid::Uuid;

use crate::MailboxError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

impl Priority {
    pub const ALL: [Priority; 4] = [Priority::Low, Priority::Normal, Priority::High, Priority::Urgent];

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Urgent => "urgent",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "normal" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            "urgent" => Ok(Priority::Urgent),
            other => Err(format!("unknown priority '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    #[default]
    Request,
    Response,
    Notification,
    Update,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Request => "request",
            MessageKind::Response => "response",
            MessageKind::Notification => "notification",
            MessageKind::Update => "update",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "request" => Ok(MessageKind::Request),
            "response" => Ok(MessageKind::Response),
            "notification" => Ok(MessageKind::Notification),
            "update" => Ok(MessageKind::Update),
            other => Err(format!("unknown message type '{other}'")),
        }
    }
}

/// Lifecycle: unread, then read on an explicit read, then archived on an
/// explicit archive. Archived is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    #[default]
    Unread,
    Read,
    Archived,
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MessageStatus::Unread => "unread",
            MessageStatus::Read => "read",
            MessageStatus::Archived => "archived",
        })
    }
}

/// Free text or a structured JSON document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageBody {
    Text(String),
    Structured(serde_json::Value),
}

impl MessageBody {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            MessageBody::Text(s) => Some(s),
            MessageBody::Structured(_) => None,
        }
    }
}

impl fmt::Display for MessageBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageBody::Text(s) => f.write_str(s),
            MessageBody::Structured(v) => {
                let pretty = serde_json::to_string_pretty(v).map_err(|_| fmt::Error)?;
                f.write_str(&pretty)
            }
        }
    }
}

impl From<&str> for MessageBody {
    fn from(s: &str) -> Self {
        MessageBody::Text(s.to_string())
    }
}

impl From<String> for MessageBody {
    fn from(s: String) -> Self {
        MessageBody::Text(s)
    }
}

impl From<serde_json::Value> for MessageBody {
    fn from(v: serde_json::Value) -> Self {
        match v {
            serde_json::Value::String(s) => MessageBody::Text(s),
            other => MessageBody::Structured(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MailboxMessage {
    pub id: String,
    pub from: String,
    pub to: String,
    pub subject: String,
    pub body: MessageBody,
    #[serde(default)]
    pub priority: Priority,
    #[serde(rename = "type", default)]
    pub kind: MessageKind,
    #[serde(default)]
    pub status: MessageStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
}

impl MailboxMessage {
    pub fn new(
        from: impl Into<String>,
        to: impl Into<String>,
        subject: impl Into<String>,
        body: impl Into<MessageBody>,
        priority: Priority,
        kind: MessageKind,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            from: from.into(),
            to: to.into(),
            subject: subject.into(),
            body: body.into(),
            priority,
            kind,
            status: MessageStatus::Unread,
            created_at: Utc::now(),
            reply_to: None,
            thread_id: None,
        }
    }

    pub fn short_id(&self) -> &str {
        char_prefix(&self.id, 8)
    }
}

/// Selection over a mailbox folder. The default keeps everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageFilter {
    pub status: Option<MessageStatus>,
    pub priority: Option<Priority>,
    pub kind: Option<MessageKind>,
    pub from: Option<String>,
    pub limit: Option<usize>,
}

impl MessageFilter {
    pub fn unread() -> Self {
        Self {
            status: Some(MessageStatus::Unread),
            ..Self::default()
        }
    }

    pub fn matches(&self, message: &MailboxMessage) -> bool {
        self.status.map_or(true, |s| message.status == s)
            && self.priority.map_or(true, |p| message.priority == p)
            && self.kind.map_or(true, |k| message.kind == k)
            && self.from.as_deref().map_or(true, |f| message.from == f)
    }

    /// Keep matching messages, newest first, truncated to `limit`.
    pub fn apply(&self, messages: Vec<MailboxMessage>) -> Vec<MailboxMessage> {
        let mut selected: Vec<MailboxMessage> =
            messages.into_iter().filter(|m| self.matches(m)).collect();
        selected.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(limit) = self.limit {
            selected.truncate(limit);
        }
        selected
    }
}

/// Counts over an agent's inbox, recomputed on every request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InboxSummary {
    pub total: usize,
    pub unread: usize,
    pub by_priority: BTreeMap<Priority, usize>,
}

impl InboxSummary {
    pub fn from_messages(messages: &[MailboxMessage]) -> Self {
        let mut by_priority: BTreeMap<Priority, usize> =
            Priority::ALL.iter().map(|p| (*p, 0)).collect();
        let mut unread = 0;
        for message in messages {
            *by_priority.entry(message.priority).or_default() += 1;
            if message.status == MessageStatus::Unread {
                unread += 1;
            }
        }
        Self {
            total: messages.len(),
            unread,
            by_priority,
        }
    }
}

/// Result of `send`, `reply` and `forward`. A failed delivery is reported
/// here rather than raised; the sent copy exists either way.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryReport {
    pub delivered: bool,
    pub message_id: String,
    /// `local` or the transport that carried the message.
    pub via: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DeliveryReport {
    pub fn delivered(message_id: impl Into<String>, via: impl Into<String>) -> Self {
        Self {
            delivered: true,
            message_id: message_id.into(),
            via: via.into(),
            error: None,
        }
    }

    pub fn failed(message_id: impl Into<String>, via: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            delivered: false,
            message_id: message_id.into(),
            via: via.into(),
            error: Some(error.into()),
        }
    }
}

/// A recipient address, `agent` or `agent@host`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recipient {
    pub agent: String,
    pub host: Option<String>,
}

impl Recipient {
    pub fn parse(address: &str) -> Result<Self, MailboxError> {
        let address = address.trim();
        let (agent, host) = match address.split_once('@') {
            Some((agent, host)) => (agent, Some(host)),
            None => (address, None),
        };
        if agent.is_empty() || host.is_some_and(str::is_empty) {
            return Err(MailboxError::InvalidRecipient(address.to_string()));
        }
        Ok(Self {
            agent: agent.to_string(),
            host: host.map(str::to_string),
        })
    }
}

impl fmt::Display for Recipient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.host {
            Some(host) => write!(f, "{}@{}", self.agent, host),
            None => f.write_str(&self.agent),
        }
    }
}

/// Overview backing `message status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MailboxStatus {
    pub agent_id: String,
    pub inbox: InboxSummary,
    pub sent: usize,
    pub archived: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_body_untagged() {
        let text: MessageBody = serde_json::from_value(json!("hello")).unwrap();
        assert_eq!(text, MessageBody::Text("hello".into()));
        let structured: MessageBody = serde_json::from_value(json!({"task": 1})).unwrap();
        assert!(matches!(structured, MessageBody::Structured(_)));
    }

    #[test]
    fn test_wire_names() {
        let mut msg = MailboxMessage::new("a", "b", "s", "body", Priority::High, MessageKind::Update);
        msg.reply_to = Some("x".into());
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "update");
        assert_eq!(json["priority"], "high");
        assert_eq!(json["status"], "unread");
        assert_eq!(json["replyTo"], "x");
        assert!(json.get("threadId").is_none());
    }

    #[test]
    fn test_recipient_parse() {
        assert_eq!(
            Recipient::parse("reviewer@box").unwrap(),
            Recipient {
                agent: "reviewer".into(),
                host: Some("box".into())
            }
        );
        assert_eq!(Recipient::parse("solo").unwrap().host, None);
        assert!(Recipient::parse("@box").is_err());
        assert!(Recipient::parse("agent@").is_err());
    }

    #[test]
    fn test_filter_orders_newest_first_and_limits() {
        let mut old = MailboxMessage::new("a", "b", "old", "x", Priority::Low, MessageKind::Request);
        old.created_at = Utc::now() - chrono::Duration::minutes(5);
        let new = MailboxMessage::new("a", "b", "new", "x", Priority::Urgent, MessageKind::Request);

        let filter = MessageFilter {
            limit: Some(1),
            ..MessageFilter::default()
        };
        let out = filter.apply(vec![old.clone(), new.clone()]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].subject, "new");

        let urgent = MessageFilter {
            priority: Some(Priority::Urgent),
            ..MessageFilter::default()
        };
        assert_eq!(urgent.apply(vec![old, new]).len(), 1);
    }

    #[test]
    fn test_priority_parse() {
        assert_eq!("URGENT".parse::<Priority>().unwrap(), Priority::Urgent);
        assert!("meh".parse::<Priority>().is_err());
        assert!(Priority::Urgent > Priority::Low);
    }
}
