use thiserror::Error;

/// Errors originating from the mailbox layer.
///
/// Delivery failures are not errors: they are reported in a
/// [`crate::DeliveryReport`]. What remains here is lookup and persistence.
#[derive(Error, Debug)]
pub enum MailboxError {
    #[error("Message not found: {0}")]
    NotFound(String),

    #[error("Invalid recipient: {0}")]
    InvalidRecipient(String),

    #[error("Invalid agent id: {0}")]
    InvalidAgentId(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Network error: {0}")]
    Network(#[from] skillmesh_network::NetworkError),
}
