use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    #[error("Invalid message format: {0}")]
    InvalidMessage(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Invalid key material: {0}")]
    InvalidKey(String),

    #[error("Keystore error: {0}")]
    Keystore(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
