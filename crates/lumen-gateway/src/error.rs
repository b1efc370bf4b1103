//! Gateway-related errors

use std::time::Duration;

use crate::client::ClientId;

/// Errors raised by a transport adapter.
#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error("connection closed")]
    Closed,
    #[error("write timed out after {0:?}")]
    Timeout(Duration),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// Errors raised by the outbound queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("queue closed")]
    Closed,
    #[error("queue full")]
    Full,
}

/// Errors raised by a key-value / pub-sub backend.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Address parse error: {0}")]
    AddrParse(#[from] std::net::AddrParseError),
    #[error("Adapter error: {0}")]
    Adapter(#[from] AdapterError),
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("Client closed: {0}")]
    ClientClosed(ClientId),
    #[error("Handshake timed out after {0:?}")]
    HandshakeTimeout(std::time::Duration),
    #[error("Unauthorized: {0}")]
    Unauthorized(String),
    #[error("Channel not found: {0}")]
    ChannelNotFound(String),
    #[error("Persistence error: {0}")]
    Persistence(String),
    #[error("Group lookup error: {0}")]
    GroupLookup(String),
}

pub type GatewayResult<T> = std::result::Result<T, GatewayError>;

impl GatewayError {
    /// True when the client's outbound queue rejected a non-blocking write.
    pub fn is_queue_full(&self) -> bool {
        matches!(self, GatewayError::Queue(QueueError::Full))
    }
}
