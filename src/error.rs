//! Error types for the streaming feed core

use thiserror::Error;

/// Streaming feed errors
///
/// Cloneable so that one failure can be fanned out to every consumer
/// attached to a feed queue.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FeedError {
    #[error("WebSocket connection error: {0}")]
    Connection(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Connection timeout")]
    ConnectionTimeout,

    #[error("Max reconnection attempts exceeded ({0})")]
    MaxReconnectAttemptsExceeded(u32),

    #[error("Failed to decode frame: {reason}")]
    Decode { raw: String, reason: String },

    #[error("Subscription to {key} failed: {reason}")]
    Subscribe { key: String, reason: String },

    #[error("Order book precondition violated: {0}")]
    ReconstructionPrecondition(String),

    #[error("REST API error: {0}")]
    RestApi(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl FeedError {
    /// Build a decode failure carrying the offending frame
    pub fn decode(raw: impl Into<String>, reason: impl ToString) -> Self {
        FeedError::Decode {
            raw: raw.into(),
            reason: reason.to_string(),
        }
    }

    /// Whether this error ends every consumer of the connection
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            FeedError::Connection(_)
                | FeedError::ConnectionClosed
                | FeedError::MaxReconnectAttemptsExceeded(_)
        )
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for FeedError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        FeedError::Connection(err.to_string())
    }
}

impl From<serde_json::Error> for FeedError {
    fn from(err: serde_json::Error) -> Self {
        FeedError::Serialization(err.to_string())
    }
}

impl From<reqwest::Error> for FeedError {
    fn from(err: reqwest::Error) -> Self {
        FeedError::RestApi(err.to_string())
    }
}

impl From<std::io::Error> for FeedError {
    fn from(err: std::io::Error) -> Self {
        FeedError::Connection(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, FeedError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_classification() {
        assert!(FeedError::ConnectionClosed.is_terminal());
        assert!(FeedError::MaxReconnectAttemptsExceeded(10).is_terminal());
        assert!(!FeedError::decode("x", "bad").is_terminal());
        assert!(!FeedError::ReconstructionPrecondition("delta".into()).is_terminal());
    }
}
