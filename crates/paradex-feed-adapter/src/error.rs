/*
[INPUT]:  Error sources (transport, protocol frames, sequencing, heartbeat, auth)
[OUTPUT]: Structured error types with retry hints
[POS]:    Error handling layer - unified error types for entire crate
[UPDATE]: When adding new error sources or changing retry classification
*/

use std::time::Duration;

use thiserror::Error;

/// Main error type for the Paradex feed adapter
#[derive(Error, Debug)]
pub enum FeedError {
    /// Socket connect/read/write failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// Malformed frame or unexpected payload shape
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Delta sequence number not contiguous with the last accepted one
    #[error("Sequence gap on {symbol}: expected {expected}, received {received}")]
    SequenceGap {
        symbol: String,
        expected: u64,
        received: u64,
    },

    /// No traffic (or no transport pong) within the configured window
    #[error("Heartbeat timeout: {reason} after {elapsed:?}")]
    HeartbeatTimeout { reason: String, elapsed: Duration },

    /// Server rejected auth or a subscription
    #[error("Authentication failed (code {code}): {message}")]
    Auth { code: i64, message: String },

    /// Subscriptions were not confirmed in time
    #[error("Subscription not confirmed within {0:?}")]
    SubscribeTimeout(Duration),

    /// Serialization/deserialization failed
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// URL parsing failed
    #[error("Invalid URL: {0}")]
    UrlParse(#[from] url::ParseError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl FeedError {
    /// Check if the session should be retried after this error
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FeedError::Transport(_)
                | FeedError::HeartbeatTimeout { .. }
                | FeedError::SubscribeTimeout(_)
                | FeedError::Protocol(_)
                | FeedError::SequenceGap { .. }
        )
    }

    /// Check if error indicates authentication failure
    pub fn is_auth_error(&self) -> bool {
        matches!(self, FeedError::Auth { .. })
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for FeedError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        FeedError::Transport(err.to_string())
    }
}

impl From<crate::book::SequenceError> for FeedError {
    fn from(err: crate::book::SequenceError) -> Self {
        match err {
            crate::book::SequenceError::Gap {
                symbol,
                expected,
                received,
            } => FeedError::SequenceGap {
                symbol,
                expected,
                received,
            },
            other @ crate::book::SequenceError::NoBaseline { .. } => {
                FeedError::Protocol(other.to_string())
            }
        }
    }
}

/// Result type alias for feed operations
pub type Result<T> = std::result::Result<T, FeedError>;
