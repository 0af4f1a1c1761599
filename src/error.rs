//! Error types for the dispatch engine.

use thiserror::Error;

/// The main error type for notifyq.
#[derive(Error, Debug)]
pub enum DispatchError {
    /// The broker connection has not reported ready yet.
    #[error("Broker unavailable: {0}")]
    BrokerUnavailable(String),

    /// A handler failed, or panicked, while processing a job.
    #[error("Handler failure: {0}")]
    HandlerFailure(String),

    /// Closing a queue, worker or event subscription failed.
    #[error("Failed to close {resource}: {reason}")]
    ResourceClose { resource: String, reason: String },

    /// The queue handle was already closed.
    #[error("Queue closed: {0}")]
    QueueClosed(String),

    /// Redis command or connection error.
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// JSON serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result type alias using DispatchError.
pub type Result<T> = std::result::Result<T, DispatchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_broker_unavailable() {
        let err = DispatchError::BrokerUnavailable("connection not ready".to_string());
        assert_eq!(err.to_string(), "Broker unavailable: connection not ready");
    }

    #[test]
    fn test_error_display_resource_close() {
        let err = DispatchError::ResourceClose {
            resource: "worker message-group".to_string(),
            reason: "timeout".to_string(),
        };
        assert_eq!(err.to_string(), "Failed to close worker message-group: timeout");
    }

    #[test]
    fn test_error_from_serde_json() {
        let json_err = serde_json::from_str::<i32>("nope").unwrap_err();
        let err: DispatchError = json_err.into();
        assert!(matches!(err, DispatchError::Serialization(_)));
    }
}
