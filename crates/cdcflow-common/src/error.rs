//! Error types for the CDC pipeline

use thiserror::Error;

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Main error type for the CDC pipeline
#[derive(Error, Debug)]
pub enum PipelineError {
    /// A blocked push or fetch was woken because the channel was closed.
    #[error("Channel closed")]
    ChannelClosed,

    #[error("All {channel_count} sub-channels already have a consumer")]
    ConsumerLimitExceeded { channel_count: usize },

    #[error("Unknown ack id: {0}")]
    UnknownAckId(String),

    #[error("Sink write failed: {0}")]
    SinkWrite(String),

    #[error("Position persistence failed for task {task}: {reason}")]
    PositionPersistence { task: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl PipelineError {
    /// Whether this error signals shutdown rather than a failure.
    ///
    /// Callers use this to tell a cancelled wait apart from a timeout or a real fault.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, PipelineError::ChannelClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_channel_closed_is_cancellation() {
        assert!(PipelineError::ChannelClosed.is_cancellation());
        assert!(!PipelineError::SinkWrite("boom".to_string()).is_cancellation());
        assert!(!PipelineError::ConsumerLimitExceeded { channel_count: 2 }.is_cancellation());
    }

    #[test]
    fn test_error_messages() {
        let err = PipelineError::ConsumerLimitExceeded { channel_count: 3 };
        assert_eq!(err.to_string(), "All 3 sub-channels already have a consumer");

        let err = PipelineError::PositionPersistence {
            task: "ds_0".to_string(),
            reason: "disk full".to_string(),
        };
        assert_eq!(err.to_string(), "Position persistence failed for task ds_0: disk full");
    }
}
