//! Error types for the notification hub.

use thiserror::Error;

/// Main error type for hub operations.
#[derive(Debug, Error)]
pub enum NotifyError {
    /// Clean shutdown path. Never an operational failure.
    #[error("Operation cancelled")]
    Cancelled,

    #[error("Engine is already running or has stopped")]
    AlreadyRunning,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Update source {source_name} failed: {message}")]
    Source {
        source_name: String,
        message: String,
    },

    #[error("Update source {0} panicked")]
    SourcePanicked(String),

    #[error("Dispatch loop panicked")]
    DispatchPanicked,

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Topic not found: {0}")]
    TopicNotFound(String),

    #[error("Topic already exists: {0}")]
    TopicExists(String),

    #[error("Partition {partition} not found in topic {topic}")]
    PartitionNotFound { topic: String, partition: u32 },

    #[error("Offset {offset} is past the end of {topic}/{partition}")]
    OffsetOutOfRange {
        topic: String,
        partition: u32,
        offset: u64,
    },

    #[error("Log is closed")]
    LogClosed,

    #[error("Unauthenticated: {0}")]
    Unauthenticated(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl NotifyError {
    /// Build a source failure for the named source.
    pub fn source_failure(source_name: impl Into<String>, message: impl Into<String>) -> Self {
        NotifyError::Source {
            source_name: source_name.into(),
            message: message.into(),
        }
    }

    /// True if this error only signals that cancellation was observed.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, NotifyError::Cancelled)
    }
}

/// Failure to turn wire bytes into an [`Update`](crate::types::Update).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("malformed payload: {0}")]
    Malformed(String),

    #[error("unsupported update kind: {0}")]
    Unsupported(String),

    #[error("update has no body")]
    MissingBody,
}

impl From<rmp_serde::decode::Error> for DecodeError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        DecodeError::Malformed(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for NotifyError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        NotifyError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for NotifyError {
    fn from(e: serde_json::Error) -> Self {
        NotifyError::Serialization(e.to_string())
    }
}

/// Result type for hub operations.
pub type Result<T> = std::result::Result<T, NotifyError>;
