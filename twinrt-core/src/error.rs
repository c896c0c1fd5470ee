//! Error types for the twin runtime

use thiserror::Error;

/// Top-level runtime error
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Reentrant lock errors
    #[error("Lock error: {0}")]
    Lock(#[from] LockError),

    /// Mailbox errors
    #[error("Mailbox error: {0}")]
    Mailbox(#[from] MailboxError),

    /// Mapper registration or execution errors
    #[error("Mapper error: {0}")]
    Mapper(#[from] MapperError),

    /// Storage collaborator errors
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Invalid runtime configuration
    #[error("Config error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Actor could not be constructed during rebalance
    #[error("Actor construction failed for {id}: {reason}")]
    Construction { id: String, reason: String },

    /// Message kind the receiving actor cannot handle
    #[error("Unknown message type {kind} for actor {id}")]
    UnknownMessage { id: String, kind: &'static str },

    /// Publisher collaborator errors
    #[error("Publish failed on {topic}: {reason}")]
    Publish { topic: String, reason: String },

    /// Manager lifecycle errors
    #[error("Manager error: {0}")]
    Manager(String),
}

/// Reentrant lock errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LockError {
    /// The same causal chain re-entered more often than allowed
    #[error("maximum stack depth exceeded (max {max})")]
    MaxStackDepthExceeded { max: usize },

    /// The underlying permit source was closed
    #[error("lock closed")]
    Closed,
}

/// Mailbox errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MailboxError {
    /// The mailbox is full
    #[error("mailbox queue full (capacity {capacity})")]
    Overflow { capacity: usize },

    /// Shrinking is not supported
    #[error("resize invalid size: {requested} < {current}")]
    InvalidResize { current: usize, requested: usize },
}

/// Mapper errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MapperError {
    /// Registration would close a dependency cycle between entities
    #[error("mapper {mapper_id} closes a dependency cycle: {}", path.join(" -> "))]
    Cycle { mapper_id: String, path: Vec<String> },

    /// Malformed mapper record
    #[error("invalid mapper: {0}")]
    Invalid(String),

    /// The executor failed to compute an output
    #[error("mapper {mapper_id} execution failed: {reason}")]
    Exec { mapper_id: String, reason: String },
}

/// Storage collaborator errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("entity {0} unavailable")]
    Unavailable(String),

    #[error("decode entity record: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Result type using RuntimeError
pub type Result<T> = std::result::Result<T, RuntimeError>;
