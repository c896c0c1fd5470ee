//! Runtime configuration parsing.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    ParseError(#[from] serde_yaml::Error),

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

/// Tunables for the entity manager and its actors
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Capacity of the manager's inbound message queue
    pub queue_capacity: usize,

    /// Maximum number of actor drain loops running at once
    pub worker_pool_size: usize,

    /// Initial mailbox capacity of each actor
    pub mailbox_capacity: usize,

    /// Upper bound the mailbox may grow to before messages are dropped
    pub mailbox_max_capacity: usize,

    /// Reentrant lock depth cap for one causal chain
    pub max_stack_depth: usize,
}

pub const DEFAULT_MAX_STACK_DEPTH: usize = 12;

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            worker_pool_size: 64,
            mailbox_capacity: 10,
            mailbox_max_capacity: 1024,
            max_stack_depth: DEFAULT_MAX_STACK_DEPTH,
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&contents)
    }

    /// Parse configuration from YAML text
    pub fn from_yaml(contents: &str) -> Result<Self, ConfigError> {
        let config: RuntimeConfig = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                field: "queue_capacity",
                reason: "must be positive".to_string(),
            });
        }
        if self.worker_pool_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "worker_pool_size",
                reason: "must be positive".to_string(),
            });
        }
        if self.mailbox_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                field: "mailbox_capacity",
                reason: "must be positive".to_string(),
            });
        }
        if self.mailbox_max_capacity < self.mailbox_capacity {
            return Err(ConfigError::InvalidValue {
                field: "mailbox_max_capacity",
                reason: format!(
                    "{} is below mailbox_capacity {}",
                    self.mailbox_max_capacity, self.mailbox_capacity
                ),
            });
        }
        Ok(())
    }
}
