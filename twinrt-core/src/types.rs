//! Core type definitions for the twin runtime
//!
//! Identity, causal-chain and watch-key types shared by the actor,
//! mapper and manager modules.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

/// Property value held by an entity
pub type Value = serde_json::Value;

/// A flat property namespace: property key -> value
pub type PropertyMap = HashMap<String, Value>;

/// Separator between entity id and property key in a tentacle key
pub const WATCH_KEY_DELIMITER: char = '#';

/// Causal-chain token
///
/// Every message carries the id of the logical request that produced it.
/// Messages emitted while processing a request inherit its id, so the
/// whole propagation chain shares one token. Tokens compare by value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(pub String);

impl RequestId {
    /// Create a fresh, globally unique request id
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Wrap an existing id
    pub fn from_string(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the underlying string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req:{}", self.0)
    }
}

/// A watched property: `entity_id#property_key`
///
/// This is the key under which tentacles are indexed. Two entities can
/// expose the same property name without their tentacles colliding.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WatchKey {
    pub entity_id: String,
    pub property_key: String,
}

impl WatchKey {
    pub fn new(entity_id: impl Into<String>, property_key: impl Into<String>) -> Self {
        Self {
            entity_id: entity_id.into(),
            property_key: property_key.into(),
        }
    }

    /// Parse `entity#key`. Returns `None` when the delimiter is missing.
    pub fn parse(raw: &str) -> Option<Self> {
        let (entity_id, property_key) = raw.split_once(WATCH_KEY_DELIMITER)?;
        Some(Self::new(entity_id, property_key))
    }
}

impl fmt::Display for WatchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.entity_id, WATCH_KEY_DELIMITER, self.property_key)
    }
}

/// Current wall-clock time in unix milliseconds
pub(crate) fn unix_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
