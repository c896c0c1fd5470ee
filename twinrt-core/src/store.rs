//! Durable storage collaborator
//!
//! The runtime keeps entity state in memory. A store is only consulted when
//! an actor is constructed during rebalance, and only its base fields are
//! hydrated; property namespaces always start empty.

use crate::error::StoreError;
use crate::types::PropertyMap;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Persisted entity record
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EntityRecord {
    pub id: String,
    /// Actor variant (`entity`, `subscription`)
    #[serde(rename = "type")]
    pub kind: String,
    pub owner: String,
    pub source: String,
    pub version: i64,
    pub last_time: i64,
    /// Construction parameters; subscriptions read their settings here
    pub properties: PropertyMap,
}

impl EntityRecord {
    pub fn new(id: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            ..Self::default()
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, StoreError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Lookup of persisted entity records
#[async_trait]
pub trait EntityStore: Send + Sync {
    /// Fetch the record for `id`; `Ok(None)` means the entity is new
    async fn load(&self, id: &str) -> Result<Option<EntityRecord>, StoreError>;
}

/// Store with nothing in it
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopStore;

#[async_trait]
impl EntityStore for NoopStore {
    async fn load(&self, _id: &str) -> Result<Option<EntityRecord>, StoreError> {
        Ok(None)
    }
}

/// In-memory store holding JSON-encoded records
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<String, Vec<u8>>>,
    unavailable: RwLock<HashSet<String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, record: &EntityRecord) -> Result<(), StoreError> {
        let bytes = record.encode()?;
        self.records.write().insert(record.id.clone(), bytes);
        Ok(())
    }

    /// Store raw bytes under `id` without validating them
    pub fn insert_raw(&self, id: impl Into<String>, bytes: Vec<u8>) {
        self.records.write().insert(id.into(), bytes);
    }

    /// Make every load of `id` fail
    pub fn mark_unavailable(&self, id: impl Into<String>) {
        self.unavailable.write().insert(id.into());
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

#[async_trait]
impl EntityStore for MemoryStore {
    async fn load(&self, id: &str) -> Result<Option<EntityRecord>, StoreError> {
        if self.unavailable.read().contains(id) {
            return Err(StoreError::Unavailable(id.to_string()));
        }

        let bytes = match self.records.read().get(id) {
            Some(bytes) => bytes.clone(),
            None => return Ok(None),
        };
        EntityRecord::decode(&bytes).map(Some)
    }
}
