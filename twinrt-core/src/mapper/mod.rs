//! Mappers and their dependency edges
//!
//! A [`Mapper`] computes properties of its target entity from properties of
//! one or more source entities. The runtime never evaluates mapper
//! expressions itself; it only needs to know which `(source, key)` pairs a
//! mapper watches, and hands the actual computation to a [`MapperExecutor`].
//!
//! ```text
//!   device2#temp ──┐
//!                  ├──► mapper calc1-m1 ──► calc1 (own namespace)
//!   device3#hum  ──┘
//! ```

mod graph;
mod tentacle;

pub use graph::MapperGraph;
pub use tentacle::{merge_tentacles, Tentacle, TentacleKind};

use crate::error::MapperError;
use crate::types::{PropertyMap, Value, WatchKey};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Declarative dependency record
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Mapper {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Entity whose properties this mapper computes
    pub target_entity: String,
    /// Property keys watched per source entity
    #[serde(default)]
    pub tentacles: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub version: i64,
}

impl Mapper {
    pub fn new(id: impl Into<String>, target_entity: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            target_entity: target_entity.into(),
            ..Self::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Watch `keys` on `source`, appending to any keys already watched there
    pub fn with_source<I, S>(mut self, source: impl Into<String>, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tentacles
            .entry(source.into())
            .or_default()
            .extend(keys.into_iter().map(Into::into));
        self
    }

    /// Source entity ids, sorted
    pub fn source_entities(&self) -> Vec<String> {
        self.tentacles.keys().cloned().collect()
    }

    /// Property keys watched on `source`
    pub fn keys_for(&self, source: &str) -> &[String] {
        self.tentacles
            .get(source)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Every watched `(source, key)` pair, sorted and without repeats
    pub fn watch_keys(&self) -> Vec<WatchKey> {
        let keys: BTreeSet<WatchKey> = self
            .tentacles
            .iter()
            .flat_map(|(source, keys)| keys.iter().map(move |key| WatchKey::new(source, key)))
            .collect();
        keys.into_iter().collect()
    }

    /// The edge that marks this mapper dirty when a watched pair changes
    pub fn tentacle(&self) -> Tentacle {
        Tentacle::to_mapper(&self.id, self.watch_keys()).with_version(self.version)
    }

    /// Check the record is usable
    pub fn validate(&self) -> Result<(), MapperError> {
        if self.id.is_empty() {
            return Err(MapperError::Invalid("mapper id is empty".to_string()));
        }
        if self.target_entity.is_empty() {
            return Err(MapperError::Invalid(format!(
                "mapper {} has no target entity",
                self.id
            )));
        }
        if let Some((source, _)) = self.tentacles.iter().find(|(s, _)| s.is_empty()) {
            return Err(MapperError::Invalid(format!(
                "mapper {} has a source with an empty id ({:?})",
                self.id, source
            )));
        }
        Ok(())
    }
}

/// Input handed to an executor: `entity#key -> value` for every watched
/// pair whose value is currently known
pub type MapperInput = HashMap<String, Value>;

/// Computes a mapper's output properties
///
/// Implementations hold the expression engine. Returned properties are
/// written into the target entity's own namespace.
pub trait MapperExecutor: Send + Sync {
    fn execute(&self, mapper: &Mapper, input: &MapperInput) -> Result<PropertyMap, MapperError>;
}

/// Executor that computes nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopExecutor;

impl MapperExecutor for NoopExecutor {
    fn execute(&self, _mapper: &Mapper, _input: &MapperInput) -> Result<PropertyMap, MapperError> {
        Ok(PropertyMap::new())
    }
}

/// Executor backed by a closure
pub struct FnExecutor<F>(pub F);

impl<F> MapperExecutor for FnExecutor<F>
where
    F: Fn(&Mapper, &MapperInput) -> Result<PropertyMap, MapperError> + Send + Sync,
{
    fn execute(&self, mapper: &Mapper, input: &MapperInput) -> Result<PropertyMap, MapperError> {
        (self.0)(mapper, input)
    }
}
