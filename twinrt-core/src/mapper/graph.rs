//! Entity dependency graph built from registered mappers
//!
//! Edges run from each source entity to the mapper's target. A mapper whose
//! source is its own target only adds a self loop, which is allowed; the
//! reentrant lock depth cap bounds that recursion at runtime. A loop through
//! two or more distinct entities is rejected at registration.
//!
//! Registrations are keyed by `(target, mapper id)`, matching how mappers
//! are installed: each target entity owns its own mapper table.

use super::Mapper;
use crate::error::MapperError;
use std::collections::{BTreeMap, BTreeSet, HashMap};

type MapperKey = (String, String);

#[derive(Debug, Default)]
pub struct MapperGraph {
    /// (target, mapper id) -> sources
    mappers: HashMap<MapperKey, Vec<String>>,
}

impl MapperGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `mapper`, replacing an earlier registration of the same id
    /// on the same target.
    ///
    /// Fails without changing the graph when the mapper would close a cycle
    /// between distinct entities.
    pub fn insert(&mut self, mapper: &Mapper) -> Result<(), MapperError> {
        mapper.validate()?;

        let target = &mapper.target_entity;
        let key = (target.clone(), mapper.id.clone());
        let edges = self.edges_without(&key);

        for source in mapper.source_entities() {
            if &source == target {
                continue;
            }
            // source -> target closes a cycle iff target already reaches source
            if let Some(mut path) = find_path(&edges, target, &source) {
                path.push(target.clone());
                return Err(MapperError::Cycle {
                    mapper_id: mapper.id.clone(),
                    path,
                });
            }
        }

        self.mappers.insert(key, mapper.source_entities());
        Ok(())
    }

    /// Forget the mapper `mapper_id` installed on `target`. Returns whether
    /// it was registered there.
    pub fn remove(&mut self, target: &str, mapper_id: &str) -> bool {
        self.mappers
            .remove(&(target.to_string(), mapper_id.to_string()))
            .is_some()
    }

    pub fn contains(&self, target: &str, mapper_id: &str) -> bool {
        self.mappers
            .contains_key(&(target.to_string(), mapper_id.to_string()))
    }

    pub fn len(&self) -> usize {
        self.mappers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mappers.is_empty()
    }

    fn edges_without(&self, skip: &MapperKey) -> BTreeMap<&str, BTreeSet<&str>> {
        let mut edges: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
        for (key, sources) in &self.mappers {
            if key == skip {
                continue;
            }
            let target = key.0.as_str();
            for source in sources {
                if source != target {
                    edges.entry(source.as_str()).or_default().insert(target);
                }
            }
        }
        edges
    }
}

/// Depth-first search for a path `from -> ... -> to`
fn find_path(edges: &BTreeMap<&str, BTreeSet<&str>>, from: &str, to: &str) -> Option<Vec<String>> {
    let mut visited = BTreeSet::new();
    let mut stack = vec![(from, vec![from.to_string()])];

    while let Some((node, path)) = stack.pop() {
        if node == to {
            return Some(path);
        }
        if !visited.insert(node) {
            continue;
        }
        for &next in edges.get(node).into_iter().flatten() {
            if !visited.contains(next) {
                let mut extended = path.clone();
                extended.push(next.to_string());
                stack.push((next, extended));
            }
        }
    }
    None
}
