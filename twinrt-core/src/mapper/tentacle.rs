//! Tentacles: dependency edges from a watched property to a counterpart

use crate::types::WatchKey;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// What a tentacle points at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TentacleKind {
    /// Forward the raw value to another entity
    ToEntity,
    /// Mark a mapper for recomputation
    ToMapper,
}

impl fmt::Display for TentacleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TentacleKind::ToEntity => write!(f, "entity"),
            TentacleKind::ToMapper => write!(f, "mapper"),
        }
    }
}

/// A directed dependency edge
///
/// A tentacle targets exactly one counterpart (an entity id or a mapper id)
/// and fires when any of its watched items changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tentacle {
    kind: TentacleKind,
    target_id: String,
    items: Vec<WatchKey>,
    version: i64,
}

impl Tentacle {
    pub fn new(kind: TentacleKind, target_id: impl Into<String>, items: Vec<WatchKey>) -> Self {
        Self {
            kind,
            target_id: target_id.into(),
            items,
            version: 0,
        }
    }

    /// Tentacle forwarding `items` to entity `target_id`
    pub fn to_entity(target_id: impl Into<String>, items: Vec<WatchKey>) -> Self {
        Self::new(TentacleKind::ToEntity, target_id, items)
    }

    /// Tentacle activating mapper `mapper_id` when any of `items` changes
    pub fn to_mapper(mapper_id: impl Into<String>, items: Vec<WatchKey>) -> Self {
        Self::new(TentacleKind::ToMapper, mapper_id, items)
    }

    pub fn with_version(mut self, version: i64) -> Self {
        self.version = version;
        self
    }

    pub fn kind(&self) -> TentacleKind {
        self.kind
    }

    pub fn target_id(&self) -> &str {
        &self.target_id
    }

    pub fn items(&self) -> &[WatchKey] {
        &self.items
    }

    pub fn version(&self) -> i64 {
        self.version
    }

    /// Property keys of the watched items, in item order
    pub fn property_keys(&self) -> Vec<String> {
        self.items
            .iter()
            .map(|item| item.property_key.clone())
            .collect()
    }
}

impl fmt::Display for Tentacle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{} [", self.kind, self.target_id)?;
        for (i, item) in self.items.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", item)?;
        }
        write!(f, "]")
    }
}

/// Merge tentacles aimed at one counterpart into a single tentacle.
///
/// Items are unioned without duplicates and sorted; the result takes the
/// kind and target of the first tentacle and a version one past the
/// highest input. Tentacles aimed elsewhere are skipped.
pub fn merge_tentacles<'a, I>(tentacles: I) -> Option<Tentacle>
where
    I: IntoIterator<Item = &'a Tentacle>,
{
    let mut iter = tentacles.into_iter();
    let first = iter.next()?;

    let mut items: BTreeSet<WatchKey> = first.items.iter().cloned().collect();
    let mut version = first.version;

    for tentacle in iter {
        if tentacle.kind != first.kind || tentacle.target_id != first.target_id {
            tracing::warn!(
                expected = %first.target_id,
                found = %tentacle.target_id,
                "skipping tentacle aimed at another counterpart"
            );
            continue;
        }
        items.extend(tentacle.items.iter().cloned());
        version = version.max(tentacle.version);
    }

    Some(Tentacle {
        kind: first.kind,
        target_id: first.target_id.clone(),
        items: items.into_iter().collect(),
        version: version + 1,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn keys(entity: &str, props: &[&str]) -> Vec<WatchKey> {
        props.iter().map(|p| WatchKey::new(entity, *p)).collect()
    }

    #[test]
    fn test_tentacle_target() {
        let tentacle = Tentacle::to_entity("device123", keys("device234", &["temp"]));
        assert_eq!(tentacle.target_id(), "device123");
        assert_eq!(tentacle.kind(), TentacleKind::ToEntity);
        assert_eq!(tentacle.property_keys(), vec!["temp".to_string()]);
    }

    #[test]
    fn test_merge_empty() {
        assert!(merge_tentacles(std::iter::empty()).is_none());
    }

    #[test]
    fn test_merge_deduplicates_items() {
        let a = Tentacle::to_entity("calc1", keys("device2", &["temp", "hum"])).with_version(3);
        let b = Tentacle::to_entity("calc1", keys("device2", &["temp", "light"])).with_version(5);

        let merged = merge_tentacles([&a, &b]).unwrap();
        assert_eq!(merged.target_id(), "calc1");
        assert_eq!(
            merged.property_keys(),
            vec!["hum".to_string(), "light".to_string(), "temp".to_string()]
        );
        assert_eq!(merged.version(), 6);
    }

    #[test]
    fn test_merge_skips_other_counterparts() {
        let a = Tentacle::to_entity("calc1", keys("device2", &["temp"]));
        let b = Tentacle::to_entity("calc2", keys("device2", &["hum"]));

        let merged = merge_tentacles([&a, &b]).unwrap();
        assert_eq!(merged.items(), keys("device2", &["temp"]).as_slice());
    }

    #[test]
    fn test_display() {
        let t = Tentacle::to_mapper("calc1-m1", keys("device2", &["temp", "hum"]));
        assert_eq!(t.to_string(), "mapper->calc1-m1 [device2#temp, device2#hum]");
    }

    proptest! {
        #[test]
        fn prop_merge_has_no_duplicates(
            a in proptest::collection::vec("[a-d]", 0..8),
            b in proptest::collection::vec("[a-d]", 0..8),
        ) {
            let ta = Tentacle::to_entity("t", a.iter().map(|k| WatchKey::new("s", k.as_str())).collect());
            let tb = Tentacle::to_entity("t", b.iter().map(|k| WatchKey::new("s", k.as_str())).collect());

            let merged = merge_tentacles([&ta, &tb]).unwrap();
            let unique: BTreeSet<_> = merged.items().iter().cloned().collect();
            prop_assert_eq!(unique.len(), merged.items().len());

            let expected: BTreeSet<_> = a.iter().chain(b.iter()).cloned().collect();
            let got: BTreeSet<_> = merged.property_keys().into_iter().collect();
            prop_assert_eq!(got, expected);
        }
    }
}
