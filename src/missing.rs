//! Per-PG, per-peer missing set: objects a peer lacks at their needed
//! version, plus (when known) a source to recover from (spec §3, §4.5).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::types::{NodeId, ObjectId, Version};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct MissingItem {
    pub needed: Version,
    pub source: Option<NodeId>,
}

/// Objects missing on one member of a PG's acting set.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MissingSet {
    items: HashMap<ObjectId, MissingItem>,
}

impl MissingSet {
    pub fn new() -> Self {
        Self { items: HashMap::new() }
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn insert(&mut self, object: ObjectId, needed: Version, source: Option<NodeId>) {
        self.items.insert(object, MissingItem { needed, source });
    }

    pub fn remove(&mut self, object: &ObjectId) {
        self.items.remove(object);
    }

    pub fn get(&self, object: &ObjectId) -> Option<&MissingItem> {
        self.items.get(object)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ObjectId, &MissingItem)> {
        self.items.iter()
    }

    /// Merges another peer's missing set into this one, keeping the entry
    /// with the higher needed version when both name the same object
    /// (recovery must satisfy the stricter requirement).
    pub fn merge(&mut self, other: &MissingSet) {
        for (object, item) in other.items.iter() {
            match self.items.get(object) {
                Some(existing) if existing.needed >= item.needed => {}
                _ => {
                    self.items.insert(object.clone(), item.clone());
                }
            }
        }
    }

    /// Assigns a source peer to every item currently missing one, useful
    /// once peering has learned who holds the object (spec §4.5: "reads the
    /// latest version from a holder").
    pub fn assign_missing_sources(&mut self, default_source: NodeId) {
        for item in self.items.values_mut() {
            if item.source.is_none() {
                item.source = Some(default_source);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obj(name: &str) -> ObjectId {
        ObjectId::new(1, name, 0)
    }

    #[test]
    fn merge_keeps_the_higher_needed_version() {
        let mut a = MissingSet::new();
        a.insert(obj("x"), Version::new(1, 5), Some(10));
        let mut b = MissingSet::new();
        b.insert(obj("x"), Version::new(1, 9), Some(20));
        a.merge(&b);
        assert_eq!(a.get(&obj("x")).unwrap().needed, Version::new(1, 9));
    }

    #[test]
    fn empty_missing_set_means_clean() {
        let set = MissingSet::new();
        assert!(set.is_empty());
    }
}
