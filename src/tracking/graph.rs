use crate::core::{EntityId, Row};
use std::collections::{BTreeMap, HashMap};

/// Caller-visible entity: scalar values plus navigation handles.
///
/// Navigations hold `EntityId`s into the same arena, so cyclic graphs need
/// no shared ownership.
#[derive(Debug, Clone, Default)]
pub struct EntityData {
    pub(crate) entity_type: String,
    pub(crate) values: Row,
    // shadow values staged while the entity is not tracked
    pub(crate) detached_shadow: Row,
    pub(crate) references: BTreeMap<String, EntityId>,
    pub(crate) collections: BTreeMap<String, Vec<EntityId>>,
}

impl EntityData {
    pub fn entity_type(&self) -> &str {
        &self.entity_type
    }

    pub fn values(&self) -> &Row {
        &self.values
    }

    pub fn reference(&self, navigation: &str) -> Option<EntityId> {
        self.references.get(navigation).copied()
    }

    pub fn collection(&self, navigation: &str) -> &[EntityId] {
        self.collections
            .get(navigation)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Every navigation target, references first.
    pub(crate) fn navigation_targets(&self) -> Vec<(String, EntityId)> {
        let mut targets: Vec<(String, EntityId)> = self
            .references
            .iter()
            .map(|(nav, id)| (nav.clone(), *id))
            .collect();
        for (nav, ids) in &self.collections {
            targets.extend(ids.iter().map(|id| (nav.clone(), *id)));
        }
        targets
    }

    pub(crate) fn contains_target(&self, navigation: &str, target: EntityId) -> bool {
        self.reference(navigation) == Some(target) || self.collection(navigation).contains(&target)
    }

    pub(crate) fn remove_target(&mut self, navigation: &str, target: EntityId) {
        if self.references.get(navigation) == Some(&target) {
            self.references.remove(navigation);
        }
        if let Some(ids) = self.collections.get_mut(navigation) {
            ids.retain(|id| *id != target);
        }
    }

    pub(crate) fn push_target(&mut self, navigation: &str, target: EntityId) {
        let ids = self.collections.entry(navigation.to_string()).or_default();
        if !ids.contains(&target) {
            ids.push(target);
        }
    }
}

/// Owns every entity created through a context.
#[derive(Debug, Clone, Default)]
pub struct EntityArena {
    entities: HashMap<EntityId, EntityData>,
    // instances merged into an already tracked identity
    aliases: HashMap<EntityId, EntityId>,
    next_id: u64,
}

impl EntityArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, data: EntityData) -> EntityId {
        self.next_id += 1;
        let id = EntityId(self.next_id);
        self.entities.insert(id, data);
        id
    }

    /// Canonical handle for `id`, following merges.
    pub fn resolve(&self, id: EntityId) -> EntityId {
        let mut current = id;
        while let Some(next) = self.aliases.get(&current) {
            current = *next;
        }
        current
    }

    pub fn get(&self, id: EntityId) -> Option<&EntityData> {
        self.entities.get(&self.resolve(id))
    }

    pub fn get_mut(&mut self, id: EntityId) -> Option<&mut EntityData> {
        let id = self.resolve(id);
        self.entities.get_mut(&id)
    }

    pub fn contains(&self, id: EntityId) -> bool {
        self.entities.contains_key(&self.resolve(id))
    }

    /// Redirects `duplicate` to `canonical` and rewrites every navigation
    /// that pointed at the duplicate.
    pub fn merge(&mut self, duplicate: EntityId, canonical: EntityId) {
        if duplicate == canonical {
            return;
        }
        self.entities.remove(&duplicate);
        self.aliases.insert(duplicate, canonical);
        for data in self.entities.values_mut() {
            for target in data.references.values_mut() {
                if *target == duplicate {
                    *target = canonical;
                }
            }
            for ids in data.collections.values_mut() {
                let had_duplicate = ids.contains(&duplicate);
                ids.retain(|id| *id != duplicate);
                if had_duplicate && !ids.contains(&canonical) {
                    ids.push(canonical);
                }
            }
        }
    }

    /// Removes `target` from every navigation in the arena.
    pub fn unlink_everywhere(&mut self, target: EntityId) {
        for data in self.entities.values_mut() {
            data.references.retain(|_, id| *id != target);
            for ids in data.collections.values_mut() {
                ids.retain(|id| *id != target);
            }
        }
    }

    pub fn ids(&self) -> Vec<EntityId> {
        let mut ids: Vec<EntityId> = self.entities.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}
