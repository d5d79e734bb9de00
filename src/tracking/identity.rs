use super::Entry;
use crate::config::IdentityResolution;
use crate::core::{EntityId, Key, Result, TrackError};
use std::collections::HashMap;

/// Outcome of registering an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// A new entry was created for the instance.
    Tracked(EntityId),
    /// Another instance already holds the key; it stays canonical.
    Merged(EntityId),
}

impl Registration {
    pub fn entity(&self) -> EntityId {
        match self {
            Registration::Tracked(id) | Registration::Merged(id) => *id,
        }
    }
}

/// One entry per tracked entity, and at most one entity per
/// (hierarchy root, key).
#[derive(Debug, Clone, Default)]
pub struct IdentityMap {
    entries: HashMap<EntityId, Entry>,
    by_key: HashMap<(String, Key), EntityId>,
    // registration order, used to keep plans deterministic
    order: Vec<EntityId>,
}

impl IdentityMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resolve(&self, root: &str, key: &Key) -> Option<EntityId> {
        self.by_key.get(&(root.to_string(), key.clone())).copied()
    }

    /// Adds `entry`, indexing it under `key` when one is given.
    pub fn register(
        &mut self,
        mut entry: Entry,
        root: &str,
        key: Option<Key>,
        policy: IdentityResolution,
    ) -> Result<Registration> {
        if let Some(key) = key.filter(Key::is_set) {
            let slot = (root.to_string(), key.clone());
            if let Some(existing) = self.by_key.get(&slot) {
                if *existing == entry.entity {
                    return Ok(Registration::Merged(*existing));
                }
                return match policy {
                    IdentityResolution::Merge => Ok(Registration::Merged(*existing)),
                    IdentityResolution::Reject => Err(TrackError::DuplicateIdentity {
                        entity_type: entry.entity_type.clone(),
                        key,
                    }),
                };
            }
            self.by_key.insert(slot, entry.entity);
            entry.key = Some(key);
        }
        let id = entry.entity;
        self.order.push(id);
        self.entries.insert(id, entry);
        Ok(Registration::Tracked(id))
    }

    /// Re-indexes an entry whose key became known or changed.
    pub fn rekey(&mut self, id: EntityId, root: &str, key: Key) -> Result<()> {
        let slot = (root.to_string(), key.clone());
        if let Some(existing) = self.by_key.get(&slot)
            && *existing != id
        {
            let entity_type = self
                .entries
                .get(&id)
                .map(|e| e.entity_type.clone())
                .unwrap_or_default();
            return Err(TrackError::DuplicateIdentity { entity_type, key });
        }
        let entry = self
            .entries
            .get_mut(&id)
            .ok_or(TrackError::EntityNotFound(id))?;
        if let Some(old) = entry.key.take() {
            self.by_key.remove(&(root.to_string(), old));
        }
        if key.is_set() {
            self.by_key.insert(slot, id);
            entry.key = Some(key);
        }
        Ok(())
    }

    pub fn forget(&mut self, id: EntityId, root: &str) -> Option<Entry> {
        let entry = self.entries.remove(&id)?;
        if let Some(key) = &entry.key {
            self.by_key.remove(&(root.to_string(), key.clone()));
        }
        self.order.retain(|tracked| *tracked != id);
        Some(entry)
    }

    pub fn get(&self, id: EntityId) -> Option<&Entry> {
        self.entries.get(&id)
    }

    pub fn get_mut(&mut self, id: EntityId) -> Option<&mut Entry> {
        self.entries.get_mut(&id)
    }

    pub fn contains(&self, id: EntityId) -> bool {
        self.entries.contains_key(&id)
    }

    /// Tracked handles in registration order.
    pub fn ids(&self) -> Vec<EntityId> {
        self.order.clone()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Entry> + '_ {
        self.order.iter().filter_map(|id| self.entries.get(id))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Row;
    use crate::tracking::EntityState;

    fn entry(id: u64) -> Entry {
        Entry::new(EntityId(id), "Player", EntityState::Unchanged, Row::new())
    }

    #[test]
    fn test_register_and_resolve() {
        let mut map = IdentityMap::new();
        let reg = map
            .register(entry(1), "Player", Some(Key::single(5)), IdentityResolution::Merge)
            .unwrap();
        assert_eq!(reg, Registration::Tracked(EntityId(1)));
        assert_eq!(map.resolve("Player", &Key::single(5)), Some(EntityId(1)));
        assert_eq!(map.get(EntityId(1)).unwrap().key(), Some(&Key::single(5)));
    }

    #[test]
    fn test_duplicate_key_merges_or_rejects() {
        let mut map = IdentityMap::new();
        map.register(entry(1), "Player", Some(Key::single(5)), IdentityResolution::Merge)
            .unwrap();

        let merged = map
            .register(entry(2), "Player", Some(Key::single(5)), IdentityResolution::Merge)
            .unwrap();
        assert_eq!(merged, Registration::Merged(EntityId(1)));
        assert_eq!(map.len(), 1);

        let err = map
            .register(entry(3), "Player", Some(Key::single(5)), IdentityResolution::Reject)
            .unwrap_err();
        assert!(matches!(err, TrackError::DuplicateIdentity { .. }));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_unset_keys_are_not_indexed() {
        let mut map = IdentityMap::new();
        map.register(entry(1), "Player", Some(Key::single(0)), IdentityResolution::Reject)
            .unwrap();
        map.register(entry(2), "Player", Some(Key::single(0)), IdentityResolution::Reject)
            .unwrap();
        assert_eq!(map.len(), 2);
        assert_eq!(map.resolve("Player", &Key::single(0)), None);

        map.rekey(EntityId(2), "Player", Key::single(9)).unwrap();
        assert_eq!(map.resolve("Player", &Key::single(9)), Some(EntityId(2)));
        assert!(map.rekey(EntityId(1), "Player", Key::single(9)).is_err());
    }

    #[test]
    fn test_forget() {
        let mut map = IdentityMap::new();
        map.register(entry(1), "Player", Some(Key::single(5)), IdentityResolution::Merge)
            .unwrap();
        assert!(map.forget(EntityId(1), "Player").is_some());
        assert!(map.is_empty());
        assert_eq!(map.resolve("Player", &Key::single(5)), None);
        assert!(map.ids().is_empty());
    }
}
