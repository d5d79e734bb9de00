use super::EntityState;
use crate::core::{EntityId, Key, Row, Value};
use std::collections::BTreeSet;

/// Tracking record for one entity.
///
/// Scalar current values live in the entity arena; the entry keeps the
/// state, the snapshot taken at the last synchronization with the store,
/// shadow property values and the explicit modified flags.
#[derive(Debug, Clone)]
pub struct Entry {
    pub(crate) entity: EntityId,
    pub(crate) entity_type: String,
    pub(crate) state: EntityState,
    pub(crate) original: Option<Row>,
    pub(crate) shadow: Row,
    pub(crate) modified: BTreeSet<String>,
    pub(crate) overridden: bool,
    // key under which the identity map indexes this entry
    pub(crate) key: Option<Key>,
}

impl Entry {
    pub(crate) fn new(entity: EntityId, entity_type: &str, state: EntityState, shadow: Row) -> Self {
        Self {
            entity,
            entity_type: entity_type.to_string(),
            state,
            original: None,
            shadow,
            modified: BTreeSet::new(),
            overridden: false,
            key: None,
        }
    }

    pub fn entity(&self) -> EntityId {
        self.entity
    }

    pub fn entity_type(&self) -> &str {
        &self.entity_type
    }

    pub fn state(&self) -> EntityState {
        self.state
    }

    /// Snapshot of persisted values; `None` for entries never read from or
    /// written to the store.
    pub fn original_values(&self) -> Option<&Row> {
        self.original.as_ref()
    }

    pub fn original_value(&self, property: &str) -> Option<&Value> {
        self.original.as_ref()?.get(property)
    }

    pub fn shadow_values(&self) -> &Row {
        &self.shadow
    }

    pub fn modified_properties(&self) -> impl Iterator<Item = &str> + '_ {
        self.modified.iter().map(String::as_str)
    }

    pub fn is_modified(&self, property: &str) -> bool {
        self.modified.contains(property)
    }

    /// The state was forced by the caller; change detection skips the entry
    /// until the next successful save.
    pub fn is_overridden(&self) -> bool {
        self.overridden
    }

    pub fn key(&self) -> Option<&Key> {
        self.key.as_ref()
    }

    pub(crate) fn accept(&mut self, current: Row) {
        self.state = EntityState::Unchanged;
        self.original = Some(current);
        self.modified.clear();
        self.overridden = false;
    }
}
