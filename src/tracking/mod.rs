// ============================================================================
// Change Tracking
// ============================================================================
//
// The unit of work's in-memory side:
//
// - `graph`     arena of caller entities addressed by `EntityId`
// - `identity`  one entry per (hierarchy root, key)
// - `entry`     state, snapshot, shadow values and modified flags
// - `state`     lifecycle transitions
// - `detector`  snapshot diffing
// - `fixup`     graph traversal, FK synchronization, severing, cascades
// - `visitor`   caller hook for custom state assignment during traversal
//
// Single owner, no internal locking: every mutating method takes `&mut self`.
//
// ============================================================================

pub mod detector;
pub mod entry;
pub mod fixup;
pub mod graph;
pub mod identity;
pub mod state;
pub mod visitor;

pub use entry::Entry;
pub use fixup::Intent;
pub use graph::{EntityArena, EntityData};
pub use identity::{IdentityMap, Registration};
pub use state::{EntityState, Transition};
pub use visitor::{GraphNode, GraphVisitor};

use crate::config::ContextConfig;
use crate::core::{EntityId, Key, Result, Row, TrackError, Value};
use crate::model::{EntityType, Model, Relationship};
use std::sync::Arc;
use tracing::debug;

pub(crate) fn key_from(properties: &[String], values: &Row) -> Key {
    Key::new(
        properties
            .iter()
            .map(|p| values.get(p).cloned().unwrap_or(Value::Null))
            .collect(),
    )
}

/// Identity map, entries and entity arena of one unit of work.
#[derive(Debug)]
pub struct ChangeTracker {
    pub(crate) model: Arc<Model>,
    pub(crate) config: ContextConfig,
    pub(crate) arena: EntityArena,
    pub(crate) identity: IdentityMap,
    // principals removed under `CascadeTiming::OnSave`
    pub(crate) pending_cascades: Vec<EntityId>,
}

/// Mutable tracking state captured before a save applies deferred cascades.
#[derive(Debug)]
pub(crate) struct Checkpoint {
    arena: EntityArena,
    identity: IdentityMap,
    pending_cascades: Vec<EntityId>,
}

impl ChangeTracker {
    pub fn new(model: Arc<Model>, config: ContextConfig) -> Self {
        Self {
            model,
            config,
            arena: EntityArena::new(),
            identity: IdentityMap::new(),
            pending_cascades: Vec::new(),
        }
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    /// Captures entries and entities while cascades deferred to save are
    /// pending; `None` when there is nothing save would mutate ahead of the
    /// transaction.
    pub(crate) fn checkpoint(&self) -> Option<Checkpoint> {
        if self.pending_cascades.is_empty() {
            return None;
        }
        Some(Checkpoint {
            arena: self.arena.clone(),
            identity: self.identity.clone(),
            pending_cascades: self.pending_cascades.clone(),
        })
    }

    pub(crate) fn restore(&mut self, checkpoint: Checkpoint) {
        self.arena = checkpoint.arena;
        self.identity = checkpoint.identity;
        self.pending_cascades = checkpoint.pending_cascades;
        debug!("tracking state restored after failed save");
    }

    // ------------------------------------------------------------------
    // Entities
    // ------------------------------------------------------------------

    /// New untracked instance with every property NULL and the
    /// discriminator preset.
    pub fn create(&mut self, entity_type: &str) -> Result<EntityId> {
        let model = Arc::clone(&self.model);
        let ty = model.require_type(entity_type)?;
        let mut data = EntityData {
            entity_type: ty.name().to_string(),
            ..Default::default()
        };
        for property in ty.properties() {
            if property.is_shadow() {
                data.detached_shadow.insert(property.name().to_string(), Value::Null);
            } else {
                data.values.insert(property.name().to_string(), Value::Null);
            }
        }
        if let (Some(column), Some(value)) = (ty.discriminator(), ty.discriminator_value()) {
            data.values.insert(column.to_string(), value.clone());
        }
        Ok(self.arena.insert(data))
    }

    pub fn entity(&self, id: EntityId) -> Option<&EntityData> {
        self.arena.get(id)
    }

    pub(crate) fn data(&self, id: EntityId) -> Result<&EntityData> {
        self.arena.get(id).ok_or(TrackError::EntityNotFound(id))
    }

    pub(crate) fn type_of(&self, id: EntityId) -> Result<&EntityType> {
        let name = &self.data(id)?.entity_type;
        self.model.require_type(name)
    }

    /// Canonical handle after identity merges.
    pub fn resolve(&self, id: EntityId) -> EntityId {
        self.arena.resolve(id)
    }

    // ------------------------------------------------------------------
    // Values
    // ------------------------------------------------------------------

    pub fn value(&self, id: EntityId, property: &str) -> Result<Value> {
        let id = self.arena.resolve(id);
        let data = self.data(id)?;
        let ty = self.model.require_type(&data.entity_type)?;
        let prop = ty
            .property(property)
            .ok_or_else(|| TrackError::UnknownProperty {
                entity_type: ty.name().to_string(),
                property: property.to_string(),
            })?;
        let source = if !prop.is_shadow() {
            &data.values
        } else if let Some(entry) = self.identity.get(id) {
            &entry.shadow
        } else {
            &data.detached_shadow
        };
        Ok(source.get(property).cloned().unwrap_or(Value::Null))
    }

    /// Current values of every property, shadows included.
    pub fn current_values(&self, id: EntityId) -> Result<Row> {
        let id = self.arena.resolve(id);
        let data = self.data(id)?;
        let mut row = data.values.clone();
        let shadow = match self.identity.get(id) {
            Some(entry) => &entry.shadow,
            None => &data.detached_shadow,
        };
        row.extend(shadow.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(row)
    }

    /// Raw access to the entity's scalar values. Edits made here are only
    /// noticed by change detection.
    pub fn values_mut(&mut self, id: EntityId) -> Result<&mut Row> {
        self.arena
            .get_mut(id)
            .map(|data| &mut data.values)
            .ok_or(TrackError::EntityNotFound(id))
    }

    /// Writes a property and marks it modified right away when the entity is
    /// tracked and the value differs from its snapshot.
    pub fn set_value(&mut self, id: EntityId, property: &str, value: impl Into<Value>) -> Result<()> {
        let id = self.arena.resolve(id);
        let value = value.into();
        let model = Arc::clone(&self.model);
        let ty = model.require_type(&self.data(id)?.entity_type)?;
        let prop = ty
            .property(property)
            .ok_or_else(|| TrackError::UnknownProperty {
                entity_type: ty.name().to_string(),
                property: property.to_string(),
            })?;
        if !prop.data_type().is_compatible(&value) {
            return Err(TrackError::TypeMismatch {
                entity_type: ty.name().to_string(),
                property: property.to_string(),
                expected: prop.data_type(),
                actual: value.type_name(),
            });
        }
        if ty.discriminator() == Some(property) {
            return Err(TrackError::ReadOnlyProperty {
                entity_type: ty.name().to_string(),
                property: property.to_string(),
            });
        }

        let state = self.state_of(id);
        if state == EntityState::Deleted {
            return Err(self.invalid_transition(id, Transition::Mutate));
        }
        if ty.is_key(property) && state.is_persisted() && self.value(id, property)? != value {
            return Err(TrackError::KeyModification {
                entity_type: ty.name().to_string(),
                property: property.to_string(),
            });
        }

        self.write_tracked(id, property, value)?;

        if ty.is_key(property) && state == EntityState::Added {
            self.index_key(id)?;
        }
        for &index in model.relationships_as_dependent(ty.name()) {
            if model.relationship(index).foreign_key().iter().any(|fk| fk == property) {
                self.fixup_from_foreign_key(id, index)?;
            }
        }
        Ok(())
    }

    /// Stores a value without any state bookkeeping.
    pub(crate) fn write_raw(&mut self, id: EntityId, property: &str, value: Value) -> Result<()> {
        let shadow = self
            .type_of(id)?
            .property(property)
            .is_some_and(|p| p.is_shadow());
        let data = self
            .arena
            .get_mut(id)
            .ok_or(TrackError::EntityNotFound(id))?;
        if !shadow {
            data.values.insert(property.to_string(), value);
        } else if let Some(entry) = self.identity.get_mut(id) {
            entry.shadow.insert(property.to_string(), value);
        } else {
            data.detached_shadow.insert(property.to_string(), value);
        }
        Ok(())
    }

    /// Stores a value and flags it when it departs from the snapshot of an
    /// Unchanged or Modified entry. Flags are never cleared here.
    pub(crate) fn write_tracked(&mut self, id: EntityId, property: &str, value: Value) -> Result<()> {
        self.write_raw(id, property, value.clone())?;
        if let Some(entry) = self.identity.get_mut(id)
            && matches!(entry.state, EntityState::Unchanged | EntityState::Modified)
        {
            let differs = entry
                .original
                .as_ref()
                .is_none_or(|original| original.get(property) != Some(&value));
            if differs {
                entry.modified.insert(property.to_string());
                if entry.state == EntityState::Unchanged {
                    debug!(entity = %id, property = %property, "entity modified");
                }
                entry.state = EntityState::Modified;
            }
        }
        Ok(())
    }

    pub(crate) fn key_of(&self, id: EntityId) -> Result<Key> {
        let id = self.arena.resolve(id);
        let data = self.data(id)?;
        let ty = self.model.require_type(&data.entity_type)?;
        Ok(key_from(ty.key(), &data.values))
    }

    pub(crate) fn foreign_key_of(&self, id: EntityId, relationship: &Relationship) -> Result<Key> {
        let mut parts = Vec::with_capacity(relationship.foreign_key().len());
        for fk in relationship.foreign_key() {
            parts.push(self.value(id, fk)?);
        }
        Ok(Key::new(parts))
    }

    /// Indexes an Added entry whose key has become known.
    pub(crate) fn index_key(&mut self, id: EntityId) -> Result<()> {
        let key = self.key_of(id)?;
        let Some(entry) = self.identity.get(id) else {
            return Ok(());
        };
        if !key.is_set() || entry.key.as_ref() == Some(&key) {
            return Ok(());
        }
        let root = self.type_of(id)?.root().to_string();
        self.identity.rekey(id, &root, key)
    }

    // ------------------------------------------------------------------
    // Entries
    // ------------------------------------------------------------------

    pub fn entry(&self, id: EntityId) -> Option<&Entry> {
        self.identity.get(self.arena.resolve(id))
    }

    /// Tracked entries in registration order.
    pub fn entries(&self) -> impl Iterator<Item = &Entry> + '_ {
        self.identity.iter()
    }

    pub fn state_of(&self, id: EntityId) -> EntityState {
        self.entry(id)
            .map(|entry| entry.state)
            .unwrap_or(EntityState::Detached)
    }

    /// Handle of the tracked entity of `entity_type` (or a derived type)
    /// with `key`.
    pub fn find_entry(&self, entity_type: &str, key: &Key) -> Option<EntityId> {
        let ty = self.model.entity_type(entity_type)?;
        let id = self.identity.resolve(ty.root(), key)?;
        let entry = self.identity.get(id)?;
        self.model
            .is_assignable(&entry.entity_type, entity_type)
            .then_some(id)
    }

    pub(crate) fn invalid_transition(&self, id: EntityId, transition: Transition) -> TrackError {
        TrackError::InvalidTransition {
            entity_type: self
                .arena
                .get(id)
                .map(|d| d.entity_type.clone())
                .unwrap_or_default(),
            entity: id,
            from: self.state_of(id),
            operation: transition.name(),
        }
    }

    /// Forces the entry into `state`, bypassing change detection until the
    /// next save. Forcing `Modified` without explicit flags marks every
    /// non-key property modified.
    pub fn set_state(&mut self, id: EntityId, state: EntityState) -> Result<()> {
        let id = self.arena.resolve(id);
        if state == EntityState::Detached {
            return self.detach(id);
        }
        if !self.identity.contains(id) {
            self.track_single(id, state)?;
        }
        let current = self.current_values(id)?;
        let non_key: Vec<String> = {
            let ty = self.type_of(id)?;
            ty.properties()
                .iter()
                .filter(|p| !ty.is_key(p.name()))
                .map(|p| p.name().to_string())
                .collect()
        };
        let entry = self
            .identity
            .get_mut(id)
            .ok_or(TrackError::EntityNotFound(id))?;
        let from = entry.state;
        if entry.original.is_none() && state != EntityState::Added {
            entry.original = Some(current);
        }
        match state {
            EntityState::Modified if entry.modified.is_empty() => {
                entry.modified = non_key.into_iter().collect();
            }
            EntityState::Modified => {}
            _ => entry.modified.clear(),
        }
        entry.state = state;
        entry.overridden = true;
        debug!(entity = %id, from = %from, to = %state, "state forced");
        if from == EntityState::Added && state != EntityState::Added {
            self.index_key(id)?;
        }
        Ok(())
    }

    /// Sets or clears one property's modified flag; the entry's state follows
    /// (Unchanged ↔ Modified).
    pub fn set_property_modified(&mut self, id: EntityId, property: &str, modified: bool) -> Result<()> {
        let id = self.arena.resolve(id);
        let state = self.state_of(id);
        if matches!(state, EntityState::Detached | EntityState::Deleted) {
            return Err(self.invalid_transition(id, Transition::Mutate));
        }
        let ty = self.type_of(id)?;
        if ty.property(property).is_none() {
            return Err(TrackError::UnknownProperty {
                entity_type: ty.name().to_string(),
                property: property.to_string(),
            });
        }
        if modified && ty.is_key(property) {
            return Err(TrackError::KeyModification {
                entity_type: ty.name().to_string(),
                property: property.to_string(),
            });
        }
        let entry = self
            .identity
            .get_mut(id)
            .ok_or(TrackError::EntityNotFound(id))?;
        if modified {
            entry.modified.insert(property.to_string());
            if entry.state == EntityState::Unchanged {
                entry.state = EntityState::Modified;
            }
        } else {
            entry.modified.remove(property);
            if entry.state == EntityState::Modified && entry.modified.is_empty() {
                entry.state = EntityState::Unchanged;
            }
        }
        entry.overridden = true;
        Ok(())
    }

    /// Stops tracking the entity. Its values and navigations stay as they are.
    pub fn detach(&mut self, id: EntityId) -> Result<()> {
        let id = self.arena.resolve(id);
        let root = self.type_of(id)?.root().to_string();
        if let Some(entry) = self.identity.forget(id, &root) {
            if let Some(data) = self.arena.get_mut(id) {
                data.detached_shadow = entry.shadow;
            }
            self.pending_cascades.retain(|pending| *pending != id);
            debug!(entity = %id, entity_type = %entry.entity_type, "entity detached");
        }
        Ok(())
    }

    /// Tracks a row read from the store (property name → value) as
    /// Unchanged. An entity already tracked under the row's key wins and its
    /// values are left untouched. Navigations between the new entity and
    /// tracked entities are connected through matching foreign keys.
    pub fn materialize(&mut self, entity_type: &str, row: &Row) -> Result<EntityId> {
        let model = Arc::clone(&self.model);
        let declared = model.require_type(entity_type)?;
        let ty = match declared
            .discriminator()
            .and_then(|column| row.get(column))
            .and_then(|value| model.resolve_discriminated(declared.root(), value))
        {
            Some(concrete) if model.is_assignable(concrete.name(), declared.name()) => concrete,
            _ => declared,
        };

        let key = key_from(ty.key(), row);
        if !key.is_set() {
            return Err(TrackError::MissingKey(ty.name().to_string()));
        }
        if let Some(existing) = self.identity.resolve(ty.root(), &key) {
            return Ok(existing);
        }

        let mut data = EntityData {
            entity_type: ty.name().to_string(),
            ..Default::default()
        };
        let mut shadow = Row::new();
        for property in ty.properties() {
            let value = row.get(property.name()).cloned().unwrap_or(Value::Null);
            if property.is_shadow() {
                shadow.insert(property.name().to_string(), value);
            } else {
                data.values.insert(property.name().to_string(), value);
            }
        }
        let id = self.arena.insert(data);
        let mut entry = Entry::new(id, ty.name(), EntityState::Unchanged, shadow);
        entry.original = Some(self.current_values_with(id, &entry)?);
        self.identity
            .register(entry, ty.root(), Some(key), self.config.identity_resolution)?;
        debug!(entity = %id, entity_type = %ty.name(), "entity materialized");

        self.connect_loaded(id)?;
        Ok(id)
    }

    /// Overwrites a tracked entity with fresh store values and accepts them;
    /// `None` means the row no longer exists and the entity is detached.
    pub fn reload(&mut self, id: EntityId, row: Option<&Row>) -> Result<()> {
        let id = self.arena.resolve(id);
        let Some(row) = row else {
            return self.detach(id);
        };
        let model = Arc::clone(&self.model);
        let ty = model.require_type(&self.data(id)?.entity_type)?;
        if !self.identity.contains(id) {
            return Err(self.invalid_transition(id, Transition::Attach { key_set: false }));
        }
        for property in ty.properties() {
            let value = row.get(property.name()).cloned().unwrap_or(Value::Null);
            self.write_raw(id, property.name(), value)?;
        }
        let current = self.current_values(id)?;
        if let Some(entry) = self.identity.get_mut(id) {
            entry.accept(current);
        }
        self.index_key(id)?;
        for &index in model.relationships_as_dependent(ty.name()) {
            self.fixup_from_foreign_key(id, index)?;
        }
        Ok(())
    }

    fn current_values_with(&self, id: EntityId, entry: &Entry) -> Result<Row> {
        let mut row = self.data(id)?.values.clone();
        row.extend(entry.shadow.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(row)
    }
}
