use super::command::{ColumnSlot, CommandKind, PlannedCommand, Slot};
use crate::core::{EntityId, Result, Row, TrackError, Value};
use crate::model::{DeleteBehavior, EntityType, KeyGeneration, Model, OwnedMapping, Property};
use crate::tracking::{ChangeTracker, EntityState};
use std::collections::{BTreeSet, HashMap, HashSet};
use tracing::debug;

/// Optional foreign key inserted as NULL and set by a follow-up update to
/// break an insert cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Patch {
    dependent: EntityId,
    principal: EntityId,
    relationship: usize,
}

#[derive(Debug, Clone, Copy)]
struct Dependency {
    dependent: EntityId,
    principal: EntityId,
    relationship: usize,
    required: bool,
}

/// Ordered commands plus the entries they settle.
#[derive(Debug, Default)]
pub struct SavePlan {
    pub commands: Vec<PlannedCommand>,
    /// Added and Modified entries, accepted as Unchanged on success.
    pub accepted: Vec<EntityId>,
    /// Deleted entries (store-cascaded ones included), forgotten on success.
    pub removed: Vec<EntityId>,
}

impl SavePlan {
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty() && self.accepted.is_empty() && self.removed.is_empty()
    }
}

/// Turns the tracker's pending entries into ordered store commands.
pub struct Planner<'a> {
    tracker: &'a ChangeTracker,
    model: &'a Model,
}

impl<'a> Planner<'a> {
    pub fn new(tracker: &'a ChangeTracker) -> Self {
        Self {
            tracker,
            model: tracker.model(),
        }
    }

    pub fn plan(&self) -> Result<SavePlan> {
        let mut added = Vec::new();
        let mut modified = Vec::new();
        let mut deleted = Vec::new();
        for entry in self.tracker.entries() {
            match entry.state() {
                EntityState::Added => added.push(entry.entity()),
                EntityState::Modified => modified.push(entry.entity()),
                EntityState::Deleted => deleted.push(entry.entity()),
                EntityState::Unchanged | EntityState::Detached => {}
            }
        }

        for &id in added.iter().chain(&modified) {
            self.validate_dependent(id)?;
        }
        for &id in &deleted {
            self.validate_principal(id)?;
        }

        let mut plan = SavePlan::default();
        let (order, patches) = self.insert_order(&added)?;
        for &id in &order {
            self.insert_commands(id, &patches, &mut plan.commands)?;
        }
        for patch in &patches {
            plan.commands.push(self.patch_command(patch)?);
        }
        for &id in &modified {
            self.update_commands(id, &mut plan.commands)?;
        }

        let cascaded = self.store_cascaded(&deleted);
        let (order, unlinks) = self.delete_order(&deleted, &cascaded)?;
        for unlink in &unlinks {
            plan.commands.push(self.unlink_command(unlink)?);
        }
        for id in order {
            self.delete_commands(id, &mut plan.commands)?;
        }

        plan.accepted = added.into_iter().chain(modified).collect();
        plan.removed = deleted;
        Ok(plan)
    }

    // ------------------------------------------------------------------
    // Validation
    // ------------------------------------------------------------------

    fn violation(&self, relationship: usize, entity: EntityId, reason: String) -> TrackError {
        TrackError::RequiredRelationshipViolation {
            relationship: self.model.relationship(relationship).name().to_string(),
            entity_type: self
                .tracker
                .entry(entity)
                .map(|e| e.entity_type().to_string())
                .unwrap_or_default(),
            entity,
            reason,
        }
    }

    /// An Added or Modified dependent needs a live principal for every
    /// required relationship and must not point at a Deleted one.
    fn validate_dependent(&self, id: EntityId) -> Result<()> {
        let entity_type = self.type_name(id);
        for &index in self.model.relationships_as_dependent(&entity_type) {
            let relationship = self.model.relationship(index);
            let foreign_key_set = self.tracker.foreign_key_of(id, relationship)?.is_set();
            match self.tracker.principal_of(id, index) {
                Some(principal) if self.tracker.state_of(principal) == EntityState::Deleted => {
                    return Err(self.violation(
                        index,
                        id,
                        format!("principal {principal} is marked for deletion"),
                    ));
                }
                Some(principal)
                    if relationship.is_required()
                        && self.tracker.state_of(principal) == EntityState::Detached
                        && !self.tracker.key_of(principal).is_ok_and(|key| key.is_set()) =>
                {
                    return Err(self.violation(
                        index,
                        id,
                        format!("principal {principal} is not tracked and has no key"),
                    ));
                }
                Some(_) => {}
                None if relationship.is_required() && !foreign_key_set => {
                    return Err(self.violation(index, id, "required principal is missing".into()));
                }
                None => {}
            }
        }
        Ok(())
    }

    /// A Deleted principal may only leave dependents behind that the store
    /// removes itself.
    fn validate_principal(&self, id: EntityId) -> Result<()> {
        let entity_type = self.type_name(id);
        for &index in self.model.relationships_as_principal(&entity_type) {
            let relationship = self.model.relationship(index);
            let store_cascade = relationship.store_cascade()
                && relationship.on_delete() == DeleteBehavior::Cascade;
            for dependent in self.tracker.dependents_of(id, index) {
                match self.tracker.state_of(dependent) {
                    EntityState::Deleted => {}
                    EntityState::Detached if store_cascade => {}
                    EntityState::Detached => {
                        return Err(self.violation(
                            index,
                            id,
                            format!("untracked dependent {dependent} still references it"),
                        ));
                    }
                    state => {
                        return Err(self.violation(
                            index,
                            id,
                            format!("{state} dependent {dependent} still references it"),
                        ));
                    }
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Ordering
    // ------------------------------------------------------------------

    /// Principals before dependents. Cycles through optional relationships
    /// are broken by patching; a cycle of required ones cannot be ordered.
    fn insert_order(&self, added: &[EntityId]) -> Result<(Vec<EntityId>, Vec<Patch>)> {
        let pending: HashSet<EntityId> = added.iter().copied().collect();
        let mut dependencies = Vec::new();
        let mut patches = Vec::new();

        for &id in added {
            let entity_type = self.type_name(id);
            for &index in self.model.relationships_as_dependent(&entity_type) {
                let required = self.model.relationship(index).is_required();
                let Some(principal) = self.tracker.principal_of(id, index) else {
                    continue;
                };
                if !pending.contains(&principal) {
                    continue;
                }
                if principal == id {
                    if required {
                        return Err(TrackError::CascadeCycle {
                            entity_types: vec![entity_type.clone()],
                        });
                    }
                    patches.push(Patch {
                        dependent: id,
                        principal: id,
                        relationship: index,
                    });
                    continue;
                }
                dependencies.push(Dependency {
                    dependent: id,
                    principal,
                    relationship: index,
                    required,
                });
            }
        }

        let mut active = vec![true; dependencies.len()];
        let mut emitted = HashSet::new();
        let mut order = Vec::with_capacity(added.len());
        while order.len() < added.len() {
            let next = added.iter().copied().find(|id| {
                !emitted.contains(id)
                    && dependencies
                        .iter()
                        .zip(&active)
                        .all(|(d, on)| !*on || d.dependent != *id || emitted.contains(&d.principal))
            });
            if let Some(id) = next {
                emitted.insert(id);
                order.push(id);
                continue;
            }

            let soft = (0..dependencies.len()).find(|&i| {
                let d = &dependencies[i];
                active[i] && !d.required && !emitted.contains(&d.dependent)
            });
            let Some(i) = soft else {
                let remaining: BTreeSet<String> = added
                    .iter()
                    .filter(|id| !emitted.contains(*id))
                    .map(|id| self.type_name(*id))
                    .collect();
                return Err(TrackError::CascadeCycle {
                    entity_types: remaining.into_iter().collect(),
                });
            };
            let d = dependencies[i];
            active[i] = false;
            debug!(
                dependent = %d.dependent,
                principal = %d.principal,
                relationship = %self.model.relationship(d.relationship).name(),
                "breaking insert cycle with a follow-up update"
            );
            patches.push(Patch {
                dependent: d.dependent,
                principal: d.principal,
                relationship: d.relationship,
            });
        }
        Ok((order, patches))
    }

    /// Deleted dependents removed by the store's own ON DELETE CASCADE.
    fn store_cascaded(&self, deleted: &[EntityId]) -> HashSet<EntityId> {
        deleted
            .iter()
            .copied()
            .filter(|&id| {
                let entity_type = self.type_name(id);
                self.model
                    .relationships_as_dependent(&entity_type)
                    .iter()
                    .any(|&index| {
                        let relationship = self.model.relationship(index);
                        relationship.store_cascade()
                            && relationship.on_delete() == DeleteBehavior::Cascade
                            && self
                                .tracker
                                .principal_of(id, index)
                                .is_some_and(|p| self.tracker.state_of(p) == EntityState::Deleted)
                    })
            })
            .collect()
    }

    /// Principal a Deleted entry's stored row still points at.
    fn stored_principal(&self, id: EntityId, index: usize) -> Option<EntityId> {
        let relationship = self.model.relationship(index);
        let Some(original) = self.tracker.entry(id).and_then(|e| e.original_values()) else {
            return self.tracker.principal_of(id, index);
        };
        let key = crate::tracking::key_from(relationship.foreign_key(), original);
        if !key.is_set() {
            return None;
        }
        self.tracker.find_entry(relationship.principal(), &key)
    }

    /// Dependents before principals, following the foreign keys of the
    /// stored rows. Cycles through optional relationships are broken by
    /// nulling one stored foreign key first.
    fn delete_order(
        &self,
        deleted: &[EntityId],
        cascaded: &HashSet<EntityId>,
    ) -> Result<(Vec<EntityId>, Vec<Patch>)> {
        let nodes: Vec<EntityId> = deleted
            .iter()
            .copied()
            .filter(|id| !cascaded.contains(id))
            .collect();
        let members: HashSet<EntityId> = nodes.iter().copied().collect();

        let mut dependencies = Vec::new();
        for &id in &nodes {
            let entity_type = self.type_name(id);
            for &index in self.model.relationships_as_dependent(&entity_type) {
                if let Some(principal) = self.stored_principal(id, index)
                    && principal != id
                    && members.contains(&principal)
                {
                    dependencies.push(Dependency {
                        dependent: id,
                        principal,
                        relationship: index,
                        required: self.model.relationship(index).is_required(),
                    });
                }
            }
        }

        let mut active = vec![true; dependencies.len()];
        let mut unlinks = Vec::new();
        let mut emitted = HashSet::new();
        let mut order = Vec::with_capacity(nodes.len());
        while order.len() < nodes.len() {
            let next = nodes.iter().copied().find(|id| {
                !emitted.contains(id)
                    && dependencies
                        .iter()
                        .zip(&active)
                        .all(|(d, on)| !*on || d.principal != *id || emitted.contains(&d.dependent))
            });
            if let Some(id) = next {
                emitted.insert(id);
                order.push(id);
                continue;
            }

            let soft = (0..dependencies.len()).find(|&i| {
                let d = &dependencies[i];
                active[i] && !d.required && !emitted.contains(&d.principal)
            });
            let Some(i) = soft else {
                let remaining: BTreeSet<String> = nodes
                    .iter()
                    .filter(|id| !emitted.contains(*id))
                    .map(|id| self.type_name(*id))
                    .collect();
                return Err(TrackError::CascadeCycle {
                    entity_types: remaining.into_iter().collect(),
                });
            };
            let d = dependencies[i];
            active[i] = false;
            debug!(
                dependent = %d.dependent,
                principal = %d.principal,
                relationship = %self.model.relationship(d.relationship).name(),
                "breaking delete cycle by nulling the stored foreign key"
            );
            unlinks.push(Patch {
                dependent: d.dependent,
                principal: d.principal,
                relationship: d.relationship,
            });
        }
        Ok((order, unlinks))
    }

    // ------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------

    fn type_name(&self, id: EntityId) -> String {
        self.tracker
            .entry(id)
            .map(|e| e.entity_type().to_string())
            .unwrap_or_default()
    }

    fn key_slots(&self, id: EntityId, ty: &EntityType) -> Vec<ColumnSlot> {
        ty.key()
            .iter()
            .filter_map(|k| ty.property(k))
            .map(|p| ColumnSlot::key_of(None, p.column_name(), id, p.name()))
            .collect()
    }

    /// Foreign key values taken from the principal each relationship points
    /// at; patched relationships insert NULL.
    fn foreign_key_slots(&self, id: EntityId, ty: &EntityType, patches: &[Patch]) -> HashMap<String, Slot> {
        let mut slots = HashMap::new();
        for &index in self.model.relationships_as_dependent(ty.name()) {
            let relationship = self.model.relationship(index);
            if patches
                .iter()
                .any(|p| p.dependent == id && p.relationship == index)
            {
                for fk in relationship.foreign_key() {
                    slots.insert(fk.clone(), Slot::Value(Value::Null));
                }
                continue;
            }
            let Some(principal) = self.tracker.principal_of(id, index) else {
                continue;
            };
            for (fk, pk) in relationship
                .foreign_key()
                .iter()
                .zip(relationship.principal_key())
            {
                slots.insert(
                    fk.clone(),
                    Slot::KeyOf {
                        entity: principal,
                        property: pk.clone(),
                    },
                );
            }
        }
        slots
    }

    /// Current value, or the property's default when the value is unset.
    fn insert_value(&self, ty: &EntityType, property: &Property, current: &Row) -> Value {
        let value = current.get(property.name()).cloned().unwrap_or(Value::Null);
        let unset = if ty.is_key(property.name()) {
            value.is_default()
        } else {
            value.is_null()
        };
        match property.default() {
            Some(default) if unset => default.produce(ty.name(), current),
            _ => value,
        }
    }

    fn insert_commands(&self, id: EntityId, patches: &[Patch], out: &mut Vec<PlannedCommand>) -> Result<()> {
        let ty = self.tracker.type_of(id)?;
        let current = self.tracker.current_values(id)?;
        let fk_slots = self.foreign_key_slots(id, ty, patches);

        let mut values = Vec::new();
        let mut generated_key = None;
        for property in ty.table_properties() {
            let name = property.name();
            if ty.is_key(name) && ty.key_generation() == KeyGeneration::Store {
                let value = current.get(name).cloned().unwrap_or(Value::Null);
                if value.is_default() {
                    generated_key = Some(name.to_string());
                } else {
                    values.push(ColumnSlot::value(Some(name), property.column_name(), value));
                }
                continue;
            }
            let slot = match fk_slots.get(name) {
                Some(slot) => slot.clone(),
                None => Slot::Value(self.insert_value(ty, property, &current)),
            };
            values.push(ColumnSlot {
                property: Some(name.to_string()),
                column: property.column_name().to_string(),
                slot,
            });
        }

        out.push(PlannedCommand {
            entity: id,
            entity_type: ty.name().to_string(),
            table: ty.table().to_string(),
            kind: CommandKind::Insert,
            key: self.key_slots(id, ty),
            values,
            generated_key,
        });

        for owned in ty.owned() {
            if owned.satellite_table().is_some() && owned.is_present(&current) {
                out.push(self.satellite_insert(id, ty, owned, &current));
            }
        }
        Ok(())
    }

    fn satellite_insert(&self, id: EntityId, ty: &EntityType, owned: &OwnedMapping, current: &Row) -> PlannedCommand {
        let key = self.key_slots(id, ty);
        let mut values = key.clone();
        for name in owned.properties() {
            if let Some(property) = ty.property(name) {
                values.push(ColumnSlot::value(
                    Some(name.as_str()),
                    property.column_name(),
                    self.insert_value(ty, property, current),
                ));
            }
        }
        PlannedCommand {
            entity: id,
            entity_type: ty.name().to_string(),
            table: owned.satellite_table().unwrap_or_default().to_string(),
            kind: CommandKind::Insert,
            key,
            values,
            generated_key: None,
        }
    }

    fn patch_command(&self, patch: &Patch) -> Result<PlannedCommand> {
        let ty = self.tracker.type_of(patch.dependent)?;
        let relationship = self.model.relationship(patch.relationship);
        let values = relationship
            .foreign_key()
            .iter()
            .zip(relationship.principal_key())
            .filter_map(|(fk, pk)| {
                let property = ty.property(fk)?;
                Some(ColumnSlot::key_of(Some(fk.as_str()), property.column_name(), patch.principal, pk))
            })
            .collect();
        Ok(PlannedCommand {
            entity: patch.dependent,
            entity_type: ty.name().to_string(),
            table: ty.table().to_string(),
            kind: CommandKind::Update,
            key: self.key_slots(patch.dependent, ty),
            values,
            generated_key: None,
        })
    }

    /// Sets a stored foreign key of a row about to be deleted to NULL.
    fn unlink_command(&self, unlink: &Patch) -> Result<PlannedCommand> {
        let ty = self.tracker.type_of(unlink.dependent)?;
        let relationship = self.model.relationship(unlink.relationship);
        let values = relationship
            .foreign_key()
            .iter()
            .filter_map(|fk| {
                let property = ty.property(fk)?;
                // no property: the written value must not reach the entity
                Some(ColumnSlot::value(None, property.column_name(), Value::Null))
            })
            .collect();
        Ok(PlannedCommand {
            entity: unlink.dependent,
            entity_type: ty.name().to_string(),
            table: ty.table().to_string(),
            kind: CommandKind::Update,
            key: self.key_slots(unlink.dependent, ty),
            values,
            generated_key: None,
        })
    }

    fn update_commands(&self, id: EntityId, out: &mut Vec<PlannedCommand>) -> Result<()> {
        let entry = self
            .tracker
            .entry(id)
            .ok_or(TrackError::EntityNotFound(id))?;
        let ty = self.tracker.type_of(id)?;
        let current = self.tracker.current_values(id)?;
        let fk_slots = self.foreign_key_slots(id, ty, &[]);

        let values: Vec<ColumnSlot> = ty
            .table_properties()
            .filter(|p| entry.is_modified(p.name()) && !ty.is_key(p.name()))
            .map(|p| ColumnSlot {
                property: Some(p.name().to_string()),
                column: p.column_name().to_string(),
                slot: fk_slots
                    .get(p.name())
                    .cloned()
                    .unwrap_or_else(|| Slot::Value(current.get(p.name()).cloned().unwrap_or(Value::Null))),
            })
            .collect();
        if !values.is_empty() {
            out.push(PlannedCommand {
                entity: id,
                entity_type: ty.name().to_string(),
                table: ty.table().to_string(),
                kind: CommandKind::Update,
                key: self.key_slots(id, ty),
                values,
                generated_key: None,
            });
        }

        for owned in ty.owned() {
            let Some(table) = owned.satellite_table() else {
                continue;
            };
            let before = entry.original_values().is_some_and(|o| owned.is_present(o));
            let now = owned.is_present(&current);
            match (before, now) {
                (true, true) => {
                    let changed: Vec<ColumnSlot> = owned
                        .properties()
                        .iter()
                        .filter(|name| entry.is_modified(name))
                        .filter_map(|name| {
                            let property = ty.property(name)?;
                            Some(ColumnSlot::value(
                                Some(name.as_str()),
                                property.column_name(),
                                current.get(name.as_str()).cloned().unwrap_or(Value::Null),
                            ))
                        })
                        .collect();
                    if !changed.is_empty() {
                        out.push(PlannedCommand {
                            entity: id,
                            entity_type: ty.name().to_string(),
                            table: table.to_string(),
                            kind: CommandKind::Update,
                            key: self.key_slots(id, ty),
                            values: changed,
                            generated_key: None,
                        });
                    }
                }
                (false, true) => out.push(self.satellite_insert(id, ty, owned, &current)),
                (true, false) => out.push(self.delete_command(id, ty, table)),
                (false, false) => {}
            }
        }
        Ok(())
    }

    fn delete_command(&self, id: EntityId, ty: &EntityType, table: &str) -> PlannedCommand {
        PlannedCommand {
            entity: id,
            entity_type: ty.name().to_string(),
            table: table.to_string(),
            kind: CommandKind::Delete,
            key: self.key_slots(id, ty),
            values: Vec::new(),
            generated_key: None,
        }
    }

    fn delete_commands(&self, id: EntityId, out: &mut Vec<PlannedCommand>) -> Result<()> {
        let entry = self
            .tracker
            .entry(id)
            .ok_or(TrackError::EntityNotFound(id))?;
        let ty = self.tracker.type_of(id)?;
        let stored = match entry.original_values() {
            Some(original) => original.clone(),
            None => self.tracker.current_values(id)?,
        };
        for owned in ty.owned() {
            if let Some(table) = owned.satellite_table()
                && owned.is_present(&stored)
            {
                out.push(self.delete_command(id, ty, table));
            }
        }
        out.push(self.delete_command(id, ty, ty.table()));
        Ok(())
    }
}
