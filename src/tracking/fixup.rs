// ============================================================================
// Relationship Fixup
// ============================================================================
//
// Keeps foreign keys and both navigation sides of every relationship in
// agreement:
//
// - graph traversal that brings untracked entities under tracking
// - link: dependent → principal (FK copy, inverse navigation, relinking)
// - sever: dependent loses its principal (FK nulled or orphan removed)
// - removal with delete cascades
// - FK-driven navigation fixup for loaded rows and FK assignments
//
// Only dependents ever change here; a principal's state is not affected by
// changes to its dependents' foreign keys.
//
// ============================================================================

use super::{ChangeTracker, EntityState, Entry, GraphNode, GraphVisitor, Registration, Transition};
use crate::config::CascadeTiming;
use crate::core::{EntityId, Result, TrackError, Value};
use crate::model::{Cardinality, DeleteBehavior, NavigationSide};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use tracing::debug;

/// How a traversal proposes states for untracked entities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    Add,
    Attach,
    Update,
}

impl Intent {
    fn transition(self, key_set: bool) -> Transition {
        match self {
            Intent::Add => Transition::Add,
            Intent::Attach => Transition::Attach { key_set },
            Intent::Update => Transition::Update { key_set },
        }
    }
}

/// Navigation through which a node was reached.
#[derive(Debug, Clone)]
struct Edge {
    from: EntityId,
    navigation: String,
    relationship: usize,
    side: NavigationSide,
}

struct Walk<'v> {
    intent: Intent,
    visitor: Option<&'v mut dyn GraphVisitor>,
    visited: HashSet<EntityId>,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct NavigationInfo {
    pub relationship: usize,
    pub side: NavigationSide,
    pub collection: bool,
}

impl ChangeTracker {
    // ------------------------------------------------------------------
    // Traversal
    // ------------------------------------------------------------------

    /// Tracks `root` and every untracked entity reachable from it.
    ///
    /// Already tracked entities other than the root keep their state and
    /// are not traversed; they are only linked to the entity that points at
    /// them. Returns the canonical handle of the root.
    pub fn track_graph(
        &mut self,
        root: EntityId,
        intent: Intent,
        visitor: Option<&mut dyn GraphVisitor>,
    ) -> Result<EntityId> {
        let root = self.arena.resolve(root);
        self.data(root)?;
        let mut walk = Walk {
            intent,
            visitor,
            visited: HashSet::new(),
        };

        if self.identity.contains(root) {
            if walk.visitor.is_none() {
                self.retrack(root, intent)?;
            }
            walk.visited.insert(root);
            self.walk_children(root, &mut walk, 1)?;
            return Ok(root);
        }
        Ok(self.visit_node(root, None, &mut walk, 0)?.unwrap_or(root))
    }

    /// Applies a tracking operation to an entity that already has an entry.
    fn retrack(&mut self, id: EntityId, intent: Intent) -> Result<()> {
        let key_set = self.key_of(id)?.is_set();
        let transition = intent.transition(key_set);
        let from = self.state_of(id);
        let to = from
            .apply(transition)
            .ok_or_else(|| self.invalid_transition(id, transition))?;
        if intent == Intent::Update && to == EntityState::Modified {
            let non_key = self.non_key_properties(id)?;
            if let Some(entry) = self.identity.get_mut(id) {
                entry.modified.extend(non_key);
                entry.state = to;
            }
        }
        Ok(())
    }

    fn non_key_properties(&self, id: EntityId) -> Result<Vec<String>> {
        let ty = self.type_of(id)?;
        Ok(ty
            .properties()
            .iter()
            .filter(|p| !ty.is_key(p.name()))
            .map(|p| p.name().to_string())
            .collect())
    }

    fn visit_node(
        &mut self,
        id: EntityId,
        edge: Option<Edge>,
        walk: &mut Walk<'_>,
        depth: usize,
    ) -> Result<Option<EntityId>> {
        if depth > self.config.max_graph_depth {
            return Err(TrackError::GraphDepthExceeded(self.config.max_graph_depth));
        }
        walk.visited.insert(id);

        let model = Arc::clone(&self.model);
        let data = self.data(id)?;
        let ty = model.require_type(&data.entity_type)?;
        let key = super::key_from(ty.key(), &data.values);
        let key_set = key.is_set();
        let proposed = EntityState::Detached
            .apply(walk.intent.transition(key_set))
            .unwrap_or(EntityState::Added);

        let mut state = proposed;
        let mut flags = BTreeSet::new();
        let mut overridden = false;
        if let Some(visitor) = walk.visitor.as_deref_mut() {
            let mut node = GraphNode {
                entity: id,
                entity_type: ty.name(),
                values: &data.values,
                key_set,
                source: edge.as_ref().map(|e| (e.from, e.navigation.as_str())),
                proposed,
                state: proposed,
                modified: BTreeSet::new(),
            };
            visitor.visit(&mut node);
            overridden = node.is_overridden();
            state = node.state;
            flags = node.modified;
        }

        if state == EntityState::Detached {
            debug!(entity = %id, entity_type = %ty.name(), "visitor left entity untracked");
            return Ok(None);
        }
        for flag in &flags {
            if ty.property(flag).is_none() {
                return Err(TrackError::UnknownProperty {
                    entity_type: ty.name().to_string(),
                    property: flag.clone(),
                });
            }
        }

        let shadow = self
            .arena
            .get_mut(id)
            .map(|data| std::mem::take(&mut data.detached_shadow))
            .unwrap_or_default();
        let entry = Entry::new(id, ty.name(), state, shadow);
        let registration = self.identity.register(
            entry,
            ty.root(),
            Some(key),
            self.config.identity_resolution,
        )?;
        if let Registration::Merged(existing) = registration {
            debug!(entity = %id, canonical = %existing, "instance merged into tracked identity");
            self.arena.merge(id, existing);
            return Ok(Some(existing));
        }

        // FK values implied by navigations are part of the snapshot, so
        // attaching a consistent graph leaves it Unchanged.
        self.prewrite_foreign_keys(id, edge.as_ref())?;
        let current = self.current_values(id)?;
        let non_key = self.non_key_properties(id)?;
        if let Some(entry) = self.identity.get_mut(id) {
            if state != EntityState::Added {
                entry.original = Some(current);
            }
            if !flags.is_empty() {
                entry.modified = flags;
                if entry.state == EntityState::Unchanged {
                    entry.state = EntityState::Modified;
                }
            } else if state == EntityState::Modified {
                entry.modified = non_key.into_iter().collect();
            }
            entry.overridden = overridden;
            debug!(entity = %id, entity_type = %ty.name(), state = %entry.state, "entity tracked");
        }

        self.walk_children(id, walk, depth + 1)?;
        Ok(Some(id))
    }

    fn walk_children(&mut self, id: EntityId, walk: &mut Walk<'_>, depth: usize) -> Result<()> {
        let model = Arc::clone(&self.model);
        let data = self.data(id)?;
        let type_name = data.entity_type.clone();
        let targets = data.navigation_targets();

        for (navigation, target) in targets {
            let nav = model.navigation(&type_name, &navigation).ok_or_else(|| {
                TrackError::UnknownNavigation {
                    entity_type: type_name.clone(),
                    navigation: navigation.clone(),
                }
            })?;
            let (index, side) = (nav.index, nav.side);
            let target = self.arena.resolve(target);

            let target = if self.identity.contains(target) {
                target
            } else if walk.visited.contains(&target) {
                continue;
            } else {
                let edge = Edge {
                    from: id,
                    navigation,
                    relationship: index,
                    side,
                };
                match self.visit_node(target, Some(edge), walk, depth)? {
                    Some(tracked) => tracked,
                    None => continue,
                }
            };

            match side {
                NavigationSide::ToPrincipal => self.link(id, target, index)?,
                NavigationSide::ToDependent => self.link(target, id, index)?,
            }
        }
        Ok(())
    }

    /// Copies keys of principals that are already known into a node's
    /// foreign keys before its snapshot is taken.
    fn prewrite_foreign_keys(&mut self, id: EntityId, edge: Option<&Edge>) -> Result<()> {
        let model = Arc::clone(&self.model);
        let type_name = self.data(id)?.entity_type.clone();
        for &index in model.relationships_as_dependent(&type_name) {
            let relationship = model.relationship(index);
            let principal = match edge {
                Some(edge) if edge.relationship == index && edge.side == NavigationSide::ToDependent => {
                    Some(edge.from)
                }
                _ => relationship
                    .dependent_navigation()
                    .and_then(|nav| self.data(id).ok()?.reference(nav)),
            };
            let Some(principal) = principal else {
                continue;
            };
            let key = self.key_of(principal)?;
            if !key.is_set() {
                continue;
            }
            for (fk, value) in relationship.foreign_key().iter().zip(key.into_parts()) {
                self.write_raw(id, fk, value)?;
            }
        }
        Ok(())
    }

    /// Registers a single entity without traversing its navigations.
    pub(crate) fn track_single(&mut self, id: EntityId, state: EntityState) -> Result<EntityId> {
        let model = Arc::clone(&self.model);
        let ty = model.require_type(&self.data(id)?.entity_type)?;
        let key = self.key_of(id)?;
        let shadow = self
            .arena
            .get_mut(id)
            .map(|data| std::mem::take(&mut data.detached_shadow))
            .unwrap_or_default();
        let entry = Entry::new(id, ty.name(), state, shadow);
        match self
            .identity
            .register(entry, ty.root(), Some(key), self.config.identity_resolution)?
        {
            Registration::Merged(existing) => {
                self.arena.merge(id, existing);
                Ok(existing)
            }
            Registration::Tracked(id) => {
                if state != EntityState::Added {
                    let current = self.current_values(id)?;
                    if let Some(entry) = self.identity.get_mut(id) {
                        entry.original = Some(current);
                    }
                }
                Ok(id)
            }
        }
    }

    // ------------------------------------------------------------------
    // Relationship resolution
    // ------------------------------------------------------------------

    /// Principal currently reached from `dependent` through navigations.
    fn navigation_principal(&self, dependent: EntityId, index: usize) -> Option<EntityId> {
        let relationship = self.model.relationship(index);
        if let Some(nav) = relationship.dependent_navigation()
            && let Some(principal) = self.arena.get(dependent)?.reference(nav)
        {
            return Some(self.arena.resolve(principal));
        }
        let nav = relationship.principal_navigation()?;
        self.identity.iter().map(|entry| entry.entity).find(|candidate| {
            self.model
                .is_assignable(&self.entity_type_name(*candidate), relationship.principal())
                && self
                    .arena
                    .get(*candidate)
                    .is_some_and(|data| data.contains_target(nav, dependent))
        })
    }

    fn entity_type_name(&self, id: EntityId) -> String {
        self.arena
            .get(id)
            .map(|data| data.entity_type.clone())
            .unwrap_or_default()
    }

    /// Principal of `dependent` in relationship `index`: the navigation
    /// target if there is one, otherwise the tracked entity its foreign key
    /// points at.
    pub(crate) fn principal_of(&self, dependent: EntityId, index: usize) -> Option<EntityId> {
        let dependent = self.arena.resolve(dependent);
        if let Some(principal) = self.navigation_principal(dependent, index) {
            return Some(principal);
        }
        let relationship = self.model.relationship(index);
        let fk = self.foreign_key_of(dependent, relationship).ok()?;
        if !fk.is_set() {
            return None;
        }
        let root = self.model.entity_type(relationship.principal())?.root();
        let principal = self.identity.resolve(root, &fk)?;
        self.model
            .is_assignable(&self.entity_type_name(principal), relationship.principal())
            .then_some(principal)
    }

    /// Dependents of `principal` in relationship `index`: every tracked
    /// entity whose principal it is, plus untracked navigation targets.
    pub(crate) fn dependents_of(&self, principal: EntityId, index: usize) -> Vec<EntityId> {
        let principal = self.arena.resolve(principal);
        let relationship = self.model.relationship(index);
        let mut dependents = Vec::new();
        if let Some(nav) = relationship.principal_navigation()
            && let Some(data) = self.arena.get(principal)
        {
            for target in data.reference(nav).into_iter().chain(data.collection(nav).iter().copied()) {
                let target = self.arena.resolve(target);
                if !self.identity.contains(target) && !dependents.contains(&target) {
                    dependents.push(target);
                }
            }
        }
        for entry in self.identity.iter() {
            if self.model.is_assignable(&entry.entity_type, relationship.dependent())
                && !dependents.contains(&entry.entity)
                && self.principal_of(entry.entity, index) == Some(principal)
            {
                dependents.push(entry.entity);
            }
        }
        dependents
    }

    // ------------------------------------------------------------------
    // Link / sever
    // ------------------------------------------------------------------

    /// Makes `principal` the principal of `dependent`: both navigation sides
    /// are set, the dependent leaves its previous principal and receives the
    /// principal's key. A principal whose key is still pending flags the
    /// foreign key so the value is resolved at save time.
    pub(crate) fn link(&mut self, dependent: EntityId, principal: EntityId, index: usize) -> Result<()> {
        let dependent = self.arena.resolve(dependent);
        let principal = self.arena.resolve(principal);
        let model = Arc::clone(&self.model);
        let relationship = model.relationship(index);

        if let Some(previous) = self.principal_of(dependent, index)
            && previous != principal
        {
            debug!(dependent = %dependent, from = %previous, to = %principal, relationship = %relationship.name(), "relinking dependent");
            self.unlink_navigation(dependent, previous, index);
        }

        if let Some(nav) = relationship.dependent_navigation()
            && let Some(data) = self.arena.get_mut(dependent)
        {
            data.references.insert(nav.to_string(), principal);
        }
        if let Some(nav) = relationship.principal_navigation() {
            match relationship.cardinality() {
                Cardinality::OneToMany => {
                    if let Some(data) = self.arena.get_mut(principal) {
                        data.push_target(nav, dependent);
                    }
                }
                Cardinality::OneToOne => {
                    let previous = self
                        .arena
                        .get(principal)
                        .and_then(|data| data.reference(nav))
                        .map(|id| self.arena.resolve(id));
                    if let Some(previous) = previous
                        && previous != dependent
                    {
                        self.sever(previous, principal, index)?;
                    }
                    if let Some(data) = self.arena.get_mut(principal) {
                        data.references.insert(nav.to_string(), dependent);
                    }
                }
            }
        }

        let key = self.key_of(principal)?;
        if key.is_set() {
            for (fk, value) in relationship.foreign_key().iter().zip(key.into_parts()) {
                self.write_tracked(dependent, fk, value)?;
            }
        } else if let Some(entry) = self.identity.get_mut(dependent)
            && matches!(entry.state, EntityState::Unchanged | EntityState::Modified)
        {
            entry
                .modified
                .extend(relationship.foreign_key().iter().cloned());
            entry.state = EntityState::Modified;
        }
        Ok(())
    }

    /// Clears both navigation sides between `dependent` and `principal`.
    fn unlink_navigation(&mut self, dependent: EntityId, principal: EntityId, index: usize) {
        let relationship = self.model.relationship(index);
        if let Some(nav) = relationship.dependent_navigation()
            && let Some(data) = self.arena.get_mut(dependent)
            && data.references.get(nav) == Some(&principal)
        {
            data.references.remove(nav);
        }
        if let Some(nav) = relationship.principal_navigation()
            && let Some(data) = self.arena.get_mut(principal)
        {
            data.remove_target(nav, dependent);
        }
    }

    /// Separates `dependent` from `principal`. Orphans of a required cascade
    /// relationship are removed; any other dependent has its foreign key
    /// nulled (a required FK nulled this way fails at save).
    pub(crate) fn sever(&mut self, dependent: EntityId, principal: EntityId, index: usize) -> Result<()> {
        let model = Arc::clone(&self.model);
        let relationship = model.relationship(index);
        self.unlink_navigation(dependent, principal, index);
        debug!(dependent = %dependent, principal = %principal, relationship = %relationship.name(), "dependent severed");

        if relationship.deletes_orphans() {
            if self.identity.contains(dependent) {
                self.remove(dependent)?;
            }
            return Ok(());
        }
        for fk in relationship.foreign_key() {
            self.write_tracked(dependent, fk, Value::Null)?;
        }
        Ok(())
    }

    /// Connects navigations between two entities whose foreign key already
    /// agrees, without writing values.
    fn connect_navigations(&mut self, dependent: EntityId, principal: EntityId, index: usize) {
        let relationship = self.model.relationship(index);
        if let Some(nav) = relationship.dependent_navigation()
            && let Some(data) = self.arena.get_mut(dependent)
        {
            data.references.insert(nav.to_string(), principal);
        }
        if let Some(nav) = relationship.principal_navigation()
            && let Some(data) = self.arena.get_mut(principal)
        {
            match relationship.cardinality() {
                Cardinality::OneToMany => data.push_target(nav, dependent),
                Cardinality::OneToOne => {
                    data.references.insert(nav.to_string(), dependent);
                }
            }
        }
    }

    /// Follows a foreign key that was assigned directly: navigations move to
    /// the tracked principal it now points at, or are cleared when it is NULL.
    pub(crate) fn fixup_from_foreign_key(&mut self, dependent: EntityId, index: usize) -> Result<()> {
        if !self.identity.contains(dependent) {
            return Ok(());
        }
        let model = Arc::clone(&self.model);
        let relationship = model.relationship(index);
        let fk = self.foreign_key_of(dependent, relationship)?;
        let current = self.navigation_principal(dependent, index);
        let target = if fk.is_set() {
            model
                .entity_type(relationship.principal())
                .and_then(|ty| self.identity.resolve(ty.root(), &fk))
                .filter(|id| {
                    model.is_assignable(&self.entity_type_name(*id), relationship.principal())
                })
        } else {
            None
        };

        if current.is_some() && current == target {
            return Ok(());
        }
        if let Some(current) = current {
            self.unlink_navigation(dependent, current, index);
        }
        if let Some(target) = target {
            self.connect_navigations(dependent, target, index);
        }
        Ok(())
    }

    /// Connects a freshly loaded entity with tracked entities through
    /// matching foreign keys, in both directions.
    pub(crate) fn connect_loaded(&mut self, id: EntityId) -> Result<()> {
        let model = Arc::clone(&self.model);
        let ty = model.require_type(&self.data(id)?.entity_type)?;

        for &index in model.relationships_as_dependent(ty.name()) {
            let relationship = model.relationship(index);
            let fk = self.foreign_key_of(id, relationship)?;
            if !fk.is_set() {
                continue;
            }
            let principal = model
                .entity_type(relationship.principal())
                .and_then(|principal_type| self.identity.resolve(principal_type.root(), &fk))
                .filter(|p| model.is_assignable(&self.entity_type_name(*p), relationship.principal()));
            if let Some(principal) = principal {
                self.connect_navigations(id, principal, index);
            }
        }

        let key = self.key_of(id)?;
        for &index in model.relationships_as_principal(ty.name()) {
            let relationship = model.relationship(index);
            let mut dependents = Vec::new();
            for entry in self.identity.iter() {
                if entry.entity != id
                    && model.is_assignable(&entry.entity_type, relationship.dependent())
                    && self.foreign_key_of(entry.entity, relationship)? == key
                {
                    dependents.push(entry.entity);
                }
            }
            for dependent in dependents {
                self.connect_navigations(dependent, id, index);
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Navigation API
    // ------------------------------------------------------------------

    pub(crate) fn navigation_info(&self, id: EntityId, navigation: &str, collection: bool) -> Result<NavigationInfo> {
        let type_name = &self.data(id)?.entity_type;
        let nav = self
            .model
            .navigation(type_name, navigation)
            .ok_or_else(|| TrackError::UnknownNavigation {
                entity_type: type_name.clone(),
                navigation: navigation.to_string(),
            })?;
        if nav.is_collection() != collection {
            return Err(TrackError::NavigationKind {
                entity_type: type_name.clone(),
                navigation: navigation.to_string(),
                expected: if collection { "collection" } else { "reference" },
            });
        }
        Ok(NavigationInfo {
            relationship: nav.index,
            side: nav.side,
            collection: nav.is_collection(),
        })
    }

    fn check_target(&self, navigation: &str, info: NavigationInfo, target: EntityId) -> Result<()> {
        let relationship = self.model.relationship(info.relationship);
        let expected = match info.side {
            NavigationSide::ToPrincipal => relationship.principal(),
            NavigationSide::ToDependent => relationship.dependent(),
        };
        let actual = self.data(target)?.entity_type.clone();
        if !self.model.is_assignable(&actual, expected) {
            return Err(TrackError::InvalidNavigationTarget {
                navigation: navigation.to_string(),
                expected: expected.to_string(),
                actual,
            });
        }
        Ok(())
    }

    /// Tracks a newly referenced entity as Added (or merges it).
    fn track_reachable(&mut self, target: EntityId) -> Result<EntityId> {
        let target = self.arena.resolve(target);
        if self.identity.contains(target) {
            return Ok(target);
        }
        self.track_graph(target, Intent::Add, None)
    }

    pub fn reference(&self, id: EntityId, navigation: &str) -> Result<Option<EntityId>> {
        let id = self.arena.resolve(id);
        self.navigation_info(id, navigation, false)?;
        Ok(self
            .data(id)?
            .reference(navigation)
            .map(|target| self.arena.resolve(target)))
    }

    pub fn collection(&self, id: EntityId, navigation: &str) -> Result<Vec<EntityId>> {
        let id = self.arena.resolve(id);
        self.navigation_info(id, navigation, true)?;
        Ok(self
            .data(id)?
            .collection(navigation)
            .iter()
            .map(|target| self.arena.resolve(*target))
            .collect())
    }

    /// Assigns a reference navigation. On a tracked entity this runs fixup:
    /// the target is tracked as Added if needed, foreign keys follow, and
    /// clearing the navigation severs the relationship.
    pub fn set_reference(&mut self, id: EntityId, navigation: &str, target: Option<EntityId>) -> Result<()> {
        let id = self.arena.resolve(id);
        let info = self.navigation_info(id, navigation, false)?;
        let target = target.map(|t| self.arena.resolve(t));
        if let Some(target) = target {
            self.check_target(navigation, info, target)?;
        }

        if !self.identity.contains(id) {
            let data = self.arena.get_mut(id).ok_or(TrackError::EntityNotFound(id))?;
            match target {
                Some(target) => {
                    data.references.insert(navigation.to_string(), target);
                }
                None => {
                    data.references.remove(navigation);
                }
            }
            return Ok(());
        }

        let target = match target {
            Some(target) => Some(self.track_reachable(target)?),
            None => None,
        };
        match (info.side, target) {
            (NavigationSide::ToPrincipal, Some(principal)) => self.link(id, principal, info.relationship),
            (NavigationSide::ToPrincipal, None) => match self.principal_of(id, info.relationship) {
                Some(principal) => self.sever(id, principal, info.relationship),
                None => Ok(()),
            },
            (NavigationSide::ToDependent, Some(dependent)) => self.link(dependent, id, info.relationship),
            (NavigationSide::ToDependent, None) => {
                let previous = self.data(id)?.reference(navigation);
                match previous {
                    Some(dependent) => {
                        let dependent = self.arena.resolve(dependent);
                        self.sever(dependent, id, info.relationship)
                    }
                    None => Ok(()),
                }
            }
        }
    }

    /// Replaces a collection navigation. Previous members missing from
    /// `targets` are severed; new members are tracked and linked.
    pub fn set_collection(&mut self, id: EntityId, navigation: &str, targets: &[EntityId]) -> Result<()> {
        let id = self.arena.resolve(id);
        let info = self.navigation_info(id, navigation, true)?;
        let mut resolved: Vec<EntityId> = Vec::with_capacity(targets.len());
        for target in targets {
            let target = self.arena.resolve(*target);
            self.check_target(navigation, info, target)?;
            if !resolved.contains(&target) {
                resolved.push(target);
            }
        }

        if !self.identity.contains(id) {
            let data = self.arena.get_mut(id).ok_or(TrackError::EntityNotFound(id))?;
            data.collections.insert(navigation.to_string(), resolved);
            return Ok(());
        }

        let previous = self.collection(id, navigation)?;
        for dependent in previous {
            if !resolved.contains(&dependent) {
                self.sever(dependent, id, info.relationship)?;
            }
        }
        let mut members = Vec::with_capacity(resolved.len());
        for target in resolved {
            let dependent = self.track_reachable(target)?;
            self.link(dependent, id, info.relationship)?;
            if !members.contains(&dependent) {
                members.push(dependent);
            }
        }
        if let Some(data) = self.arena.get_mut(id) {
            data.collections.insert(navigation.to_string(), members);
        }
        Ok(())
    }

    pub fn add_to_collection(&mut self, id: EntityId, navigation: &str, target: EntityId) -> Result<()> {
        let id = self.arena.resolve(id);
        let info = self.navigation_info(id, navigation, true)?;
        let target = self.arena.resolve(target);
        self.check_target(navigation, info, target)?;

        if !self.identity.contains(id) {
            let data = self.arena.get_mut(id).ok_or(TrackError::EntityNotFound(id))?;
            data.push_target(navigation, target);
            return Ok(());
        }
        let dependent = self.track_reachable(target)?;
        self.link(dependent, id, info.relationship)
    }

    pub fn remove_from_collection(&mut self, id: EntityId, navigation: &str, target: EntityId) -> Result<()> {
        let id = self.arena.resolve(id);
        let info = self.navigation_info(id, navigation, true)?;
        let target = self.arena.resolve(target);

        if !self.identity.contains(id) {
            let data = self.arena.get_mut(id).ok_or(TrackError::EntityNotFound(id))?;
            data.remove_target(navigation, target);
            return Ok(());
        }
        if self.data(id)?.collection(navigation).contains(&target) {
            self.sever(target, id, info.relationship)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Removal and cascades
    // ------------------------------------------------------------------

    /// Schedules an entity for deletion.
    ///
    /// A Detached entity with a key is attached first; an Added entity is
    /// simply forgotten. Tracked dependents are handled per their
    /// relationship's delete behavior, now or at save depending on
    /// `cascade_delete_timing`.
    pub fn remove(&mut self, id: EntityId) -> Result<()> {
        let id = self.arena.resolve(id);
        match self.state_of(id) {
            EntityState::Deleted => Ok(()),
            EntityState::Detached => {
                if !self.key_of(id)?.is_set() {
                    return Err(self.invalid_transition(id, Transition::Remove));
                }
                let attached = self.track_graph(id, Intent::Attach, None)?;
                self.remove(attached)
            }
            EntityState::Added => {
                // cascades first, while the entry still resolves navigations
                if let Some(entry) = self.identity.get_mut(id) {
                    entry.state = EntityState::Deleted;
                }
                self.apply_cascade(id)?;
                let root = self.type_of(id)?.root().to_string();
                if let Some(entry) = self.identity.forget(id, &root)
                    && let Some(data) = self.arena.get_mut(id)
                {
                    data.detached_shadow = entry.shadow;
                }
                self.arena.unlink_everywhere(id);
                debug!(entity = %id, "added entity removed before save");
                Ok(())
            }
            EntityState::Unchanged | EntityState::Modified => {
                if let Some(entry) = self.identity.get_mut(id) {
                    entry.state = EntityState::Deleted;
                }
                debug!(entity = %id, "entity marked deleted");
                match self.config.cascade_delete_timing {
                    CascadeTiming::Immediate => self.apply_cascade(id),
                    CascadeTiming::OnSave => {
                        self.pending_cascades.push(id);
                        Ok(())
                    }
                }
            }
        }
    }

    /// Runs cascades deferred by `CascadeTiming::OnSave`.
    pub(crate) fn apply_pending_cascades(&mut self) -> Result<()> {
        let pending = std::mem::take(&mut self.pending_cascades);
        for principal in pending {
            if self.state_of(principal) == EntityState::Deleted {
                self.apply_cascade(principal)?;
            }
        }
        Ok(())
    }

    fn apply_cascade(&mut self, principal: EntityId) -> Result<()> {
        let model = Arc::clone(&self.model);
        let type_name = self.data(principal)?.entity_type.clone();
        for &index in model.relationships_as_principal(&type_name) {
            let relationship = model.relationship(index);
            for dependent in self.dependents_of(principal, index) {
                if !matches!(
                    self.state_of(dependent),
                    EntityState::Unchanged | EntityState::Modified | EntityState::Added
                ) {
                    continue;
                }
                match relationship.on_delete() {
                    DeleteBehavior::Cascade => {
                        debug!(principal = %principal, dependent = %dependent, relationship = %relationship.name(), "cascade delete");
                        self.remove(dependent)?;
                    }
                    DeleteBehavior::ClientSetNull if !relationship.is_required() => {
                        self.unlink_navigation(dependent, principal, index);
                        for fk in relationship.foreign_key() {
                            self.write_tracked(dependent, fk, Value::Null)?;
                        }
                    }
                    // left in place; the save reports the dangling reference
                    _ => {}
                }
            }
        }
        Ok(())
    }
}
