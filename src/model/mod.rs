// ============================================================================
// Mapping Model
// ============================================================================
//
// Read-only description of entity types, keys, properties, relationships,
// discriminated hierarchies and owned types. Built once through
// `ModelBuilder`, validated, then shared (`Arc<Model>`) by every unit of
// work that tracks entities of these types.
//
// ============================================================================

pub mod builder;
pub mod entity;
pub mod relationship;

pub use builder::{EntityTypeBuilder, ModelBuilder};
pub use entity::{
    EntityType, KeyGeneration, OwnedMapping, OwnedStorage, OwnedType, Property, UniqueIndex,
    UuidGenerator, ValueDefault, ValueGenerator,
};
pub use relationship::{
    Cardinality, DeleteBehavior, Navigation, NavigationSide, Relationship, RelationshipBuilder,
};

use crate::core::{Result, TrackError, Value};
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone, Copy)]
pub(crate) struct NavigationRef {
    pub relationship: usize,
    pub side: NavigationSide,
}

#[derive(Debug)]
pub struct Model {
    pub(crate) entity_types: BTreeMap<String, EntityType>,
    pub(crate) relationships: Vec<Relationship>,
    // entity type -> navigation name -> relationship, including inherited ones
    pub(crate) navigations: HashMap<String, BTreeMap<String, NavigationRef>>,
    pub(crate) as_dependent: HashMap<String, Vec<usize>>,
    pub(crate) as_principal: HashMap<String, Vec<usize>>,
}

impl Model {
    pub fn builder() -> ModelBuilder {
        ModelBuilder::new()
    }

    pub fn entity_type(&self, name: &str) -> Option<&EntityType> {
        self.entity_types.get(name)
    }

    pub fn entity_types(&self) -> impl Iterator<Item = &EntityType> + '_ {
        self.entity_types.values()
    }

    pub(crate) fn require_type(&self, name: &str) -> Result<&EntityType> {
        self.entity_types
            .get(name)
            .ok_or_else(|| TrackError::UnknownEntityType(name.to_string()))
    }

    pub fn relationships(&self) -> &[Relationship] {
        &self.relationships
    }

    pub fn relationship(&self, index: usize) -> &Relationship {
        &self.relationships[index]
    }

    /// `entity_type` is `target` or derives from it.
    pub fn is_assignable(&self, entity_type: &str, target: &str) -> bool {
        let mut current = Some(entity_type);
        while let Some(name) = current {
            if name == target {
                return true;
            }
            current = self.entity_types.get(name).and_then(|t| t.base());
        }
        false
    }

    pub fn navigation(&self, entity_type: &str, navigation: &str) -> Option<Navigation<'_>> {
        let nav = self.navigations.get(entity_type)?.get(navigation)?;
        Some(Navigation {
            relationship: &self.relationships[nav.relationship],
            index: nav.relationship,
            side: nav.side,
        })
    }

    pub fn navigations_of(&self, entity_type: &str) -> Vec<(&str, Navigation<'_>)> {
        self.navigations
            .get(entity_type)
            .map(|navs| {
                navs.iter()
                    .map(|(name, nav)| {
                        (
                            name.as_str(),
                            Navigation {
                                relationship: &self.relationships[nav.relationship],
                                index: nav.relationship,
                                side: nav.side,
                            },
                        )
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Relationships in which `entity_type` holds the foreign key.
    pub fn relationships_as_dependent(&self, entity_type: &str) -> &[usize] {
        self.as_dependent
            .get(entity_type)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Relationships in which `entity_type` is referenced.
    pub fn relationships_as_principal(&self, entity_type: &str) -> &[usize] {
        self.as_principal
            .get(entity_type)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Picks the concrete type of a row read from a hierarchy's table.
    pub fn resolve_discriminated(&self, root: &str, discriminator: &Value) -> Option<&EntityType> {
        self.entity_types
            .values()
            .find(|t| t.root() == root && t.discriminator_value() == Some(discriminator))
    }
}
