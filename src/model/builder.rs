use super::entity::{EntityType, KeyGeneration, OwnedMapping, OwnedStorage, OwnedType, Property, UniqueIndex};
use super::relationship::{DeleteBehavior, NavigationSide, Relationship, RelationshipBuilder};
use super::{Model, NavigationRef};
use crate::core::{DataType, ModelError, Value};
use std::collections::{BTreeMap, HashMap};

type BuildResult<T> = std::result::Result<T, ModelError>;

/// Declaration of one entity type, before inheritance and owned types are
/// flattened.
#[derive(Debug, Clone)]
pub struct EntityTypeBuilder {
    name: String,
    table: Option<String>,
    base: Option<String>,
    key: Vec<String>,
    key_generation: KeyGeneration,
    properties: Vec<Property>,
    discriminator: Option<String>,
    discriminator_value: Option<Value>,
    owned: Vec<OwnedType>,
    unique: Vec<Vec<String>>,
}

impl EntityTypeBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            table: None,
            base: None,
            key: Vec::new(),
            key_generation: KeyGeneration::Client,
            properties: Vec::new(),
            discriminator: None,
            discriminator_value: None,
            owned: Vec::new(),
            unique: Vec::new(),
        }
    }

    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    /// Client-assigned key made of already declared (or later declared)
    /// properties.
    pub fn key(mut self, properties: &[&str]) -> Self {
        self.key = properties.iter().map(|p| p.to_string()).collect();
        self.key_generation = KeyGeneration::Client;
        self
    }

    /// Declares an integer identity key assigned by the store on insert.
    pub fn generated_key(mut self, property: &str) -> Self {
        self.properties
            .push(Property::new(property, DataType::Integer).not_null());
        self.key = vec![property.to_string()];
        self.key_generation = KeyGeneration::Store;
        self
    }

    pub fn property(mut self, property: Property) -> Self {
        self.properties.push(property);
        self
    }

    /// Store-only property held by the tracking entry.
    pub fn shadow_property(mut self, mut property: Property) -> Self {
        property.shadow = true;
        self.properties.push(property);
        self
    }

    pub fn derives_from(mut self, base: impl Into<String>) -> Self {
        self.base = Some(base.into());
        self
    }

    /// Discriminator column of a single-table hierarchy (declared on the root).
    pub fn discriminator(mut self, property: &str) -> Self {
        self.discriminator = Some(property.to_string());
        self
    }

    pub fn discriminator_value(mut self, value: impl Into<Value>) -> Self {
        self.discriminator_value = Some(value.into());
        self
    }

    pub fn owns_one(mut self, owned: OwnedType) -> Self {
        self.owned.push(owned);
        self
    }

    pub fn unique(mut self, properties: &[&str]) -> Self {
        self.unique
            .push(properties.iter().map(|p| p.to_string()).collect());
        self
    }
}

#[derive(Debug, Default)]
pub struct ModelBuilder {
    entities: Vec<EntityTypeBuilder>,
    relationships: Vec<RelationshipBuilder>,
}

impl ModelBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entity(mut self, entity: EntityTypeBuilder) -> Self {
        self.entities.push(entity);
        self
    }

    pub fn relationship(mut self, relationship: RelationshipBuilder) -> Self {
        self.relationships.push(relationship);
        self
    }

    pub fn build(self) -> BuildResult<Model> {
        let mut declared: BTreeMap<String, EntityTypeBuilder> = BTreeMap::new();
        for entity in self.entities {
            if declared.contains_key(&entity.name) {
                return Err(ModelError::DuplicateEntityType(entity.name));
            }
            declared.insert(entity.name.clone(), entity);
        }

        let chains = inheritance_chains(&declared)?;
        let mut entity_types = BTreeMap::new();
        for (name, chain) in &chains {
            let entity_type = flatten(name, chain, &declared, &chains)?;
            entity_types.insert(name.clone(), entity_type);
        }

        let mut relationships = Vec::with_capacity(self.relationships.len());
        for declaration in self.relationships {
            relationships.push(resolve_relationship(declaration, &entity_types)?);
        }

        let declared_navigations = declare_navigations(&relationships, &entity_types)?;

        let mut navigations: HashMap<String, BTreeMap<String, NavigationRef>> = HashMap::new();
        let mut as_dependent: HashMap<String, Vec<usize>> = HashMap::new();
        let mut as_principal: HashMap<String, Vec<usize>> = HashMap::new();
        for (name, chain) in &chains {
            let mut visible = BTreeMap::new();
            for level in chain {
                if let Some(own) = declared_navigations.get(level) {
                    for (nav_name, nav) in own {
                        if visible.insert(nav_name.clone(), *nav).is_some() {
                            return Err(ModelError::DuplicateMember {
                                entity_type: name.clone(),
                                member: nav_name.clone(),
                            });
                        }
                    }
                }
            }
            navigations.insert(name.clone(), visible);

            for (index, relationship) in relationships.iter().enumerate() {
                if chain.contains(&relationship.dependent) {
                    as_dependent.entry(name.clone()).or_default().push(index);
                }
                if chain.contains(&relationship.principal) {
                    as_principal.entry(name.clone()).or_default().push(index);
                }
            }
        }

        Ok(Model {
            entity_types,
            relationships,
            navigations,
            as_dependent,
            as_principal,
        })
    }
}

/// Root-first list of ancestors (including the type itself) for every type.
fn inheritance_chains(
    declared: &BTreeMap<String, EntityTypeBuilder>,
) -> BuildResult<BTreeMap<String, Vec<String>>> {
    let mut chains = BTreeMap::new();
    for (name, entity) in declared {
        let mut chain = vec![name.clone()];
        let mut current = entity.base.clone();
        while let Some(base) = current {
            if chain.contains(&base) {
                return Err(ModelError::InheritanceCycle(name.clone()));
            }
            let parent = declared
                .get(&base)
                .ok_or_else(|| ModelError::UnknownEntityType(base.clone()))?;
            chain.push(base);
            current = parent.base.clone();
        }
        chain.reverse();
        chains.insert(name.clone(), chain);
    }
    Ok(chains)
}

fn push_member(
    properties: &mut Vec<Property>,
    property: Property,
    entity_type: &str,
) -> BuildResult<()> {
    if properties.iter().any(|p| p.name == property.name) {
        return Err(ModelError::DuplicateMember {
            entity_type: entity_type.to_string(),
            member: property.name,
        });
    }
    properties.push(property);
    Ok(())
}

fn flatten(
    name: &str,
    chain: &[String],
    declared: &BTreeMap<String, EntityTypeBuilder>,
    chains: &BTreeMap<String, Vec<String>>,
) -> BuildResult<EntityType> {
    let root_name = &chain[0];
    let root = &declared[root_name];
    let this = &declared[name];

    if this.base.is_some() && !this.key.is_empty() {
        return Err(ModelError::DerivedKey(name.to_string()));
    }
    if root.key.is_empty() {
        return Err(ModelError::MissingKey(root_name.clone()));
    }

    let mut properties: Vec<Property> = Vec::new();
    let mut owned = Vec::new();
    let mut unique = Vec::new();
    for level in chain {
        let declaration = &declared[level];
        for property in &declaration.properties {
            push_member(&mut properties, property.clone(), name)?;
        }
        for owned_type in &declaration.owned {
            let mut names = Vec::with_capacity(owned_type.properties.len());
            for property in &owned_type.properties {
                let mut property = property.clone();
                if property.column.is_none() {
                    property.column = Some(match owned_type.storage {
                        OwnedStorage::Inline => format!("{}_{}", owned_type.name, property.name),
                        OwnedStorage::Table(_) => property.name.clone(),
                    });
                }
                property.name = format!("{}.{}", owned_type.name, property.name);
                property.owner = Some(owned_type.name.clone());
                property.shadow = false;
                names.push(property.name.clone());
                push_member(&mut properties, property, name)?;
            }
            owned.push(OwnedMapping {
                name: owned_type.name.clone(),
                storage: owned_type.storage.clone(),
                properties: names,
            });
        }
        for columns in &declaration.unique {
            unique.push(UniqueIndex {
                name: format!("UQ_{}_{}", level, columns.join("_")),
                properties: columns.clone(),
            });
        }
    }

    for key in &root.key {
        let property = properties
            .iter_mut()
            .find(|p| &p.name == key)
            .ok_or_else(|| ModelError::UnknownProperty {
                entity_type: name.to_string(),
                property: key.clone(),
            })?;
        if property.shadow {
            return Err(ModelError::ShadowKey {
                entity_type: name.to_string(),
                property: key.clone(),
            });
        }
        property.nullable = false;
    }

    for index in &unique {
        for property in &index.properties {
            if !properties.iter().any(|p| &p.name == property) {
                return Err(ModelError::UnknownProperty {
                    entity_type: name.to_string(),
                    property: property.clone(),
                });
            }
        }
    }

    let discriminator = root.discriminator.clone();
    if let Some(column) = &discriminator
        && !properties.iter().any(|p| &p.name == column)
    {
        return Err(ModelError::UnknownProperty {
            entity_type: name.to_string(),
            property: column.clone(),
        });
    }
    let hierarchy = chains
        .values()
        .any(|other| &other[0] == root_name && other.len() > 1);
    if hierarchy {
        if discriminator.is_none() {
            return Err(ModelError::MissingDiscriminator(root_name.clone()));
        }
        if this.discriminator_value.is_none() {
            return Err(ModelError::MissingDiscriminatorValue(name.to_string()));
        }
    }

    Ok(EntityType {
        name: name.to_string(),
        table: root.table.clone().unwrap_or_else(|| root_name.clone()),
        base: this.base.clone(),
        root: root_name.clone(),
        key: root.key.clone(),
        key_generation: root.key_generation,
        properties,
        discriminator,
        discriminator_value: this.discriminator_value.clone(),
        owned,
        unique,
    })
}

fn resolve_relationship(
    declaration: RelationshipBuilder,
    entity_types: &BTreeMap<String, EntityType>,
) -> BuildResult<Relationship> {
    let name = declaration.name.clone().unwrap_or_else(|| {
        format!(
            "FK_{}_{}_{}",
            declaration.dependent,
            declaration.principal,
            declaration.foreign_key.join("_")
        )
    });
    let invalid = |reason: String| ModelError::InvalidRelationship {
        relationship: name.clone(),
        reason,
    };

    let principal = entity_types
        .get(&declaration.principal)
        .ok_or_else(|| ModelError::UnknownEntityType(declaration.principal.clone()))?;
    let dependent = entity_types
        .get(&declaration.dependent)
        .ok_or_else(|| ModelError::UnknownEntityType(declaration.dependent.clone()))?;

    if declaration.foreign_key.is_empty() {
        return Err(invalid("no foreign key declared".into()));
    }
    let principal_key = principal.key.clone();
    if principal_key.len() != declaration.foreign_key.len() {
        return Err(invalid(format!(
            "foreign key has {} properties but the key of '{}' has {}",
            declaration.foreign_key.len(),
            principal.name,
            principal_key.len()
        )));
    }

    for (fk, pk) in declaration.foreign_key.iter().zip(&principal_key) {
        let fk_property = dependent
            .property(fk)
            .ok_or_else(|| ModelError::UnknownProperty {
                entity_type: dependent.name.clone(),
                property: fk.clone(),
            })?;
        let pk_property = principal
            .property(pk)
            .ok_or_else(|| ModelError::UnknownProperty {
                entity_type: principal.name.clone(),
                property: pk.clone(),
            })?;
        if fk_property.data_type != pk_property.data_type {
            return Err(invalid(format!(
                "foreign key '{}' is {} but '{}.{}' is {}",
                fk, fk_property.data_type, principal.name, pk, pk_property.data_type
            )));
        }
        if dependent.is_key(fk) {
            return Err(invalid(format!("foreign key '{}' is part of the key", fk)));
        }
        if declaration.required && fk_property.nullable {
            return Err(invalid(format!(
                "required relationship needs a non-nullable foreign key, '{}' is nullable",
                fk
            )));
        }
        if !declaration.required && !fk_property.nullable {
            return Err(invalid(format!(
                "optional relationship needs a nullable foreign key, '{}' is not",
                fk
            )));
        }
    }

    let on_delete = declaration.on_delete.unwrap_or(if declaration.required {
        DeleteBehavior::Cascade
    } else {
        DeleteBehavior::ClientSetNull
    });
    if declaration.store_cascade && on_delete != DeleteBehavior::Cascade {
        return Err(invalid(format!(
            "store cascade requires CASCADE, got {}",
            on_delete
        )));
    }

    Ok(Relationship {
        name,
        principal: declaration.principal,
        dependent: declaration.dependent,
        cardinality: declaration.cardinality,
        foreign_key: declaration.foreign_key,
        principal_key,
        principal_navigation: declaration.principal_navigation,
        dependent_navigation: declaration.dependent_navigation,
        required: declaration.required,
        on_delete,
        store_cascade: declaration.store_cascade,
    })
}

/// Navigations keyed by the type that declares them.
fn declare_navigations(
    relationships: &[Relationship],
    entity_types: &BTreeMap<String, EntityType>,
) -> BuildResult<HashMap<String, BTreeMap<String, NavigationRef>>> {
    let mut declared: HashMap<String, BTreeMap<String, NavigationRef>> = HashMap::new();
    for (index, relationship) in relationships.iter().enumerate() {
        let sides = [
            (
                &relationship.dependent,
                &relationship.dependent_navigation,
                NavigationSide::ToPrincipal,
            ),
            (
                &relationship.principal,
                &relationship.principal_navigation,
                NavigationSide::ToDependent,
            ),
        ];
        for (owner, navigation, side) in sides {
            let Some(navigation) = navigation else {
                continue;
            };
            let clashes_with_property = entity_types
                .get(owner)
                .is_some_and(|t| t.property(navigation).is_some());
            let navs = declared.entry(owner.clone()).or_default();
            if clashes_with_property || navs.contains_key(navigation) {
                return Err(ModelError::DuplicateMember {
                    entity_type: owner.clone(),
                    member: navigation.clone(),
                });
            }
            navs.insert(
                navigation.clone(),
                NavigationRef {
                    relationship: index,
                    side,
                },
            );
        }
    }
    Ok(declared)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Cardinality, OwnedType};

    fn player() -> EntityTypeBuilder {
        EntityTypeBuilder::new("Player")
            .generated_key("PlayerId")
            .property(Property::new("Name", DataType::Text).not_null())
    }

    fn item() -> EntityTypeBuilder {
        EntityTypeBuilder::new("Item")
            .generated_key("ItemId")
            .property(Property::new("TemplateId", DataType::Integer).not_null())
            .property(Property::new("OwnerId", DataType::Integer).not_null())
            .property(Property::new("Type", DataType::Integer).not_null())
            .discriminator("Type")
            .discriminator_value(0)
    }

    #[test]
    fn test_build_simple_relationship() {
        let model = ModelBuilder::new()
            .entity(player())
            .entity(item())
            .entity(
                EntityTypeBuilder::new("EventItem")
                    .derives_from("Item")
                    .property(Property::new("DestroyDate", DataType::Timestamp))
                    .discriminator_value(1),
            )
            .relationship(
                RelationshipBuilder::one_to_one("Player", "Item")
                    .foreign_key(&["OwnerId"])
                    .principal_navigation("OwnedItem")
                    .dependent_navigation("Owner")
                    .required(),
            )
            .build()
            .unwrap();

        let rel = &model.relationships()[0];
        assert_eq!(rel.name(), "FK_Item_Player_OwnerId");
        assert_eq!(rel.on_delete(), DeleteBehavior::Cascade);
        assert_eq!(rel.cardinality(), Cardinality::OneToOne);
        assert_eq!(rel.principal_key(), &["PlayerId".to_string()]);

        // inherited navigation and relationship membership
        assert!(model.navigation("EventItem", "Owner").is_some());
        assert_eq!(model.relationships_as_dependent("EventItem"), &[0]);

        let event_item = model.entity_type("EventItem").unwrap();
        assert_eq!(event_item.table(), "Item");
        assert_eq!(event_item.root(), "Item");
        assert_eq!(event_item.key(), &["ItemId".to_string()]);
        assert!(event_item.property("DestroyDate").is_some());
        assert!(model.is_assignable("EventItem", "Item"));
        assert!(!model.is_assignable("Item", "EventItem"));
        assert_eq!(
            model
                .resolve_discriminated("Item", &Value::Integer(1))
                .map(|t| t.name()),
            Some("EventItem")
        );
    }

    #[test]
    fn test_owned_columns() {
        let model = ModelBuilder::new()
            .entity(
                player().owns_one(
                    OwnedType::new("Stats").property(Property::new("Level", DataType::Integer)),
                ),
            )
            .entity(
                EntityTypeBuilder::new("Guild")
                    .generated_key("GuildId")
                    .owns_one(
                        OwnedType::new("Banner")
                            .property(Property::new("Color", DataType::Text))
                            .to_table("GuildBanner"),
                    ),
            )
            .build()
            .unwrap();

        let player = model.entity_type("Player").unwrap();
        let level = player.property("Stats.Level").unwrap();
        assert_eq!(level.column_name(), "Stats_Level");
        assert_eq!(level.owned_by(), Some("Stats"));

        let guild = model.entity_type("Guild").unwrap();
        assert_eq!(guild.property("Banner.Color").unwrap().column_name(), "Color");
        assert!(guild.satellite_of("Banner.Color").is_some());
        assert_eq!(guild.table_properties().count(), 1);
    }

    #[test]
    fn test_validation_errors() {
        let err = ModelBuilder::new()
            .entity(player())
            .entity(player())
            .build()
            .unwrap_err();
        assert_eq!(err, ModelError::DuplicateEntityType("Player".into()));

        let err = ModelBuilder::new()
            .entity(EntityTypeBuilder::new("Guild"))
            .build()
            .unwrap_err();
        assert_eq!(err, ModelError::MissingKey("Guild".into()));

        // optional relationship over a non-nullable foreign key
        let err = ModelBuilder::new()
            .entity(player())
            .entity(item())
            .relationship(RelationshipBuilder::one_to_many("Player", "Item").foreign_key(&["OwnerId"]))
            .build()
            .unwrap_err();
        assert!(matches!(err, ModelError::InvalidRelationship { .. }));

        let err = ModelBuilder::new()
            .entity(player())
            .entity(item())
            .entity(EntityTypeBuilder::new("EventItem").derives_from("Item"))
            .build()
            .unwrap_err();
        assert_eq!(err, ModelError::MissingDiscriminatorValue("EventItem".into()));

        let err = ModelBuilder::new()
            .entity(EntityTypeBuilder::new("A").derives_from("B"))
            .entity(EntityTypeBuilder::new("B").derives_from("A"))
            .build()
            .unwrap_err();
        assert!(matches!(err, ModelError::InheritanceCycle(_)));
    }

    #[test]
    fn test_navigation_name_clash() {
        let err = ModelBuilder::new()
            .entity(player())
            .entity(item())
            .relationship(
                RelationshipBuilder::one_to_many("Player", "Item")
                    .foreign_key(&["OwnerId"])
                    .required()
                    .principal_navigation("Name"),
            )
            .build()
            .unwrap_err();
        assert_eq!(
            err,
            ModelError::DuplicateMember {
                entity_type: "Player".into(),
                member: "Name".into()
            }
        );
    }
}
