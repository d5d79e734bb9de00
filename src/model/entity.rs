use crate::core::{DataType, Row, Value};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Who assigns key values for new rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyGeneration {
    /// The store generates the key on insert (identity column).
    Store,
    /// The caller supplies the key before saving.
    Client,
}

/// Client-side value generator invoked for Added entities on save.
pub trait ValueGenerator: Send + Sync {
    fn next_value(&self, entity_type: &str, current: &Row) -> Value;
}

impl<F> ValueGenerator for F
where
    F: Fn(&str, &Row) -> Value + Send + Sync,
{
    fn next_value(&self, entity_type: &str, current: &Row) -> Value {
        self(entity_type, current)
    }
}

/// Generates random v4 UUID text values.
#[derive(Debug, Clone, Copy, Default)]
pub struct UuidGenerator;

impl ValueGenerator for UuidGenerator {
    fn next_value(&self, _entity_type: &str, _current: &Row) -> Value {
        Value::Text(Uuid::new_v4().to_string())
    }
}

/// Value used for an unset (NULL) property when its entity is inserted.
#[derive(Clone)]
pub enum ValueDefault {
    Literal(Value),
    CurrentTimestamp,
    Generator(Arc<dyn ValueGenerator>),
}

impl ValueDefault {
    pub fn produce(&self, entity_type: &str, current: &Row) -> Value {
        match self {
            Self::Literal(value) => value.clone(),
            Self::CurrentTimestamp => Value::Timestamp(chrono::Utc::now()),
            Self::Generator(generator) => generator.next_value(entity_type, current),
        }
    }
}

impl fmt::Debug for ValueDefault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Literal(value) => f.debug_tuple("Literal").field(value).finish(),
            Self::CurrentTimestamp => write!(f, "CurrentTimestamp"),
            Self::Generator(_) => write!(f, "Generator(..)"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Property {
    pub(crate) name: String,
    pub(crate) data_type: DataType,
    pub(crate) nullable: bool,
    pub(crate) column: Option<String>,
    pub(crate) default: Option<ValueDefault>,
    pub(crate) shadow: bool,
    pub(crate) owner: Option<String>,
}

impl Property {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            nullable: true,
            column: None,
            default: None,
            shadow: false,
            owner: None,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn column(mut self, column: impl Into<String>) -> Self {
        self.column = Some(column.into());
        self
    }

    pub fn default_value(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(ValueDefault::Literal(value.into()));
        self
    }

    pub fn default_now(mut self) -> Self {
        self.default = Some(ValueDefault::CurrentTimestamp);
        self
    }

    pub fn generated_by(mut self, generator: impl ValueGenerator + 'static) -> Self {
        self.default = Some(ValueDefault::Generator(Arc::new(generator)));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    pub fn is_nullable(&self) -> bool {
        self.nullable
    }

    pub fn column_name(&self) -> &str {
        self.column.as_deref().unwrap_or(&self.name)
    }

    pub fn default(&self) -> Option<&ValueDefault> {
        self.default.as_ref()
    }

    /// Shadow properties live in the tracking entry, not in the entity.
    pub fn is_shadow(&self) -> bool {
        self.shadow
    }

    /// Name of the owned type this property belongs to, if any.
    pub fn owned_by(&self) -> Option<&str> {
        self.owner.as_deref()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OwnedStorage {
    /// Columns `<Owned>_<Property>` in the owner's table.
    Inline,
    /// A satellite table keyed by the owner's key columns.
    Table(String),
}

/// Value object owned by an entity (no identity of its own).
#[derive(Debug, Clone)]
pub struct OwnedType {
    pub(crate) name: String,
    pub(crate) properties: Vec<Property>,
    pub(crate) storage: OwnedStorage,
}

impl OwnedType {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            properties: Vec::new(),
            storage: OwnedStorage::Inline,
        }
    }

    pub fn property(mut self, property: Property) -> Self {
        self.properties.push(property);
        self
    }

    pub fn to_table(mut self, table: impl Into<String>) -> Self {
        self.storage = OwnedStorage::Table(table.into());
        self
    }
}

/// Owned type after model building: property names are `<Owned>.<Property>`.
#[derive(Debug, Clone)]
pub struct OwnedMapping {
    pub(crate) name: String,
    pub(crate) storage: OwnedStorage,
    pub(crate) properties: Vec<String>,
}

impl OwnedMapping {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn storage(&self) -> &OwnedStorage {
        &self.storage
    }

    pub fn satellite_table(&self) -> Option<&str> {
        match &self.storage {
            OwnedStorage::Table(table) => Some(table),
            OwnedStorage::Inline => None,
        }
    }

    pub fn properties(&self) -> &[String] {
        &self.properties
    }

    /// An owned value is present when any of its properties is non-null.
    pub fn is_present(&self, values: &Row) -> bool {
        self.properties
            .iter()
            .any(|prop| values.get(prop).is_some_and(|value| !value.is_null()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UniqueIndex {
    pub name: String,
    pub properties: Vec<String>,
}

/// Fully resolved entity type: inherited, owned and shadow properties are
/// flattened into one property list.
#[derive(Debug, Clone)]
pub struct EntityType {
    pub(crate) name: String,
    pub(crate) table: String,
    pub(crate) base: Option<String>,
    pub(crate) root: String,
    pub(crate) key: Vec<String>,
    pub(crate) key_generation: KeyGeneration,
    pub(crate) properties: Vec<Property>,
    pub(crate) discriminator: Option<String>,
    pub(crate) discriminator_value: Option<Value>,
    pub(crate) owned: Vec<OwnedMapping>,
    pub(crate) unique: Vec<UniqueIndex>,
}

impl EntityType {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn base(&self) -> Option<&str> {
        self.base.as_deref()
    }

    /// Root of the type's hierarchy; identities are scoped per root.
    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn key(&self) -> &[String] {
        &self.key
    }

    pub fn key_generation(&self) -> KeyGeneration {
        self.key_generation
    }

    pub fn is_key(&self, property: &str) -> bool {
        self.key.iter().any(|k| k == property)
    }

    pub fn properties(&self) -> &[Property] {
        &self.properties
    }

    pub fn property(&self, name: &str) -> Option<&Property> {
        self.properties.iter().find(|p| p.name == name)
    }

    pub fn discriminator(&self) -> Option<&str> {
        self.discriminator.as_deref()
    }

    pub fn discriminator_value(&self) -> Option<&Value> {
        self.discriminator_value.as_ref()
    }

    pub fn owned(&self) -> &[OwnedMapping] {
        &self.owned
    }

    /// Owned mapping stored in a satellite table that holds `property`.
    pub fn satellite_of(&self, property: &str) -> Option<&OwnedMapping> {
        let owner = self.property(property)?.owned_by()?;
        self.owned
            .iter()
            .find(|o| o.name == owner && o.satellite_table().is_some())
    }

    pub fn unique_indexes(&self) -> &[UniqueIndex] {
        &self.unique
    }

    /// Properties written to the entity's own table.
    pub fn table_properties(&self) -> impl Iterator<Item = &Property> + '_ {
        self.properties
            .iter()
            .filter(|p| self.satellite_of(&p.name).is_none())
    }

    pub fn property_for_column(&self, column: &str) -> Option<&Property> {
        self.table_properties().find(|p| p.column_name() == column)
    }
}
