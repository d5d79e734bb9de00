use super::{DataType, EntityId, Key};
use crate::tracking::EntityState;
use thiserror::Error;

/// Errors raised while building a mapping model.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModelError {
    #[error("Entity type '{0}' is declared more than once")]
    DuplicateEntityType(String),

    #[error("Entity type '{0}' is not declared")]
    UnknownEntityType(String),

    #[error("Entity type '{0}' has no key")]
    MissingKey(String),

    #[error("Property '{property}' is not declared on '{entity_type}'")]
    UnknownProperty {
        entity_type: String,
        property: String,
    },

    #[error("Member '{member}' is declared more than once on '{entity_type}'")]
    DuplicateMember { entity_type: String, member: String },

    #[error("Derived type '{0}' cannot declare its own key")]
    DerivedKey(String),

    #[error("Hierarchy rooted at '{0}' needs a discriminator")]
    MissingDiscriminator(String),

    #[error("Type '{0}' in a discriminated hierarchy has no discriminator value")]
    MissingDiscriminatorValue(String),

    #[error("Key property '{property}' of '{entity_type}' cannot be a shadow property")]
    ShadowKey {
        entity_type: String,
        property: String,
    },

    #[error("Relationship '{relationship}': {reason}")]
    InvalidRelationship { relationship: String, reason: String },

    #[error("Inheritance cycle through '{0}'")]
    InheritanceCycle(String),
}

/// Errors reported by a command executor.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Table '{0}' not found")]
    TableNotFound(String),

    #[error("Column '{column}' not found in table '{table}'")]
    UnknownColumn { table: String, column: String },

    #[error("Type mismatch in '{table}.{column}': expected {expected}, got {actual}")]
    TypeMismatch {
        table: String,
        column: String,
        expected: DataType,
        actual: &'static str,
    },

    #[error("Column '{table}.{column}' cannot be NULL")]
    NotNullViolation { table: String, column: String },

    #[error("Unique constraint '{constraint}' violated on table '{table}' by key {key}")]
    UniqueViolation {
        table: String,
        constraint: String,
        key: Key,
    },

    #[error("Foreign key constraint '{constraint}' violated on table '{table}'")]
    ForeignKeyViolation { table: String, constraint: String },

    #[error("No row with key {key} in table '{table}'")]
    RowNotFound { table: String, key: Key },

    #[error("Transaction error: {0}")]
    Transaction(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Errors raised by the tracking engine.
#[derive(Error, Debug)]
pub enum TrackError {
    #[error("{entity_type} with key {key} is already tracked by a different instance")]
    DuplicateIdentity { entity_type: String, key: Key },

    #[error("Invalid transition for {entity_type} {entity}: cannot {operation} from {from}")]
    InvalidTransition {
        entity_type: String,
        entity: EntityId,
        from: EntityState,
        operation: &'static str,
    },

    #[error("Relationship '{relationship}' violated by {entity_type} {entity}: {reason}")]
    RequiredRelationshipViolation {
        relationship: String,
        entity_type: String,
        entity: EntityId,
        reason: String,
    },

    #[error("Store rejected command for {entity_type} {entity}: {source}")]
    Persistence {
        entity_type: String,
        entity: EntityId,
        #[source]
        source: StoreError,
    },

    #[error("Store transaction failed: {0}")]
    Transaction(#[source] StoreError),

    #[error("Required relationships form a cycle between: {}", entity_types.join(", "))]
    CascadeCycle { entity_types: Vec<String> },

    #[error("Entity type '{0}' is not part of the model")]
    UnknownEntityType(String),

    #[error("Property '{property}' not found on '{entity_type}'")]
    UnknownProperty {
        entity_type: String,
        property: String,
    },

    #[error("Navigation '{navigation}' not found on '{entity_type}'")]
    UnknownNavigation {
        entity_type: String,
        navigation: String,
    },

    #[error("Navigation '{navigation}' on '{entity_type}' is not a {expected} navigation")]
    NavigationKind {
        entity_type: String,
        navigation: String,
        expected: &'static str,
    },

    #[error("Navigation '{navigation}' expects {expected}, got {actual}")]
    InvalidNavigationTarget {
        navigation: String,
        expected: String,
        actual: String,
    },

    #[error("Entity {0} does not exist")]
    EntityNotFound(EntityId),

    #[error("Row for '{0}' carries no key value")]
    MissingKey(String),

    #[error("Graph traversal exceeded the maximum depth of {0}")]
    GraphDepthExceeded(usize),

    #[error("Property '{entity_type}.{property}' expects {expected}, got {actual}")]
    TypeMismatch {
        entity_type: String,
        property: String,
        expected: DataType,
        actual: &'static str,
    },

    #[error("Key property '{entity_type}.{property}' of a persisted entity cannot change")]
    KeyModification {
        entity_type: String,
        property: String,
    },

    #[error("Property '{entity_type}.{property}' is maintained by the engine")]
    ReadOnlyProperty {
        entity_type: String,
        property: String,
    },

    #[error("Model error: {0}")]
    Model(#[from] ModelError),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, TrackError>;
