// ============================================================================
// memotrack Library
// ============================================================================
//
// Change tracking and persistence reconciliation for object-relational
// mapping: an identity map of tracked entities, per-entity lifecycle states,
// snapshot change detection, relationship fixup over entity graphs and a save
// pipeline that orders store commands by foreign-key dependencies.
//
// ============================================================================

pub mod config;
pub mod context;
pub mod core;
pub mod executor;
pub mod hooks;
pub mod model;
pub mod persistence;
pub mod tracking;

pub use config::{CascadeTiming, ContextConfig, IdentityResolution};
pub use context::DbContext;
pub use core::{
    Columns, DataType, EntityId, EntryHandle, Key, ModelError, Result, Row, StoreError, StoreResult,
    TrackError, Value,
};
pub use executor::{CommandExecutor, MemoryExecutor, MemoryStore};
pub use hooks::{CreatedAtInterceptor, SaveInterceptor};
pub use model::{
    Cardinality, DeleteBehavior, EntityType, EntityTypeBuilder, KeyGeneration, Model, ModelBuilder,
    OwnedType, Property, Relationship, RelationshipBuilder, UuidGenerator, ValueGenerator,
};
pub use persistence::{CommandKind, ExecutedCommand, SaveReport};
pub use tracking::{ChangeTracker, EntityData, EntityState, Entry, GraphNode, GraphVisitor, Intent};
