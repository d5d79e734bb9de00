use crate::config::ContextConfig;
use crate::core::{EntityId, EntryHandle, Key, Result, Row, Value};
use crate::executor::CommandExecutor;
use crate::hooks::SaveInterceptor;
use crate::model::Model;
use crate::persistence::{SaveReport, save_changes};
use crate::tracking::{ChangeTracker, EntityData, EntityState, Entry, GraphVisitor, Intent};
use std::sync::Arc;
use tracing::debug;

/// A unit of work: tracks entities of one model and saves their changes
/// through one command executor.
///
/// # Examples
///
/// ```
/// use memotrack::{DbContext, DataType, EntityTypeBuilder, MemoryStore, Model, Property, Value};
/// use std::sync::Arc;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let model = Arc::new(
///     Model::builder()
///         .entity(
///             EntityTypeBuilder::new("Player")
///                 .generated_key("PlayerId")
///                 .property(Property::new("Name", DataType::Text).not_null()),
///         )
///         .build()?,
/// );
/// let store = MemoryStore::from_model(Arc::clone(&model))?;
/// let mut ctx = DbContext::new(model, store.executor());
///
/// let player = ctx.create("Player")?;
/// ctx.set_value(player, "Name", "Rookiss")?;
/// ctx.track_new(player)?;
///
/// let report = ctx.save().await?;
/// assert_eq!(report.inserted, 1);
/// assert_eq!(ctx.value(player, "PlayerId")?, Value::Integer(1));
/// # Ok(())
/// # }
/// ```
pub struct DbContext<E: CommandExecutor> {
    tracker: ChangeTracker,
    executor: E,
    interceptors: Vec<Box<dyn SaveInterceptor>>,
}

impl<E: CommandExecutor> DbContext<E> {
    pub fn new(model: Arc<Model>, executor: E) -> Self {
        Self {
            tracker: ChangeTracker::new(model, ContextConfig::default()),
            executor,
            interceptors: Vec::new(),
        }
    }

    pub fn with_config(model: Arc<Model>, executor: E, config: ContextConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            tracker: ChangeTracker::new(model, config),
            executor,
            interceptors: Vec::new(),
        })
    }

    pub fn add_interceptor(&mut self, interceptor: impl SaveInterceptor + 'static) {
        self.interceptors.push(Box::new(interceptor));
    }

    pub fn model(&self) -> &Model {
        self.tracker.model()
    }

    pub fn config(&self) -> &ContextConfig {
        self.tracker.config()
    }

    pub fn tracker(&self) -> &ChangeTracker {
        &self.tracker
    }

    pub fn tracker_mut(&mut self) -> &mut ChangeTracker {
        &mut self.tracker
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    // ------------------------------------------------------------------
    // Tracking
    // ------------------------------------------------------------------

    /// Tracks `entity` and every untracked entity reachable from it as
    /// Added, whatever their keys.
    pub fn track_new(&mut self, entity: EntityId) -> Result<EntryHandle> {
        self.tracker.track_graph(entity, Intent::Add, None)
    }

    /// Tracks a graph read elsewhere: entities with a key become Unchanged,
    /// the others Added.
    pub fn track_existing(&mut self, entity: EntityId) -> Result<EntryHandle> {
        self.tracker.track_graph(entity, Intent::Attach, None)
    }

    /// Tracks a graph whose keyed entities are all rewritten on save: every
    /// non-key property is flagged modified.
    pub fn replace_with_bulk_update(&mut self, entity: EntityId) -> Result<EntryHandle> {
        self.tracker.track_graph(entity, Intent::Update, None)
    }

    pub fn mark_for_deletion(&mut self, handle: EntryHandle) -> Result<()> {
        self.tracker.remove(handle)
    }

    /// Attaches a graph, letting `visitor` decide the state of every entity
    /// the walk discovers.
    pub fn walk_graph(&mut self, root: EntityId, mut visitor: impl GraphVisitor) -> Result<EntryHandle> {
        self.tracker.track_graph(root, Intent::Attach, Some(&mut visitor))
    }

    pub fn find_entry(&self, entity_type: &str, key: &Key) -> Option<EntryHandle> {
        self.tracker.find_entry(entity_type, key)
    }

    pub fn detach(&mut self, entity: EntityId) -> Result<()> {
        self.tracker.detach(entity)
    }

    pub fn materialize(&mut self, entity_type: &str, row: &Row) -> Result<EntityId> {
        self.tracker.materialize(entity_type, row)
    }

    pub fn reload(&mut self, entity: EntityId, row: Option<&Row>) -> Result<()> {
        self.tracker.reload(entity, row)
    }

    // ------------------------------------------------------------------
    // Entities and entries
    // ------------------------------------------------------------------

    pub fn create(&mut self, entity_type: &str) -> Result<EntityId> {
        self.tracker.create(entity_type)
    }

    pub fn entity(&self, entity: EntityId) -> Option<&EntityData> {
        self.tracker.entity(self.tracker.resolve(entity))
    }

    pub fn value(&self, entity: EntityId, property: &str) -> Result<Value> {
        self.tracker.value(entity, property)
    }

    pub fn current_values(&self, entity: EntityId) -> Result<Row> {
        self.tracker.current_values(entity)
    }

    pub fn set_value(&mut self, entity: EntityId, property: &str, value: impl Into<Value>) -> Result<()> {
        self.tracker.set_value(entity, property, value)
    }

    pub fn values_mut(&mut self, entity: EntityId) -> Result<&mut Row> {
        let entity = self.tracker.resolve(entity);
        self.tracker.values_mut(entity)
    }

    pub fn reference(&self, entity: EntityId, navigation: &str) -> Result<Option<EntityId>> {
        self.tracker.reference(entity, navigation)
    }

    pub fn collection(&self, entity: EntityId, navigation: &str) -> Result<Vec<EntityId>> {
        self.tracker.collection(entity, navigation)
    }

    pub fn set_reference(&mut self, entity: EntityId, navigation: &str, target: Option<EntityId>) -> Result<()> {
        self.tracker.set_reference(entity, navigation, target)
    }

    pub fn set_collection(&mut self, entity: EntityId, navigation: &str, targets: &[EntityId]) -> Result<()> {
        self.tracker.set_collection(entity, navigation, targets)
    }

    pub fn add_to_collection(&mut self, entity: EntityId, navigation: &str, target: EntityId) -> Result<()> {
        self.tracker.add_to_collection(entity, navigation, target)
    }

    pub fn remove_from_collection(&mut self, entity: EntityId, navigation: &str, target: EntityId) -> Result<()> {
        self.tracker.remove_from_collection(entity, navigation, target)
    }

    pub fn entry(&self, handle: EntryHandle) -> Option<&Entry> {
        self.tracker.entry(handle)
    }

    pub fn entries(&self) -> impl Iterator<Item = &Entry> + '_ {
        self.tracker.entries()
    }

    pub fn state_of(&self, handle: EntryHandle) -> EntityState {
        self.tracker.state_of(handle)
    }

    pub fn set_state(&mut self, handle: EntryHandle, state: EntityState) -> Result<()> {
        self.tracker.set_state(handle, state)
    }

    pub fn set_property_modified(&mut self, handle: EntryHandle, property: &str, modified: bool) -> Result<()> {
        self.tracker.set_property_modified(handle, property, modified)
    }

    pub fn detect_changes(&mut self) -> Result<()> {
        self.tracker.detect_changes()
    }

    pub fn has_changes(&self) -> bool {
        self.tracker.has_changes()
    }

    // ------------------------------------------------------------------
    // Save
    // ------------------------------------------------------------------

    /// Writes every pending change in one executor transaction.
    ///
    /// Any failure rolls the transaction back and leaves every entry in its
    /// pre-save state, so the save can be retried after fixing the cause.
    ///
    /// ```
    /// # use memotrack::{DbContext, MemoryStore, Model};
    /// # use std::sync::Arc;
    /// # tokio_test::block_on(async {
    /// let model = Arc::new(Model::builder().build().unwrap());
    /// let store = MemoryStore::from_model(Arc::clone(&model)).unwrap();
    /// let mut ctx = DbContext::new(model, store.executor());
    ///
    /// // nothing tracked: no transaction is opened
    /// let report = ctx.save().await.unwrap();
    /// assert!(report.is_empty());
    /// # });
    /// ```
    pub async fn save(&mut self) -> Result<SaveReport> {
        debug!(entries = self.tracker.entries().count(), "saving changes");
        save_changes(&mut self.tracker, &mut self.executor, &self.interceptors).await
    }
}
