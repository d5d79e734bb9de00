use super::change::Change;
use super::table::{ColumnDef, ForeignKeyDef, ReferentialAction, Table, TableSchema, UniqueDef};
use super::CommandExecutor;
use crate::core::{Columns, Key, Row, StoreError, StoreResult, Value};
use crate::model::{EntityType, Model};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

/// All tables of a memory store.
#[derive(Debug, Default)]
pub struct StoreState {
    tables: BTreeMap<String, Table>,
}

impl StoreState {
    pub fn table(&self, name: &str) -> StoreResult<&Table> {
        self.tables
            .get(name)
            .ok_or_else(|| StoreError::TableNotFound(name.to_string()))
    }

    fn table_mut(&mut self, name: &str) -> StoreResult<&mut Table> {
        self.tables
            .get_mut(name)
            .ok_or_else(|| StoreError::TableNotFound(name.to_string()))
    }

    pub fn create_table(&mut self, schema: TableSchema) {
        self.tables
            .insert(schema.name().to_string(), Table::new(schema));
    }

    /// Every non-NULL foreign key of `row` must reference an existing row.
    fn check_references(&self, table: &str, row: &Row) -> StoreResult<()> {
        for fk in &self.table(table)?.schema().foreign_keys {
            let values: Vec<Value> = fk
                .columns
                .iter()
                .map(|c| row.get(c).cloned().unwrap_or(Value::Null))
                .collect();
            if values.iter().any(Value::is_null) {
                continue;
            }
            if !self.table(&fk.references)?.contains(&Key::new(values)) {
                return Err(StoreError::ForeignKeyViolation {
                    table: table.to_string(),
                    constraint: fk.name.clone(),
                });
            }
        }
        Ok(())
    }

    pub fn insert(&mut self, table: &str, values: &Columns, journal: &mut Vec<Change>) -> StoreResult<Option<Value>> {
        let (key, generated) = self.table_mut(table)?.insert(values)?;
        let row = self.table(table)?.get(&key).cloned().unwrap_or_default();
        if let Err(err) = self.check_references(table, &row) {
            self.table_mut(table)?.delete(&key);
            return Err(err);
        }
        journal.push(Change::InsertRow {
            table: table.to_string(),
            key,
        });
        Ok(generated)
    }

    pub fn update(&mut self, table: &str, key: &Columns, changed: &Columns, journal: &mut Vec<Change>) -> StoreResult<u64> {
        let key = self.table(table)?.key_from(key)?;
        let Some(old_row) = self.table_mut(table)?.update(&key, changed)? else {
            return Ok(0);
        };
        let new_row = self.table(table)?.get(&key).cloned().unwrap_or_default();
        if let Err(err) = self.check_references(table, &new_row) {
            self.table_mut(table)?.restore(key, old_row);
            return Err(err);
        }
        journal.push(Change::UpdateRow {
            table: table.to_string(),
            key,
            old_row,
        });
        Ok(1)
    }

    pub fn delete(&mut self, table: &str, key: &Columns, journal: &mut Vec<Change>) -> StoreResult<u64> {
        let key = self.table(table)?.key_from(key)?;
        if !self.table(table)?.contains(&key) {
            return Ok(0);
        }
        let mark = journal.len();
        if let Err(err) = self.delete_cascading(table, &key, journal) {
            let undo: Vec<Change> = journal.drain(mark..).collect();
            for change in undo.into_iter().rev() {
                self.revert(change);
            }
            return Err(err);
        }
        Ok(1)
    }

    fn delete_cascading(&mut self, table: &str, key: &Key, journal: &mut Vec<Change>) -> StoreResult<()> {
        let referencing: Vec<(String, ForeignKeyDef)> = self
            .tables
            .values()
            .flat_map(|t| {
                t.schema()
                    .foreign_keys
                    .iter()
                    .filter(|fk| fk.references == table)
                    .map(move |fk| (t.name().to_string(), fk.clone()))
            })
            .collect();

        for (child, fk) in referencing {
            let rows = self.table(&child)?.find_by(&fk.columns, key.parts());
            if rows.is_empty() {
                continue;
            }
            match fk.on_delete {
                ReferentialAction::Restrict => {
                    return Err(StoreError::ForeignKeyViolation {
                        table: child,
                        constraint: fk.name,
                    });
                }
                ReferentialAction::Cascade => {
                    for row_key in rows {
                        if self.table(&child)?.contains(&row_key) {
                            debug!(table = %child, key = %row_key, "store cascade delete");
                            self.delete_cascading(&child, &row_key, journal)?;
                        }
                    }
                }
            }
        }

        if let Some(old_row) = self.table_mut(table)?.delete(key) {
            journal.push(Change::DeleteRow {
                table: table.to_string(),
                key: key.clone(),
                old_row,
            });
        }
        Ok(())
    }

    /// Undoes one journaled change.
    pub fn revert(&mut self, change: Change) {
        match change {
            Change::InsertRow { table, key } => {
                if let Some(t) = self.tables.get_mut(&table) {
                    t.delete(&key);
                }
            }
            Change::UpdateRow { table, key, old_row } | Change::DeleteRow { table, key, old_row } => {
                if let Some(t) = self.tables.get_mut(&table) {
                    t.restore(key, old_row);
                }
            }
        }
    }
}

/// In-memory relational store enforcing primary keys, identity columns,
/// NOT NULL, unique and foreign key constraints.
///
/// Transactions are serialized: an executor holds the store lock from
/// `begin` until `commit` or `rollback`.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    state: Arc<Mutex<StoreState>>,
    model: Arc<Model>,
}

impl MemoryStore {
    /// Creates one table per hierarchy root plus one per satellite owned
    /// type, with the constraints the model implies.
    pub fn from_model(model: Arc<Model>) -> StoreResult<Self> {
        let mut schemas: BTreeMap<String, TableSchema> = BTreeMap::new();

        for ty in model.entity_types().filter(|t| t.base().is_none()) {
            let root = ty.name();
            // root first so shared columns keep the root's nullability
            let mut hierarchy: Vec<&EntityType> = model
                .entity_types()
                .filter(|t| t.root() == root)
                .collect();
            hierarchy.sort_by_key(|t| t.base().is_some());
            let key_columns = key_columns(ty)?;
            let mut schema = TableSchema::new(ty.table(), Vec::new(), key_columns.clone());

            for member in &hierarchy {
                let derived = member.base().is_some();
                for property in member.table_properties() {
                    let mut column = ColumnDef::new(property.column_name(), property.data_type());
                    if member.is_key(property.name()) {
                        column = if member.key_generation() == crate::model::KeyGeneration::Store {
                            column.identity()
                        } else {
                            column.not_null()
                        };
                    } else if !property.is_nullable() && !derived {
                        column = column.not_null();
                    }
                    schema.add_column(column);
                }
                for index in member.unique_indexes() {
                    let columns = index
                        .properties
                        .iter()
                        .filter_map(|p| member.property(p).map(|p| p.column_name().to_string()))
                        .collect();
                    if !schema.unique.iter().any(|u| u.name == index.name) {
                        schema.unique.push(UniqueDef {
                            name: index.name.clone(),
                            columns,
                        });
                    }
                }
                for owned in member.owned() {
                    let Some(satellite) = owned.satellite_table() else {
                        continue;
                    };
                    let entry = schemas.entry(satellite.to_string()).or_insert_with(|| {
                        let mut satellite_schema =
                            TableSchema::new(satellite, Vec::new(), key_columns.clone());
                        for pk in &key_columns {
                            let data_type = ty
                                .property_for_column(pk)
                                .map(|p| p.data_type())
                                .unwrap_or(crate::core::DataType::Integer);
                            satellite_schema.add_column(ColumnDef::new(pk, data_type).not_null());
                        }
                        satellite_schema.foreign_keys.push(ForeignKeyDef {
                            name: format!("FK_{}_{}", satellite, ty.table()),
                            columns: key_columns.clone(),
                            references: ty.table().to_string(),
                            on_delete: ReferentialAction::Cascade,
                        });
                        satellite_schema
                    });
                    for name in owned.properties() {
                        if let Some(property) = member.property(name) {
                            let mut column = ColumnDef::new(property.column_name(), property.data_type());
                            if !property.is_nullable() {
                                column = column.not_null();
                            }
                            entry.add_column(column);
                        }
                    }
                }
            }
            schemas.insert(ty.table().to_string(), schema);
        }

        for relationship in model.relationships() {
            let dependent = model
                .entity_type(relationship.dependent())
                .ok_or_else(|| StoreError::TableNotFound(relationship.dependent().to_string()))?;
            let principal = model
                .entity_type(relationship.principal())
                .ok_or_else(|| StoreError::TableNotFound(relationship.principal().to_string()))?;
            let columns = relationship
                .foreign_key()
                .iter()
                .filter_map(|fk| dependent.property(fk).map(|p| p.column_name().to_string()))
                .collect();
            let schema = schemas
                .get_mut(dependent.table())
                .ok_or_else(|| StoreError::TableNotFound(dependent.table().to_string()))?;
            schema.foreign_keys.push(ForeignKeyDef {
                name: relationship.name().to_string(),
                columns,
                references: principal.table().to_string(),
                on_delete: if relationship.store_cascade() {
                    ReferentialAction::Cascade
                } else {
                    ReferentialAction::Restrict
                },
            });
        }

        let mut state = StoreState::default();
        for schema in schemas.into_values() {
            state.create_table(schema);
        }
        Ok(Self {
            state: Arc::new(Mutex::new(state)),
            model,
        })
    }

    pub fn model(&self) -> &Arc<Model> {
        &self.model
    }

    /// A new executor sharing this store.
    pub fn executor(&self) -> MemoryExecutor {
        MemoryExecutor {
            state: Arc::clone(&self.state),
            guard: None,
            journal: Vec::new(),
        }
    }

    /// Inserts a row outside of any unit of work (fixtures, preloading).
    pub async fn seed(&self, table: &str, values: Columns) -> StoreResult<Option<Value>> {
        let mut state = self.state.lock().await;
        let mut journal = Vec::new();
        state.insert(table, &values, &mut journal)
    }

    pub async fn row(&self, table: &str, key: &Key) -> StoreResult<Option<Row>> {
        let state = self.state.lock().await;
        Ok(state.table(table)?.get(key).cloned())
    }

    pub async fn rows(&self, table: &str) -> StoreResult<Vec<Row>> {
        let state = self.state.lock().await;
        Ok(state.table(table)?.rows().map(|(_, row)| row.clone()).collect())
    }

    pub async fn row_count(&self, table: &str) -> StoreResult<usize> {
        let state = self.state.lock().await;
        Ok(state.table(table)?.row_count())
    }

    /// Row of `entity_type` with `key`, keyed by property name and including
    /// owned values from satellite tables; ready for `materialize`.
    pub async fn find(&self, entity_type: &str, key: &Key) -> StoreResult<Option<Row>> {
        let ty = self
            .model
            .entity_type(entity_type)
            .ok_or_else(|| StoreError::TableNotFound(entity_type.to_string()))?;
        let state = self.state.lock().await;
        let Some(row) = state.table(ty.table())?.get(key) else {
            return Ok(None);
        };
        Ok(self.entity_row(&state, ty, key, row))
    }

    /// Every row of `entity_type` (derived types included), keyed by
    /// property name.
    pub async fn query(&self, entity_type: &str) -> StoreResult<Vec<Row>> {
        let ty = self
            .model
            .entity_type(entity_type)
            .ok_or_else(|| StoreError::TableNotFound(entity_type.to_string()))?;
        let state = self.state.lock().await;
        let mut rows = Vec::new();
        for (key, row) in state.table(ty.table())?.rows() {
            if let Some(entity_row) = self.entity_row(&state, ty, key, row) {
                rows.push(entity_row);
            }
        }
        Ok(rows)
    }

    fn entity_row(&self, state: &StoreState, requested: &EntityType, key: &Key, row: &Row) -> Option<Row> {
        let concrete = match requested.discriminator() {
            Some(discriminator) => {
                let column = requested.property(discriminator)?.column_name();
                let value = row.get(column)?;
                let concrete = self.model.resolve_discriminated(requested.root(), value)?;
                if !self.model.is_assignable(concrete.name(), requested.name()) {
                    return None;
                }
                concrete
            }
            None => requested,
        };

        let mut result = Row::new();
        for property in concrete.properties() {
            let value = match concrete.satellite_of(property.name()) {
                Some(owned) => owned
                    .satellite_table()
                    .and_then(|table| state.table(table).ok())
                    .and_then(|table| table.get(key))
                    .and_then(|satellite| satellite.get(property.column_name()).cloned()),
                None => row.get(property.column_name()).cloned(),
            };
            result.insert(property.name().to_string(), value.unwrap_or(Value::Null));
        }
        Some(result)
    }
}

fn key_columns(ty: &EntityType) -> StoreResult<Vec<String>> {
    ty.key()
        .iter()
        .map(|k| {
            ty.property(k)
                .map(|p| p.column_name().to_string())
                .ok_or_else(|| StoreError::UnknownColumn {
                    table: ty.table().to_string(),
                    column: k.clone(),
                })
        })
        .collect()
}

/// Executor over a `MemoryStore`.
#[derive(Debug)]
pub struct MemoryExecutor {
    state: Arc<Mutex<StoreState>>,
    guard: Option<OwnedMutexGuard<StoreState>>,
    journal: Vec<Change>,
}

impl MemoryExecutor {
    fn active(&mut self) -> StoreResult<(&mut StoreState, &mut Vec<Change>)> {
        match self.guard.as_deref_mut() {
            Some(state) => Ok((state, &mut self.journal)),
            None => Err(StoreError::Transaction("no active transaction".into())),
        }
    }

    pub fn in_transaction(&self) -> bool {
        self.guard.is_some()
    }
}

#[async_trait]
impl CommandExecutor for MemoryExecutor {
    async fn begin(&mut self) -> StoreResult<()> {
        if self.guard.is_some() {
            return Err(StoreError::Transaction("transaction already active".into()));
        }
        self.guard = Some(Arc::clone(&self.state).lock_owned().await);
        self.journal.clear();
        Ok(())
    }

    async fn execute_insert(&mut self, table: &str, values: &Columns) -> StoreResult<Option<Value>> {
        let (state, journal) = self.active()?;
        state.insert(table, values, journal)
    }

    async fn execute_update(&mut self, table: &str, key: &Columns, changed: &Columns) -> StoreResult<u64> {
        let (state, journal) = self.active()?;
        state.update(table, key, changed, journal)
    }

    async fn execute_delete(&mut self, table: &str, key: &Columns) -> StoreResult<u64> {
        let (state, journal) = self.active()?;
        state.delete(table, key, journal)
    }

    async fn commit(&mut self) -> StoreResult<()> {
        if self.guard.take().is_none() {
            return Err(StoreError::Transaction("no active transaction".into()));
        }
        self.journal.clear();
        Ok(())
    }

    async fn rollback(&mut self) -> StoreResult<()> {
        let Some(mut state) = self.guard.take() else {
            return Err(StoreError::Transaction("no active transaction".into()));
        };
        let journal = std::mem::take(&mut self.journal);
        debug!(changes = journal.len(), "rolling back store transaction");
        for change in journal.into_iter().rev() {
            state.revert(change);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::DataType;
    use crate::model::{EntityTypeBuilder, ModelBuilder, Property, RelationshipBuilder};

    fn model() -> Arc<Model> {
        Arc::new(
            ModelBuilder::new()
                .entity(
                    EntityTypeBuilder::new("Player")
                        .generated_key("PlayerId")
                        .property(Property::new("Name", DataType::Text).not_null()),
                )
                .entity(
                    EntityTypeBuilder::new("Item")
                        .generated_key("ItemId")
                        .property(Property::new("OwnerId", DataType::Integer).not_null()),
                )
                .relationship(
                    RelationshipBuilder::one_to_many("Player", "Item")
                        .foreign_key(&["OwnerId"])
                        .required(),
                )
                .build()
                .unwrap(),
        )
    }

    fn columns(pairs: &[(&str, Value)]) -> Columns {
        pairs
            .iter()
            .map(|(name, value)| (name.to_string(), value.clone()))
            .collect()
    }

    #[tokio::test]
    async fn test_rollback_restores_rows() {
        let store = MemoryStore::from_model(model()).unwrap();
        store
            .seed("Player", columns(&[("Name", "Rookiss".into())]))
            .await
            .unwrap();

        let mut executor = store.executor();
        executor.begin().await.unwrap();
        let generated = executor
            .execute_insert("Player", &columns(&[("Name", "Faker".into())]))
            .await
            .unwrap();
        assert_eq!(generated, Some(Value::Integer(2)));
        let affected = executor
            .execute_update(
                "Player",
                &columns(&[("PlayerId", Value::Integer(1))]),
                &columns(&[("Name", "Renamed".into())]),
            )
            .await
            .unwrap();
        assert_eq!(affected, 1);
        executor.rollback().await.unwrap();

        assert_eq!(store.row_count("Player").await.unwrap(), 1);
        let row = store.row("Player", &Key::single(1)).await.unwrap().unwrap();
        assert_eq!(row.get("Name"), Some(&Value::Text("Rookiss".into())));
    }

    #[tokio::test]
    async fn test_foreign_keys_enforced() {
        let store = MemoryStore::from_model(model()).unwrap();
        let mut executor = store.executor();
        executor.begin().await.unwrap();

        let err = executor
            .execute_insert("Item", &columns(&[("OwnerId", Value::Integer(7))]))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::ForeignKeyViolation { .. }));

        executor
            .execute_insert("Player", &columns(&[("Name", "Rookiss".into())]))
            .await
            .unwrap();
        executor
            .execute_insert("Item", &columns(&[("OwnerId", Value::Integer(1))]))
            .await
            .unwrap();
        let err = executor
            .execute_delete("Player", &columns(&[("PlayerId", Value::Integer(1))]))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::ForeignKeyViolation { .. }));
        executor.commit().await.unwrap();

        assert_eq!(store.row_count("Item").await.unwrap(), 1);
        assert_eq!(store.row_count("Player").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_requires_transaction() {
        let store = MemoryStore::from_model(model()).unwrap();
        let mut executor = store.executor();
        let err = executor
            .execute_delete("Player", &columns(&[("PlayerId", Value::Integer(1))]))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Transaction(_)));
        assert!(!executor.in_transaction());
    }
}
