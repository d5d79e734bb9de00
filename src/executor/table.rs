use crate::core::{Columns, DataType, Key, Row, StoreError, StoreResult, Value};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnDef {
    pub name: String,
    pub data_type: DataType,
    pub nullable: bool,
    /// Value assigned by the table on insert when none is supplied
    pub identity: bool,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            nullable: true,
            identity: false,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn identity(mut self) -> Self {
        self.identity = true;
        self.nullable = false;
        self
    }

    fn validate(&self, table: &str, value: &Value) -> StoreResult<()> {
        if value.is_null() {
            if !self.nullable {
                return Err(StoreError::NotNullViolation {
                    table: table.to_string(),
                    column: self.name.clone(),
                });
            }
            return Ok(());
        }
        if !self.data_type.is_compatible(value) {
            return Err(StoreError::TypeMismatch {
                table: table.to_string(),
                column: self.name.clone(),
                expected: self.data_type,
                actual: value.type_name(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferentialAction {
    Restrict,
    Cascade,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ForeignKeyDef {
    pub name: String,
    pub columns: Vec<String>,
    /// Referenced table; the referenced columns are its primary key
    pub references: String,
    pub on_delete: ReferentialAction,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UniqueDef {
    pub name: String,
    pub columns: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TableSchema {
    name: String,
    columns: Vec<ColumnDef>,
    primary_key: Vec<String>,
    pub unique: Vec<UniqueDef>,
    pub foreign_keys: Vec<ForeignKeyDef>,
}

impl TableSchema {
    pub fn new(name: impl Into<String>, columns: Vec<ColumnDef>, primary_key: Vec<String>) -> Self {
        Self {
            name: name.into(),
            columns,
            primary_key,
            unique: Vec::new(),
            foreign_keys: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn columns(&self) -> &[ColumnDef] {
        &self.columns
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn primary_key(&self) -> &[String] {
        &self.primary_key
    }

    /// Adds a column unless one with the same name exists.
    pub(crate) fn add_column(&mut self, column: ColumnDef) {
        if self.column(&column.name).is_none() {
            self.columns.push(column);
        }
    }
}

/// Rows of one table keyed by primary key.
#[derive(Debug, Clone)]
pub struct Table {
    schema: TableSchema,
    rows: BTreeMap<Key, Row>,
    next_identity: i64,
}

impl Table {
    pub fn new(schema: TableSchema) -> Self {
        Self {
            schema,
            rows: BTreeMap::new(),
            next_identity: 1,
        }
    }

    pub fn schema(&self) -> &TableSchema {
        &self.schema
    }

    pub fn name(&self) -> &str {
        &self.schema.name
    }

    /// Primary key made of the given columns, in primary-key order.
    pub fn key_from(&self, columns: &[(String, Value)]) -> StoreResult<Key> {
        let mut parts = Vec::with_capacity(self.schema.primary_key.len());
        for pk in &self.schema.primary_key {
            let value = columns
                .iter()
                .find(|(name, _)| name == pk)
                .map(|(_, value)| value.clone())
                .ok_or_else(|| StoreError::UnknownColumn {
                    table: self.schema.name.clone(),
                    column: pk.clone(),
                })?;
            parts.push(value);
        }
        Ok(Key::new(parts))
    }

    pub fn key_of_row(&self, row: &Row) -> Key {
        Key::new(
            self.schema
                .primary_key
                .iter()
                .map(|pk| row.get(pk).cloned().unwrap_or(Value::Null))
                .collect(),
        )
    }

    fn check_columns(&self, values: &[(String, Value)]) -> StoreResult<()> {
        for (name, _) in values {
            if self.schema.column(name).is_none() {
                return Err(StoreError::UnknownColumn {
                    table: self.schema.name.clone(),
                    column: name.clone(),
                });
            }
        }
        Ok(())
    }

    fn validate_row(&self, row: &Row) -> StoreResult<()> {
        for column in &self.schema.columns {
            let value = row.get(&column.name).unwrap_or(&Value::Null);
            column.validate(&self.schema.name, value)?;
        }
        Ok(())
    }

    fn check_uniqueness(&self, row: &Row, ignore: Option<&Key>) -> StoreResult<()> {
        for unique in &self.schema.unique {
            let values: Vec<Value> = unique
                .columns
                .iter()
                .map(|c| row.get(c).cloned().unwrap_or(Value::Null))
                .collect();
            // NULLs never collide
            if values.iter().any(Value::is_null) {
                continue;
            }
            let clash = self.rows.iter().any(|(key, existing)| {
                Some(key) != ignore
                    && unique
                        .columns
                        .iter()
                        .zip(&values)
                        .all(|(c, v)| existing.get(c) == Some(v))
            });
            if clash {
                return Err(StoreError::UniqueViolation {
                    table: self.schema.name.clone(),
                    constraint: unique.name.clone(),
                    key: Key::new(values),
                });
            }
        }
        Ok(())
    }

    /// Inserts a row; returns its key and the identity value assigned, if
    /// any.
    pub fn insert(&mut self, values: &Columns) -> StoreResult<(Key, Option<Value>)> {
        self.check_columns(values)?;
        let mut row = Row::new();
        let mut generated = None;
        for column in &self.schema.columns {
            let supplied = values
                .iter()
                .find(|(name, _)| name == &column.name)
                .map(|(_, v)| v.clone())
                .unwrap_or(Value::Null);
            let value = if column.identity && supplied.is_default() {
                let value = Value::Integer(self.next_identity);
                self.next_identity += 1;
                generated = Some(value.clone());
                value
            } else {
                if column.identity
                    && let Some(explicit) = supplied.as_i64()
                {
                    self.next_identity = self.next_identity.max(explicit + 1);
                }
                supplied
            };
            row.insert(column.name.clone(), value);
        }
        self.validate_row(&row)?;

        let key = self.key_of_row(&row);
        if self.rows.contains_key(&key) {
            return Err(StoreError::UniqueViolation {
                table: self.schema.name.clone(),
                constraint: format!("PK_{}", self.schema.name),
                key,
            });
        }
        self.check_uniqueness(&row, None)?;
        self.rows.insert(key.clone(), row);
        Ok((key, generated))
    }

    /// Applies `changed` to the row with `key`; returns the previous row, or
    /// `None` when no such row exists.
    pub fn update(&mut self, key: &Key, changed: &Columns) -> StoreResult<Option<Row>> {
        self.check_columns(changed)?;
        let Some(old_row) = self.rows.get(key).cloned() else {
            return Ok(None);
        };
        let mut new_row = old_row.clone();
        for (name, value) in changed {
            new_row.insert(name.clone(), value.clone());
        }
        self.validate_row(&new_row)?;
        if &self.key_of_row(&new_row) != key {
            return Err(StoreError::UniqueViolation {
                table: self.schema.name.clone(),
                constraint: format!("PK_{}", self.schema.name),
                key: self.key_of_row(&new_row),
            });
        }
        self.check_uniqueness(&new_row, Some(key))?;
        self.rows.insert(key.clone(), new_row);
        Ok(Some(old_row))
    }

    pub fn delete(&mut self, key: &Key) -> Option<Row> {
        self.rows.remove(key)
    }

    /// Puts a row back verbatim (rollback).
    pub(crate) fn restore(&mut self, key: Key, row: Row) {
        self.rows.insert(key, row);
    }

    pub fn get(&self, key: &Key) -> Option<&Row> {
        self.rows.get(key)
    }

    pub fn contains(&self, key: &Key) -> bool {
        self.rows.contains_key(key)
    }

    pub fn rows(&self) -> impl Iterator<Item = (&Key, &Row)> + '_ {
        self.rows.iter()
    }

    /// Keys of rows whose `columns` equal `values`.
    pub fn find_by(&self, columns: &[String], values: &[Value]) -> Vec<Key> {
        self.rows
            .iter()
            .filter(|(_, row)| {
                columns
                    .iter()
                    .zip(values)
                    .all(|(c, v)| row.get(c) == Some(v))
            })
            .map(|(key, _)| key.clone())
            .collect()
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn players() -> Table {
        let mut schema = TableSchema::new(
            "Player",
            vec![
                ColumnDef::new("PlayerId", DataType::Integer).identity(),
                ColumnDef::new("Name", DataType::Text).not_null(),
            ],
            vec!["PlayerId".into()],
        );
        schema.unique.push(UniqueDef {
            name: "UQ_Player_Name".into(),
            columns: vec!["Name".into()],
        });
        Table::new(schema)
    }

    fn name(value: &str) -> Columns {
        vec![("Name".to_string(), Value::Text(value.to_string()))]
    }

    #[test]
    fn test_identity_assignment() {
        let mut table = players();
        let (key, generated) = table.insert(&name("Rookiss")).unwrap();
        assert_eq!(generated, Some(Value::Integer(1)));
        assert_eq!(key, Key::single(1));

        let (_, generated) = table.insert(&name("Faker")).unwrap();
        assert_eq!(generated, Some(Value::Integer(2)));
        assert_eq!(table.row_count(), 2);
    }

    #[test]
    fn test_constraints() {
        let mut table = players();
        table.insert(&name("Rookiss")).unwrap();

        let err = table.insert(&name("Rookiss")).unwrap_err();
        assert!(matches!(err, StoreError::UniqueViolation { .. }));

        let err = table.insert(&vec![]).unwrap_err();
        assert!(matches!(err, StoreError::NotNullViolation { .. }));

        let err = table
            .insert(&vec![("Name".to_string(), Value::Integer(3))])
            .unwrap_err();
        assert!(matches!(err, StoreError::TypeMismatch { .. }));

        let err = table
            .insert(&vec![("Level".to_string(), Value::Integer(3))])
            .unwrap_err();
        assert!(matches!(err, StoreError::UnknownColumn { .. }));
    }

    #[test]
    fn test_update_and_delete() {
        let mut table = players();
        let (key, _) = table.insert(&name("Rookiss")).unwrap();

        let old = table.update(&key, &name("Faker")).unwrap().unwrap();
        assert_eq!(old.get("Name"), Some(&Value::Text("Rookiss".into())));
        assert_eq!(
            table.get(&key).unwrap().get("Name"),
            Some(&Value::Text("Faker".into()))
        );
        assert!(table.update(&Key::single(99), &name("x")).unwrap().is_none());

        assert!(table.delete(&key).is_some());
        assert!(table.delete(&key).is_none());
    }
}
