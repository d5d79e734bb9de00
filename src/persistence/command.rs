use crate::core::{EntityId, Key, Value};
use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    Insert,
    Update,
    Delete,
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandKind::Insert => write!(f, "INSERT"),
            CommandKind::Update => write!(f, "UPDATE"),
            CommandKind::Delete => write!(f, "DELETE"),
        }
    }
}

/// Where a column value comes from when the command runs.
#[derive(Debug, Clone, PartialEq)]
pub enum Slot {
    Value(Value),
    /// Key property of another entity, known only once that entity's insert
    /// has run (store-generated keys).
    KeyOf { entity: EntityId, property: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnSlot {
    /// Property written back to the entity after a successful save.
    pub property: Option<String>,
    pub column: String,
    pub slot: Slot,
}

impl ColumnSlot {
    pub fn value(property: Option<&str>, column: &str, value: Value) -> Self {
        Self {
            property: property.map(str::to_string),
            column: column.to_string(),
            slot: Slot::Value(value),
        }
    }

    pub fn key_of(property: Option<&str>, column: &str, entity: EntityId, key_property: &str) -> Self {
        Self {
            property: property.map(str::to_string),
            column: column.to_string(),
            slot: Slot::KeyOf {
                entity,
                property: key_property.to_string(),
            },
        }
    }
}

/// One store command, values still unresolved.
#[derive(Debug, Clone)]
pub struct PlannedCommand {
    pub entity: EntityId,
    pub entity_type: String,
    pub table: String,
    pub kind: CommandKind,
    pub key: Vec<ColumnSlot>,
    pub values: Vec<ColumnSlot>,
    /// Key property assigned by the store on insert.
    pub generated_key: Option<String>,
}

/// A command as it was executed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutedCommand {
    pub kind: CommandKind,
    pub table: String,
    pub entity: EntityId,
    pub entity_type: String,
    pub key: Key,
    /// Columns written (insert/update) or matched (delete).
    pub columns: Vec<String>,
}

/// Outcome of a successful save.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SaveReport {
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
    /// Commands in execution order.
    pub commands: Vec<ExecutedCommand>,
}

impl SaveReport {
    pub fn total(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Executed commands of one kind against `table`.
    pub fn commands_for(&self, kind: CommandKind, table: &str) -> Vec<&ExecutedCommand> {
        self.commands
            .iter()
            .filter(|c| c.kind == kind && c.table == table)
            .collect()
    }

    pub(crate) fn record(&mut self, command: ExecutedCommand) {
        match command.kind {
            CommandKind::Insert => self.inserted += 1,
            CommandKind::Update => self.updated += 1,
            CommandKind::Delete => self.deleted += 1,
        }
        self.commands.push(command);
    }
}
