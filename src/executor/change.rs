// ============================================================================
// Store Change Journal
// ============================================================================
//
// Command Pattern for reversible row operations. Every write performed by a
// `MemoryExecutor` inside a transaction is recorded as a `Change`; rollback
// reverts the journal newest-first.
//
// ============================================================================

use crate::core::{Key, Row};

/// A single reversible change recorded during a transaction
#[derive(Debug, Clone)]
pub enum Change {
    /// A row was inserted
    InsertRow { table: String, key: Key },

    /// A row was updated in place
    UpdateRow {
        table: String,
        key: Key,
        old_row: Row,
    },

    /// A row was deleted (directly or by an ON DELETE CASCADE)
    DeleteRow {
        table: String,
        key: Key,
        old_row: Row,
    },
}

impl Change {
    /// Get the table name affected by this change
    pub fn table_name(&self) -> &str {
        match self {
            Change::InsertRow { table, .. } => table,
            Change::UpdateRow { table, .. } => table,
            Change::DeleteRow { table, .. } => table,
        }
    }

    pub fn key(&self) -> &Key {
        match self {
            Change::InsertRow { key, .. }
            | Change::UpdateRow { key, .. }
            | Change::DeleteRow { key, .. } => key,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Value;

    #[test]
    fn test_change_table_name() {
        let change = Change::InsertRow {
            table: "Player".to_string(),
            key: Key::single(1),
        };
        assert_eq!(change.table_name(), "Player");
        assert_eq!(change.key(), &Key::single(1));

        let mut old_row = Row::new();
        old_row.insert("Name".into(), Value::Text("Rookiss".into()));
        let delete = Change::DeleteRow {
            table: "Player".to_string(),
            key: Key::single(1),
            old_row,
        };
        assert_eq!(delete.table_name(), "Player");
    }
}
