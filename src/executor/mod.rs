// ============================================================================
// Command Executors
// ============================================================================
//
// The persistence orchestrator never talks to a database directly: it hands
// one insert/update/delete command at a time to a `CommandExecutor` inside a
// transaction it opened. `MemoryStore` is the bundled relational store used
// for embedding and tests.
//
// ============================================================================

pub mod change;
pub mod memory;
pub mod table;

pub use change::Change;
pub use memory::{MemoryExecutor, MemoryStore, StoreState};
pub use table::{ColumnDef, ForeignKeyDef, ReferentialAction, Table, TableSchema, UniqueDef};

use crate::core::{Columns, StoreResult, Value};
use async_trait::async_trait;

#[async_trait]
pub trait CommandExecutor: Send {
    async fn begin(&mut self) -> StoreResult<()>;

    /// Inserts one row; returns the store-generated key value, if any.
    async fn execute_insert(&mut self, table: &str, values: &Columns) -> StoreResult<Option<Value>>;

    /// Returns the number of rows affected.
    async fn execute_update(&mut self, table: &str, key: &Columns, changed: &Columns) -> StoreResult<u64>;

    /// Returns the number of rows affected.
    async fn execute_delete(&mut self, table: &str, key: &Columns) -> StoreResult<u64>;

    async fn commit(&mut self) -> StoreResult<()>;

    async fn rollback(&mut self) -> StoreResult<()>;
}
