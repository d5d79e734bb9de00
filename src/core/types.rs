use super::Value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Property name → value. Used for entity scalars, snapshots and store rows.
pub type Row = BTreeMap<String, Value>;

/// Ordered column/value pairs handed to a command executor.
pub type Columns = Vec<(String, Value)>;

/// Handle to an entity instance held in a context's arena.
///
/// Handles are the transient identity of an entity before (and after) its
/// key is known; navigations store handles instead of owning pointers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityId(pub u64);

impl EntityId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Handle returned by tracking operations; the same value as the entity's id.
pub type EntryHandle = EntityId;

pub fn column_value<'a>(columns: &'a [(String, Value)], name: &str) -> Option<&'a Value> {
    columns
        .iter()
        .find(|(column, _)| column == name)
        .map(|(_, value)| value)
}
