pub mod error;
pub mod types;
pub mod value;

pub use error::{ModelError, Result, StoreError, StoreResult, TrackError};
pub use types::{Columns, EntityId, EntryHandle, Row, column_value};
pub use value::{DataType, Key, Value};
