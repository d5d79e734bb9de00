use crate::core::{Result, Value};
use crate::persistence::SaveReport;
use crate::tracking::{ChangeTracker, EntityState};

/// Callbacks around a save.
///
/// `saving_changes` runs before change detection, so values it writes
/// through the tracker are persisted by the same save. An error aborts the
/// save before any command is issued.
pub trait SaveInterceptor: Send + Sync {
    fn saving_changes(&self, tracker: &mut ChangeTracker) -> Result<()>;

    fn saved_changes(&self, _report: &SaveReport) {}
}

/// Stamps the current time into a timestamp property of every Added entity
/// that declares it and has no value yet.
#[derive(Debug, Clone)]
pub struct CreatedAtInterceptor {
    property: String,
}

impl CreatedAtInterceptor {
    pub fn new(property: impl Into<String>) -> Self {
        Self {
            property: property.into(),
        }
    }
}

impl Default for CreatedAtInterceptor {
    fn default() -> Self {
        Self::new("CreateDate")
    }
}

impl SaveInterceptor for CreatedAtInterceptor {
    fn saving_changes(&self, tracker: &mut ChangeTracker) -> Result<()> {
        let added: Vec<_> = tracker
            .entries()
            .filter(|entry| entry.state() == EntityState::Added)
            .filter(|entry| {
                tracker
                    .model()
                    .entity_type(entry.entity_type())
                    .is_some_and(|ty| ty.property(&self.property).is_some())
            })
            .map(|entry| entry.entity())
            .collect();

        let now = chrono::Utc::now();
        for id in added {
            if tracker.value(id, &self.property)?.is_null() {
                tracker.set_value(id, &self.property, Value::Timestamp(now))?;
            }
        }
        Ok(())
    }
}
