use super::{ChangeTracker, EntityState};
use crate::core::{EntityId, Result, TrackError, Value};
use std::sync::Arc;
use tracing::debug;

impl ChangeTracker {
    /// Properties whose current value differs from the snapshot.
    pub(crate) fn diff(&self, id: EntityId) -> Result<Vec<String>> {
        let Some(original) = self.entry(id).and_then(|entry| entry.original.as_ref()) else {
            return Ok(Vec::new());
        };
        let current = self.current_values(id)?;
        let ty = self.type_of(id)?;
        Ok(ty
            .properties()
            .iter()
            .map(|p| p.name())
            .filter(|name| {
                let now = current.get(*name).unwrap_or(&Value::Null);
                let before = original.get(*name).unwrap_or(&Value::Null);
                now != before
            })
            .map(str::to_string)
            .collect())
    }

    /// Scans Unchanged and Modified entries that were not forced into their
    /// state and flags every property that no longer matches the snapshot.
    ///
    /// Cost is O(tracked entries × properties per entity); it runs at the
    /// start of every save while `auto_detect_changes` is on, so it bounds
    /// save latency for large units of work.
    ///
    /// Added entries are only re-indexed when their key became known.
    pub fn detect_changes(&mut self) -> Result<()> {
        let model = Arc::clone(&self.model);
        for id in self.identity.ids() {
            let Some(entry) = self.identity.get(id) else {
                continue;
            };
            match entry.state {
                EntityState::Added => {
                    self.index_key(id)?;
                    continue;
                }
                EntityState::Unchanged | EntityState::Modified if !entry.overridden => {}
                _ => continue,
            }

            let changed = self.diff(id)?;
            if changed.is_empty() {
                continue;
            }
            let ty = model.require_type(&entry.entity_type)?;
            if let Some(key) = changed.iter().find(|p| ty.is_key(p)) {
                return Err(TrackError::KeyModification {
                    entity_type: ty.name().to_string(),
                    property: key.clone(),
                });
            }
            if let Some(entry) = self.identity.get_mut(id) {
                debug!(entity = %id, properties = ?changed, "changes detected");
                entry.modified.extend(changed.iter().cloned());
                entry.state = EntityState::Modified;
            }
            for &index in model.relationships_as_dependent(ty.name()) {
                let relationship = model.relationship(index);
                if relationship
                    .foreign_key()
                    .iter()
                    .any(|fk| changed.contains(fk))
                {
                    self.fixup_from_foreign_key(id, index)?;
                }
            }
        }
        Ok(())
    }

    /// Whether a save would issue any command, without touching state.
    pub fn has_changes(&self) -> bool {
        if !self.pending_cascades.is_empty() {
            return true;
        }
        self.identity.iter().any(|entry| match entry.state {
            EntityState::Added | EntityState::Deleted => true,
            EntityState::Modified => true,
            EntityState::Unchanged if !entry.overridden => self
                .diff(entry.entity)
                .map(|changed| !changed.is_empty())
                .unwrap_or(false),
            _ => false,
        })
    }
}
