use super::command::{ColumnSlot, CommandKind, ExecutedCommand, PlannedCommand, SaveReport, Slot};
use super::planner::{Planner, SavePlan};
use crate::core::{Columns, EntityId, Key, Result, StoreError, TrackError, Value};
use crate::executor::CommandExecutor;
use crate::hooks::SaveInterceptor;
use crate::tracking::{ChangeTracker, EntityState};
use std::collections::HashMap;
use tracing::{Instrument, debug, info, info_span, warn};

/// Values produced while a save runs: generated keys, defaults and resolved
/// foreign keys, by (entity, property).
type Resolved = HashMap<(EntityId, String), Value>;

/// Persists every pending change of `tracker` through `executor` in one
/// transaction.
///
/// On failure the transaction is rolled back and no entry changes state; on
/// success written values are copied back, Added and Modified entries become
/// Unchanged and Deleted entries are forgotten.
pub async fn save_changes<E>(
    tracker: &mut ChangeTracker,
    executor: &mut E,
    interceptors: &[Box<dyn SaveInterceptor>],
) -> Result<SaveReport>
where
    E: CommandExecutor + ?Sized,
{
    let span = info_span!("save", entries = tracker.entries().count());
    async move {
        for interceptor in interceptors {
            interceptor.saving_changes(tracker)?;
        }
        let checkpoint = tracker.checkpoint();
        let (plan, resolved, report) = match prepare_and_execute(tracker, executor).await {
            Ok(Some(outcome)) => outcome,
            Ok(None) => {
                debug!("nothing to save");
                clear_overrides(tracker);
                return Ok(SaveReport::default());
            }
            Err(err) => {
                if let Some(checkpoint) = checkpoint {
                    tracker.restore(checkpoint);
                }
                return Err(err);
            }
        };

        accept(tracker, &plan, resolved)?;
        info!(
            inserted = report.inserted,
            updated = report.updated,
            deleted = report.deleted,
            "save completed"
        );
        for interceptor in interceptors {
            interceptor.saved_changes(&report);
        }
        Ok(report)
    }
    .instrument(span)
    .await
}

/// Everything a save does before its results are accepted: deferred
/// cascades, detection, planning and the transaction itself. `None` when
/// there is nothing to write.
async fn prepare_and_execute<E>(
    tracker: &mut ChangeTracker,
    executor: &mut E,
) -> Result<Option<(SavePlan, Resolved, SaveReport)>>
where
    E: CommandExecutor + ?Sized,
{
    tracker.apply_pending_cascades()?;
    if tracker.config().auto_detect_changes {
        tracker.detect_changes()?;
    }

    let plan = Planner::new(tracker).plan()?;
    if plan.is_empty() {
        return Ok(None);
    }

    let mut resolved = Resolved::new();
    let report = if plan.commands.is_empty() {
        SaveReport::default()
    } else {
        execute(tracker, executor, &plan, &mut resolved).await?
    };
    Ok(Some((plan, resolved, report)))
}

async fn execute<E>(
    tracker: &ChangeTracker,
    executor: &mut E,
    plan: &SavePlan,
    resolved: &mut Resolved,
) -> Result<SaveReport>
where
    E: CommandExecutor + ?Sized,
{
    executor.begin().await.map_err(TrackError::Transaction)?;

    let mut report = SaveReport::default();
    for command in &plan.commands {
        match run(tracker, executor, command, resolved).await {
            Ok(executed) => report.record(executed),
            Err(err) => {
                warn!(error = %err, "save failed, rolling back");
                if let Err(rollback) = executor.rollback().await {
                    warn!(error = %rollback, "rollback failed");
                }
                return Err(err);
            }
        }
    }

    if let Err(err) = executor.commit().await {
        warn!(error = %err, "commit failed, rolling back");
        if let Err(rollback) = executor.rollback().await {
            warn!(error = %rollback, "rollback failed");
        }
        return Err(TrackError::Transaction(err));
    }
    Ok(report)
}

fn resolve(tracker: &ChangeTracker, resolved: &Resolved, slot: &Slot) -> Result<Value> {
    match slot {
        Slot::Value(value) => Ok(value.clone()),
        Slot::KeyOf { entity, property } => match resolved.get(&(*entity, property.clone())) {
            Some(value) => Ok(value.clone()),
            None => tracker.value(*entity, property),
        },
    }
}

fn resolve_columns(
    tracker: &ChangeTracker,
    resolved: &Resolved,
    slots: &[ColumnSlot],
) -> Result<Columns> {
    slots
        .iter()
        .map(|c| Ok((c.column.clone(), resolve(tracker, resolved, &c.slot)?)))
        .collect()
}

async fn run<E>(
    tracker: &ChangeTracker,
    executor: &mut E,
    command: &PlannedCommand,
    resolved: &mut Resolved,
) -> Result<ExecutedCommand>
where
    E: CommandExecutor + ?Sized,
{
    let values = resolve_columns(tracker, resolved, &command.values)?;
    let persistence = |source: StoreError| TrackError::Persistence {
        entity_type: command.entity_type.clone(),
        entity: command.entity,
        source,
    };

    if tracker.config().sensitive_data_logging {
        debug!(kind = %command.kind, table = %command.table, entity = %command.entity, values = ?values, "executing command");
    } else {
        debug!(kind = %command.kind, table = %command.table, entity = %command.entity, "executing command");
    }

    match command.kind {
        CommandKind::Insert => {
            let generated = executor
                .execute_insert(&command.table, &values)
                .await
                .map_err(persistence)?;
            if let (Some(property), Some(value)) = (&command.generated_key, generated) {
                resolved.insert((command.entity, property.clone()), value);
            }
        }
        CommandKind::Update => {
            let key = resolve_columns(tracker, resolved, &command.key)?;
            let affected = executor
                .execute_update(&command.table, &key, &values)
                .await
                .map_err(persistence)?;
            if affected == 0 {
                return Err(persistence(row_not_found(command, &key)));
            }
        }
        CommandKind::Delete => {
            let key = resolve_columns(tracker, resolved, &command.key)?;
            let affected = executor
                .execute_delete(&command.table, &key)
                .await
                .map_err(|err| match err {
                    StoreError::ForeignKeyViolation { table, constraint } => {
                        TrackError::RequiredRelationshipViolation {
                            relationship: constraint,
                            entity_type: command.entity_type.clone(),
                            entity: command.entity,
                            reason: format!("rows in '{table}' still reference it"),
                        }
                    }
                    other => persistence(other),
                })?;
            if affected == 0 {
                return Err(persistence(row_not_found(command, &key)));
            }
        }
    }

    for (slot, (_, value)) in command.values.iter().zip(&values) {
        if let Some(property) = &slot.property {
            resolved.insert((command.entity, property.clone()), value.clone());
        }
    }

    let key = Key::new(
        resolve_columns(tracker, resolved, &command.key)?
            .into_iter()
            .map(|(_, value)| value)
            .collect(),
    );
    let columns = match command.kind {
        CommandKind::Delete => command.key.iter().map(|c| c.column.clone()).collect(),
        _ => command.values.iter().map(|c| c.column.clone()).collect(),
    };
    Ok(ExecutedCommand {
        kind: command.kind,
        table: command.table.clone(),
        entity: command.entity,
        entity_type: command.entity_type.clone(),
        key,
        columns,
    })
}

fn row_not_found(command: &PlannedCommand, key: &Columns) -> StoreError {
    StoreError::RowNotFound {
        table: command.table.clone(),
        key: Key::new(key.iter().map(|(_, value)| value.clone()).collect()),
    }
}

/// Applies a committed plan to the tracker.
fn accept(tracker: &mut ChangeTracker, plan: &SavePlan, resolved: Resolved) -> Result<()> {
    for ((entity, property), value) in resolved {
        if tracker.identity.contains(entity) {
            tracker.write_raw(entity, &property, value)?;
        }
    }

    for &id in &plan.accepted {
        let current = tracker.current_values(id)?;
        if let Some(entry) = tracker.identity.get_mut(id) {
            entry.accept(current);
        }
        tracker.index_key(id)?;
    }

    for &id in &plan.removed {
        let root = tracker.type_of(id)?.root().to_string();
        if let Some(entry) = tracker.identity.forget(id, &root)
            && let Some(data) = tracker.arena.get_mut(id)
        {
            data.detached_shadow = entry.shadow;
        }
        tracker.arena.unlink_everywhere(id);
        debug!(entity = %id, "deleted entity detached");
    }

    clear_overrides(tracker);
    Ok(())
}

fn clear_overrides(tracker: &mut ChangeTracker) {
    for id in tracker.identity.ids() {
        if let Some(entry) = tracker.identity.get_mut(id)
            && entry.state == EntityState::Unchanged
        {
            entry.overridden = false;
        }
    }
}
