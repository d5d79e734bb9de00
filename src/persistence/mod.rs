// ============================================================================
// Persistence
// ============================================================================
//
// Save pipeline:
//
//   interceptors → pending cascades → change detection
//        → Planner   (validation, insert/delete ordering, commands)
//        → execute   (one executor transaction, keys resolved per command)
//        → accept    (values written back, entries settled)
//
// ============================================================================

pub mod command;
pub mod orchestrator;
pub mod planner;

pub use command::{ColumnSlot, CommandKind, ExecutedCommand, PlannedCommand, SaveReport, Slot};
pub use orchestrator::save_changes;
pub use planner::{Planner, SavePlan};
