// ============================================================================
// Entity State Machine
// ============================================================================
//
// Lifecycle of a tracked entity:
//
// ```text
//            add / attach(no key)          save
// Detached ───────────────────────> Added ──────> Unchanged
//    │                                │ remove        │  ▲
//    │ attach(key)                    ▼               │  │ save
//    └──────────────────────────> Detached   mutate   ▼  │
//                                            ───> Modified
//                Unchanged / Modified ──remove──> Deleted ──save──> Detached
// ```
//
// The table in `EntityState::apply` is the single authority on which
// operations are legal from which state.
//
// ============================================================================

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityState {
    /// Not tracked; no entry exists
    Detached,
    /// Tracked and in sync with the store
    Unchanged,
    /// New; will be inserted
    Added,
    /// Persisted with pending property changes; will be updated
    Modified,
    /// Persisted and scheduled for deletion
    Deleted,
}

impl EntityState {
    /// The entity has a row in the store (as far as the tracker knows).
    pub fn is_persisted(&self) -> bool {
        matches!(
            self,
            EntityState::Unchanged | EntityState::Modified | EntityState::Deleted
        )
    }

    /// Entries in this state produce a command on save.
    pub fn is_pending(&self) -> bool {
        matches!(
            self,
            EntityState::Added | EntityState::Modified | EntityState::Deleted
        )
    }

    /// Next state after `transition`, or `None` when it is not allowed.
    pub fn apply(self, transition: Transition) -> Option<EntityState> {
        use EntityState::*;
        use Transition::*;

        match (self, transition) {
            (Detached, Add) => Some(Added),
            (Detached, Attach { key_set }) => Some(if key_set { Unchanged } else { Added }),
            (Detached, Update { key_set }) => Some(if key_set { Modified } else { Added }),
            (Detached, Mutate) => Some(Detached),
            (Detached, Remove) => None,
            (Detached, SaveSucceeded) => Some(Detached),

            (Unchanged, Add) => None,
            (Unchanged, Attach { .. }) => Some(Unchanged),
            (Unchanged, Update { .. }) | (Unchanged, Mutate) => Some(Modified),
            (Unchanged, Remove) => Some(Deleted),
            (Unchanged, SaveSucceeded) => Some(Unchanged),

            (Added, Remove) => Some(Detached),
            (Added, SaveSucceeded) => Some(Unchanged),
            (Added, _) => Some(Added),

            (Modified, Add) => None,
            (Modified, Remove) => Some(Deleted),
            (Modified, SaveSucceeded) => Some(Unchanged),
            (Modified, _) => Some(Modified),

            (Deleted, Attach { .. }) | (Deleted, Remove) => Some(Deleted),
            (Deleted, SaveSucceeded) => Some(Detached),
            (Deleted, _) => None,
        }
    }
}

impl fmt::Display for EntityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityState::Detached => write!(f, "Detached"),
            EntityState::Unchanged => write!(f, "Unchanged"),
            EntityState::Added => write!(f, "Added"),
            EntityState::Modified => write!(f, "Modified"),
            EntityState::Deleted => write!(f, "Deleted"),
        }
    }
}

/// Operations that move an entity between states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Track for insertion regardless of the key
    Add,
    /// Track as existing when the key is set
    Attach { key_set: bool },
    /// Track as existing with every property marked modified
    Update { key_set: bool },
    /// A scalar property changed
    Mutate,
    /// Schedule for deletion
    Remove,
    /// The entity's command was committed
    SaveSucceeded,
}

impl Transition {
    pub fn name(&self) -> &'static str {
        match self {
            Transition::Add => "add",
            Transition::Attach { .. } => "attach",
            Transition::Update { .. } => "update",
            Transition::Mutate => "modify",
            Transition::Remove => "remove",
            Transition::SaveSucceeded => "accept",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use EntityState::*;

    #[test]
    fn test_tracking_transitions() {
        assert_eq!(Detached.apply(Transition::Add), Some(Added));
        assert_eq!(Detached.apply(Transition::Attach { key_set: true }), Some(Unchanged));
        assert_eq!(Detached.apply(Transition::Attach { key_set: false }), Some(Added));
        assert_eq!(Detached.apply(Transition::Update { key_set: true }), Some(Modified));
        assert_eq!(Detached.apply(Transition::Update { key_set: false }), Some(Added));
    }

    #[test]
    fn test_remove_transitions() {
        assert_eq!(Unchanged.apply(Transition::Remove), Some(Deleted));
        assert_eq!(Modified.apply(Transition::Remove), Some(Deleted));
        assert_eq!(Added.apply(Transition::Remove), Some(Detached));
        assert_eq!(Detached.apply(Transition::Remove), None);
    }

    #[test]
    fn test_save_transitions() {
        assert_eq!(Added.apply(Transition::SaveSucceeded), Some(Unchanged));
        assert_eq!(Modified.apply(Transition::SaveSucceeded), Some(Unchanged));
        assert_eq!(Deleted.apply(Transition::SaveSucceeded), Some(Detached));
    }

    #[test]
    fn test_invalid_transitions() {
        assert_eq!(Deleted.apply(Transition::Mutate), None);
        assert_eq!(Deleted.apply(Transition::Update { key_set: true }), None);
        assert_eq!(Unchanged.apply(Transition::Add), None);
        assert_eq!(Unchanged.apply(Transition::Mutate), Some(Modified));
        assert_eq!(Added.apply(Transition::Mutate), Some(Added));
    }

    #[test]
    fn test_state_predicates() {
        assert!(Deleted.is_persisted());
        assert!(!Added.is_persisted());
        assert!(Added.is_pending());
        assert!(!Unchanged.is_pending());
        assert_eq!(Modified.to_string(), "Modified");
    }
}
