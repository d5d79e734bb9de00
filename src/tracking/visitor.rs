use super::EntityState;
use crate::core::{EntityId, Row, Value};
use std::collections::BTreeSet;

/// Per-node callback of `walk_graph`.
///
/// Called once for every entity that is not yet tracked, before it is
/// registered. The node carries the state the walker would assign; the
/// visitor may replace it, or flag individual properties for a partial
/// update.
pub trait GraphVisitor {
    fn visit(&mut self, node: &mut GraphNode<'_>);
}

impl<F> GraphVisitor for F
where
    F: FnMut(&mut GraphNode<'_>),
{
    fn visit(&mut self, node: &mut GraphNode<'_>) {
        self(node)
    }
}

#[derive(Debug)]
pub struct GraphNode<'a> {
    pub(crate) entity: EntityId,
    pub(crate) entity_type: &'a str,
    pub(crate) values: &'a Row,
    pub(crate) key_set: bool,
    pub(crate) source: Option<(EntityId, &'a str)>,
    pub(crate) proposed: EntityState,
    pub(crate) state: EntityState,
    pub(crate) modified: BTreeSet<String>,
}

impl GraphNode<'_> {
    pub fn entity(&self) -> EntityId {
        self.entity
    }

    pub fn entity_type(&self) -> &str {
        self.entity_type
    }

    pub fn value(&self, property: &str) -> Option<&Value> {
        self.values.get(property)
    }

    pub fn is_key_set(&self) -> bool {
        self.key_set
    }

    /// Entity and navigation through which this node was reached; `None`
    /// for the root.
    pub fn source(&self) -> Option<(EntityId, &str)> {
        self.source
    }

    pub fn proposed_state(&self) -> EntityState {
        self.proposed
    }

    pub fn state(&self) -> EntityState {
        self.state
    }

    /// `Detached` leaves the node untracked and stops traversal below it.
    pub fn set_state(&mut self, state: EntityState) {
        self.state = state;
    }

    pub fn mark_modified(&mut self, property: &str) {
        self.modified.insert(property.to_string());
    }

    pub(crate) fn is_overridden(&self) -> bool {
        self.state != self.proposed || !self.modified.is_empty()
    }
}
