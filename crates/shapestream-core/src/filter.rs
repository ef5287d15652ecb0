//! Relation-indexed subscriber lookup.
//!
//! For every change on the stream the dispatcher asks the filter which
//! subscribers could be affected. Matching is conservative: predicate
//! terms that cannot be decided count as matches, so a shape may see a
//! change it ends up discarding but never misses one it needed.

use std::collections::{HashMap, HashSet};

use crate::change::{Change, Relation};
use crate::dispatcher::SubscriberId;
use crate::shape::Shape;

/// Maps incoming changes to the set of subscribers whose shape matches.
#[derive(Debug, Default)]
pub struct Filter {
    by_relation: HashMap<Relation, HashMap<SubscriberId, Shape>>,
    relation_of: HashMap<SubscriberId, Relation>,
}

impl Filter {
    /// Creates an empty filter.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Indexes a subscriber's shape. A subscriber has at most one shape;
    /// re-adding replaces the previous entry.
    pub fn add_shape(&mut self, subscriber: SubscriberId, shape: Shape) {
        self.remove_shape(subscriber);
        let relation = shape.relation().clone();
        self.by_relation
            .entry(relation.clone())
            .or_default()
            .insert(subscriber, shape);
        self.relation_of.insert(subscriber, relation);
    }

    /// Removes a subscriber's shape, returning it if present.
    pub fn remove_shape(&mut self, subscriber: SubscriberId) -> Option<Shape> {
        let relation = self.relation_of.remove(&subscriber)?;
        let shapes = self.by_relation.get_mut(&relation)?;
        let shape = shapes.remove(&subscriber);
        if shapes.is_empty() {
            self.by_relation.remove(&relation);
        }
        shape
    }

    /// Returns the subscribers whose shape could be affected by `change`.
    /// The returned set carries no ordering guarantee.
    #[must_use]
    pub fn affected_shapes(&self, change: &Change) -> HashSet<SubscriberId> {
        let Some(shapes) = self.by_relation.get(change.relation()) else {
            return HashSet::new();
        };
        shapes
            .iter()
            .filter(|(_, shape)| Self::change_affects_shape(shape, change))
            .map(|(id, _)| *id)
            .collect()
    }

    /// Returns the number of indexed subscribers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.relation_of.len()
    }

    /// Returns `true` if no subscriber is indexed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.relation_of.is_empty()
    }

    /// Conservative test of whether a single change can affect a shape.
    ///
    /// Truncates and schema changes affect every shape on the relation.
    /// Updates match when either the old or the new row satisfies the
    /// predicate, since the row may be moving out of the shape; an absent
    /// old row counts as a match.
    #[must_use]
    pub fn change_affects_shape(shape: &Shape, change: &Change) -> bool {
        if shape.relation() != change.relation() {
            return false;
        }
        let Some(pred) = shape.where_clause() else {
            return true;
        };
        match change {
            Change::Insert { new, .. } => pred.matches(new),
            Change::Update { old, new, .. } => {
                pred.matches(new) || old.as_ref().is_none_or(|o| pred.matches(o))
            }
            Change::Delete { old, .. } => pred.matches(old),
            Change::Truncate { .. } | Change::Relation(_) => true,
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
