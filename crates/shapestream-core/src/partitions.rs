//! Partition-to-parent routing.
//!
//! Shapes are defined over logical parent tables, but the replication
//! stream labels changes with the physical partition they landed in.
//! This index relabels such changes onto the parent so the filter can
//! match them, and is kept current by schema-change events.

use std::collections::HashMap;

use crate::change::{Change, Relation, SchemaChange};

/// Maintains the `partition → parent` map and the set of parent relations
/// that currently have shapes.
#[derive(Debug, Default)]
pub struct Partitions {
    parents: HashMap<Relation, Relation>,
    tracked: HashMap<Relation, usize>,
}

impl Partitions {
    /// Creates an empty index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that a shape exists on `relation`.
    pub fn add_shape(&mut self, relation: &Relation) {
        *self.tracked.entry(relation.clone()).or_insert(0) += 1;
    }

    /// Records that a shape on `relation` went away.
    pub fn remove_shape(&mut self, relation: &Relation) {
        if let Some(count) = self.tracked.get_mut(relation) {
            *count -= 1;
            if *count == 0 {
                self.tracked.remove(relation);
            }
        }
    }

    /// Learns partition parentage from a schema-change event.
    pub fn observe(&mut self, schema_change: &SchemaChange) {
        match &schema_change.parent {
            Some(parent) => {
                self.parents
                    .insert(schema_change.relation.clone(), parent.clone());
            }
            None => {
                self.parents.remove(&schema_change.relation);
            }
        }
    }

    /// Returns the change relabelled onto its logical parent when the raw
    /// relation is a partition of a tracked parent; `None` when the change
    /// should pass through unchanged.
    ///
    /// A partition that has its own shape is not rewritten, so shapes
    /// defined directly on a partition keep working.
    #[must_use]
    pub fn handle_change(&self, change: &Change) -> Option<Change> {
        let relation = change.relation();
        if self.tracked.contains_key(relation) {
            return None;
        }
        let parent = self.parents.get(relation)?;
        if !self.tracked.contains_key(parent) {
            return None;
        }
        Some(change.with_relation(parent.clone()))
    }

    /// Returns the number of known partition mappings.
    #[must_use]
    pub fn mapping_count(&self) -> usize {
        self.parents.len()
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::Row;

    fn parent() -> Relation {
        Relation::new("public", "events")
    }

    fn partition() -> Relation {
        Relation::new("public", "events_2026_08")
    }

    fn schema_change(relation: Relation, parent: Option<Relation>) -> SchemaChange {
        SchemaChange {
            relation,
            columns: vec![],
            parent,
            op_index: 0,
        }
    }

    fn insert_on(relation: Relation) -> Change {
        Change::Insert {
            relation,
            new: Row::from_pairs([("id", Some("1"))]),
            op_index: 4,
        }
    }

    #[test]
    fn test_rewrites_partition_change_to_parent() {
        let mut partitions = Partitions::new();
        partitions.add_shape(&parent());
        partitions.observe(&schema_change(partition(), Some(parent())));

        let rewritten = partitions.handle_change(&insert_on(partition())).unwrap();
        assert_eq!(rewritten.relation(), &parent());
        assert_eq!(rewritten.op_index(), 4);
    }

    #[test]
    fn test_untracked_parent_passes_through() {
        let mut partitions = Partitions::new();
        partitions.observe(&schema_change(partition(), Some(parent())));
        assert!(partitions.handle_change(&insert_on(partition())).is_none());
    }

    #[test]
    fn test_unknown_relation_passes_through() {
        let mut partitions = Partitions::new();
        partitions.add_shape(&parent());
        assert!(partitions.handle_change(&insert_on(partition())).is_none());
    }

    #[test]
    fn test_shape_on_partition_itself_wins() {
        let mut partitions = Partitions::new();
        partitions.add_shape(&parent());
        partitions.add_shape(&partition());
        partitions.observe(&schema_change(partition(), Some(parent())));
        assert!(partitions.handle_change(&insert_on(partition())).is_none());
    }

    #[test]
    fn test_remove_shape_refcounts() {
        let mut partitions = Partitions::new();
        partitions.add_shape(&parent());
        partitions.add_shape(&parent());
        partitions.observe(&schema_change(partition(), Some(parent())));

        partitions.remove_shape(&parent());
        assert!(partitions.handle_change(&insert_on(partition())).is_some());

        partitions.remove_shape(&parent());
        assert!(partitions.handle_change(&insert_on(partition())).is_none());
    }

    #[test]
    fn test_detach_clears_mapping() {
        let mut partitions = Partitions::new();
        partitions.add_shape(&parent());
        partitions.observe(&schema_change(partition(), Some(parent())));
        assert_eq!(partitions.mapping_count(), 1);

        partitions.observe(&schema_change(partition(), None));
        assert_eq!(partitions.mapping_count(), 0);
        assert!(partitions.handle_change(&insert_on(partition())).is_none());
    }
}
