//! Turns decoded `pgoutput` messages into the core change vocabulary.
//!
//! The [`RelationCache`] remembers relation descriptions (the server
//! sends one before a relation's first row and on every schema change)
//! plus externally supplied partition parentage. The [`TxnAssembler`]
//! maps messages onto [`SourceEvent`]s, converting raw tuples into rows
//! using the cached column names.

use std::collections::HashMap;

use tracing::warn;

use shapestream_core::change::{Change, ColumnInfo, Relation, Row, SchemaChange};
use shapestream_core::collector::SourceEvent;

use crate::decoder::{PgMessage, PgRelation, PgTuple, PgValue, ReplicaIdentity};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors from stream assembly.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// A row message referenced a relation the server never described.
    #[error("row for undescribed relation OID {0}")]
    UnknownRelation(u32),
}

// ---------------------------------------------------------------------------
// RelationCache
// ---------------------------------------------------------------------------

/// Relation descriptions by OID, plus partition parentage.
///
/// Parentage comes from the catalog side of the connection (an external
/// collaborator): `pgoutput` relation messages do not carry it.
#[derive(Debug, Default)]
pub struct RelationCache {
    by_oid: HashMap<u32, PgRelation>,
    partition_parents: HashMap<Relation, Relation>,
}

impl RelationCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores or replaces a relation description.
    pub fn observe(&mut self, relation: PgRelation) {
        self.by_oid.insert(relation.oid, relation);
    }

    /// Returns the description for an OID.
    #[must_use]
    pub fn get(&self, oid: u32) -> Option<&PgRelation> {
        self.by_oid.get(&oid)
    }

    /// Records that `child` is a partition of `parent`.
    pub fn set_partition_parent(&mut self, child: Relation, parent: Relation) {
        self.partition_parents.insert(child, parent);
    }

    /// Returns the logical parent of a partition, if known.
    #[must_use]
    pub fn parent_of(&self, relation: &Relation) -> Option<&Relation> {
        self.partition_parents.get(relation)
    }

    /// Returns the number of cached relations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_oid.len()
    }

    /// Returns `true` if no relation has been described yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_oid.is_empty()
    }
}

// ---------------------------------------------------------------------------
// TxnAssembler
// ---------------------------------------------------------------------------

/// Maps decoded messages onto source events.
pub struct TxnAssembler {
    cache: RelationCache,
    replica_identity_check: bool,
}

impl TxnAssembler {
    /// Creates an assembler. With `replica_identity_check` set, updates
    /// and deletes lacking a full old tuple are flagged in the log.
    #[must_use]
    pub fn new(replica_identity_check: bool) -> Self {
        Self {
            cache: RelationCache::new(),
            replica_identity_check,
        }
    }

    /// Returns the relation cache.
    #[must_use]
    pub fn cache(&self) -> &RelationCache {
        &self.cache
    }

    /// Returns the mutable relation cache (partition parentage feed).
    pub fn cache_mut(&mut self) -> &mut RelationCache {
        &mut self.cache
    }

    /// Maps one message to a source event; `None` for messages with no
    /// downstream meaning (origin and type metadata).
    ///
    /// # Errors
    ///
    /// Fails when a row references a relation that was never described.
    pub fn handle_message(&mut self, msg: PgMessage) -> Result<Option<SourceEvent>, StreamError> {
        match msg {
            PgMessage::Begin { final_lsn, .. } => Ok(Some(SourceEvent::Begin { lsn: final_lsn })),
            PgMessage::Commit { commit_lsn, .. } => {
                Ok(Some(SourceEvent::Commit { lsn: commit_lsn }))
            }
            PgMessage::Relation(rel) => {
                let relation = Relation::new(rel.namespace.clone(), rel.name.clone());
                if self.replica_identity_check && rel.replica_identity != ReplicaIdentity::Full {
                    warn!(%relation, "relation is not REPLICA IDENTITY FULL; old tuples will be partial");
                }
                let schema_change = SchemaChange {
                    relation: relation.clone(),
                    columns: rel
                        .columns
                        .iter()
                        .map(|c| ColumnInfo {
                            name: c.name.clone(),
                            type_oid: c.type_oid,
                            is_key: c.is_key,
                        })
                        .collect(),
                    parent: self.cache.parent_of(&relation).cloned(),
                    op_index: 0,
                };
                self.cache.observe(rel);
                Ok(Some(SourceEvent::Changes {
                    changes: vec![Change::Relation(schema_change)],
                }))
            }
            PgMessage::Insert { relation_oid, new } => {
                let rel = self.relation(relation_oid)?;
                Ok(Some(SourceEvent::Changes {
                    changes: vec![Change::Insert {
                        relation: relation_of(rel),
                        new: tuple_to_row(&new, rel),
                        op_index: 0,
                    }],
                }))
            }
            PgMessage::Update {
                relation_oid,
                old,
                new,
            } => {
                let rel = self.relation(relation_oid)?;
                Ok(Some(SourceEvent::Changes {
                    changes: vec![Change::Update {
                        relation: relation_of(rel),
                        old: old.as_ref().map(|t| tuple_to_row(t, rel)),
                        new: tuple_to_row(&new, rel),
                        op_index: 0,
                    }],
                }))
            }
            PgMessage::Delete { relation_oid, old } => {
                let rel = self.relation(relation_oid)?;
                Ok(Some(SourceEvent::Changes {
                    changes: vec![Change::Delete {
                        relation: relation_of(rel),
                        old: tuple_to_row(&old, rel),
                        op_index: 0,
                    }],
                }))
            }
            PgMessage::Truncate { relation_oids, .. } => {
                let mut changes = Vec::with_capacity(relation_oids.len());
                for oid in relation_oids {
                    let rel = self.relation(oid)?;
                    changes.push(Change::Truncate {
                        relation: relation_of(rel),
                        op_index: 0,
                    });
                }
                Ok(Some(SourceEvent::Changes { changes }))
            }
            PgMessage::Origin { .. } | PgMessage::Type { .. } => Ok(None),
        }
    }

    fn relation(&self, oid: u32) -> Result<&PgRelation, StreamError> {
        self.cache.get(oid).ok_or(StreamError::UnknownRelation(oid))
    }
}

fn relation_of(rel: &PgRelation) -> Relation {
    Relation::new(rel.namespace.clone(), rel.name.clone())
}

/// Zips a tuple with its relation's column names. Unchanged TOAST
/// columns are omitted from the row entirely.
fn tuple_to_row(tuple: &PgTuple, rel: &PgRelation) -> Row {
    let mut row = Row::new();
    for (value, column) in tuple.0.iter().zip(&rel.columns) {
        match value {
            PgValue::Text(text) => row.set(column.name.clone(), Some(text.clone())),
            PgValue::Null => row.set(column.name.clone(), None),
            PgValue::Unchanged => {}
        }
    }
    row
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::PgRelationColumn;
    use shapestream_core::offset::Lsn;

    fn users_relation() -> PgRelation {
        PgRelation {
            oid: 16384,
            namespace: "public".into(),
            name: "users".into(),
            replica_identity: ReplicaIdentity::Full,
            columns: vec![
                PgRelationColumn {
                    name: "id".into(),
                    type_oid: 20,
                    is_key: true,
                },
                PgRelationColumn {
                    name: "name".into(),
                    type_oid: 25,
                    is_key: false,
                },
            ],
        }
    }

    fn tuple(values: Vec<PgValue>) -> PgTuple {
        PgTuple(values)
    }

    #[test]
    fn test_begin_commit_map_to_source_events() {
        let mut asm = TxnAssembler::new(false);
        let begin = asm
            .handle_message(PgMessage::Begin {
                final_lsn: Lsn::new(7),
                commit_ts_us: 0,
                xid: 1,
            })
            .unwrap();
        assert_eq!(begin, Some(SourceEvent::Begin { lsn: Lsn::new(7) }));

        let commit = asm
            .handle_message(PgMessage::Commit {
                commit_lsn: Lsn::new(7),
                end_lsn: Lsn::new(8),
                commit_ts_us: 0,
            })
            .unwrap();
        assert_eq!(commit, Some(SourceEvent::Commit { lsn: Lsn::new(7) }));
    }

    #[test]
    fn test_relation_message_produces_schema_change() {
        let mut asm = TxnAssembler::new(false);
        let event = asm
            .handle_message(PgMessage::Relation(users_relation()))
            .unwrap()
            .unwrap();
        let SourceEvent::Changes { changes } = event else {
            panic!("expected changes");
        };
        let Change::Relation(sc) = &changes[0] else {
            panic!("expected schema change");
        };
        assert_eq!(sc.relation, Relation::new("public", "users"));
        assert_eq!(sc.key_columns(), vec!["id".to_string()]);
        assert!(sc.parent.is_none());
        assert_eq!(asm.cache().len(), 1);
    }

    #[test]
    fn test_partition_parent_attached_to_schema_change() {
        let mut asm = TxnAssembler::new(false);
        let parent = Relation::new("public", "users");
        let child = Relation::new("public", "users_p1");
        asm.cache_mut()
            .set_partition_parent(child.clone(), parent.clone());

        let mut rel = users_relation();
        rel.name = "users_p1".into();
        let event = asm
            .handle_message(PgMessage::Relation(rel))
            .unwrap()
            .unwrap();
        let SourceEvent::Changes { changes } = event else {
            panic!("expected changes");
        };
        let Change::Relation(sc) = &changes[0] else {
            panic!("expected schema change");
        };
        assert_eq!(sc.parent.as_ref(), Some(&parent));
    }

    #[test]
    fn test_insert_converts_tuple_via_cached_columns() {
        let mut asm = TxnAssembler::new(false);
        asm.handle_message(PgMessage::Relation(users_relation()))
            .unwrap();

        let event = asm
            .handle_message(PgMessage::Insert {
                relation_oid: 16384,
                new: tuple(vec![
                    PgValue::Text("42".into()),
                    PgValue::Text("ada".into()),
                ]),
            })
            .unwrap()
            .unwrap();
        let SourceEvent::Changes { changes } = event else {
            panic!("expected changes");
        };
        let Change::Insert { relation, new, .. } = &changes[0] else {
            panic!("expected insert");
        };
        assert_eq!(relation, &Relation::new("public", "users"));
        assert_eq!(new.text("id"), Some("42"));
        assert_eq!(new.text("name"), Some("ada"));
    }

    #[test]
    fn test_unchanged_toast_column_omitted() {
        let mut asm = TxnAssembler::new(false);
        asm.handle_message(PgMessage::Relation(users_relation()))
            .unwrap();

        let event = asm
            .handle_message(PgMessage::Update {
                relation_oid: 16384,
                old: None,
                new: tuple(vec![PgValue::Text("42".into()), PgValue::Unchanged]),
            })
            .unwrap()
            .unwrap();
        let SourceEvent::Changes { changes } = event else {
            panic!("expected changes");
        };
        let Change::Update { new, old, .. } = &changes[0] else {
            panic!("expected update");
        };
        assert!(old.is_none());
        assert_eq!(new.get("id"), Some(Some("42")));
        assert_eq!(new.get("name"), None);
    }

    #[test]
    fn test_row_before_relation_is_error() {
        let mut asm = TxnAssembler::new(false);
        let err = asm
            .handle_message(PgMessage::Insert {
                relation_oid: 999,
                new: tuple(vec![]),
            })
            .unwrap_err();
        assert!(matches!(err, StreamError::UnknownRelation(999)));
    }

    #[test]
    fn test_origin_and_type_are_silent() {
        let mut asm = TxnAssembler::new(false);
        assert!(asm
            .handle_message(PgMessage::Origin {
                lsn: Lsn::new(1),
                name: "origin".into(),
            })
            .unwrap()
            .is_none());
        assert!(asm
            .handle_message(PgMessage::Type {
                oid: 1,
                namespace: "public".into(),
                name: "mood".into(),
            })
            .unwrap()
            .is_none());
    }
}
