//! Row-level change events produced by the replication stream.
//!
//! The replication producer turns decoded WAL traffic into [`Change`]s
//! grouped into transactions. A transaction reaches the dispatcher either
//! as one whole [`TxnEvent::Transaction`] or as a sequence of
//! [`TxnEvent::Fragment`]s closed by a [`TxnEvent::Commit`] marker;
//! fragments never span transactions.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::offset::Lsn;

// ---------------------------------------------------------------------------
// Relation
// ---------------------------------------------------------------------------

/// A `(schema, table)` pair identifying a Postgres relation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Relation {
    /// Schema (namespace) name.
    pub schema: String,
    /// Table name.
    pub table: String,
}

impl Relation {
    /// Creates a relation identifier.
    #[must_use]
    pub fn new(schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
        }
    }
}

impl fmt::Display for Relation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.table)
    }
}

// ---------------------------------------------------------------------------
// Row
// ---------------------------------------------------------------------------

/// A row in `pgoutput` text format: column name to text value, `None`
/// meaning SQL NULL. Columns absent from the map were unchanged TOAST
/// values the server did not resend.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Row {
    columns: BTreeMap<String, Option<String>>,
}

impl Row {
    /// Creates an empty row.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a row from `(column, value)` pairs.
    #[must_use]
    pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, Option<V>)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            columns: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.map(Into::into)))
                .collect(),
        }
    }

    /// Sets a column value. `None` records SQL NULL.
    pub fn set(&mut self, column: impl Into<String>, value: Option<String>) {
        self.columns.insert(column.into(), value);
    }

    /// Returns the value of a column, if the column is present.
    ///
    /// The outer `Option` distinguishes "column not present" from the
    /// inner `Option`'s SQL NULL.
    #[must_use]
    pub fn get(&self, column: &str) -> Option<Option<&str>> {
        self.columns.get(column).map(Option::as_deref)
    }

    /// Returns the non-null text value of a column, if any.
    #[must_use]
    pub fn text(&self, column: &str) -> Option<&str> {
        self.columns.get(column).and_then(Option::as_deref)
    }

    /// Iterates over `(column, value)` pairs in column-name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<&str>)> {
        self.columns
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_deref()))
    }

    /// Returns the number of columns present.
    #[must_use]
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// Returns `true` if the row has no columns.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Serializes the row as a flat JSON object.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        let map: serde_json::Map<String, serde_json::Value> = self
            .columns
            .iter()
            .map(|(k, v)| {
                let value = match v {
                    Some(s) => serde_json::Value::String(s.clone()),
                    None => serde_json::Value::Null,
                };
                (k.clone(), value)
            })
            .collect();
        serde_json::Value::Object(map)
    }

    /// Rebuilds a row from a flat JSON object produced by [`Row::to_json`].
    #[must_use]
    pub fn from_json(value: &serde_json::Value) -> Self {
        let mut row = Row::new();
        if let Some(map) = value.as_object() {
            for (k, v) in map {
                match v {
                    serde_json::Value::String(s) => row.set(k.clone(), Some(s.clone())),
                    serde_json::Value::Null => row.set(k.clone(), None),
                    other => row.set(k.clone(), Some(other.to_string())),
                }
            }
        }
        row
    }
}

// ---------------------------------------------------------------------------
// Change
// ---------------------------------------------------------------------------

/// A column descriptor carried by schema-change events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnInfo {
    /// Column name.
    pub name: String,
    /// Postgres type OID.
    pub type_oid: u32,
    /// Whether the column is part of the replica identity key.
    pub is_key: bool,
}

/// A relation (schema) change observed on the stream.
///
/// Sent by the server before the first row of a relation and again
/// whenever the relation's definition changes. `parent` is set when the
/// relation is a partition of a logical parent table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaChange {
    /// The relation being described.
    pub relation: Relation,
    /// Column descriptors in ordinal order.
    pub columns: Vec<ColumnInfo>,
    /// Logical parent when the relation is a partition.
    pub parent: Option<Relation>,
    /// Index of the operation within its transaction.
    pub op_index: u64,
}

impl SchemaChange {
    /// Returns the names of the replica-identity key columns.
    #[must_use]
    pub fn key_columns(&self) -> Vec<String> {
        self.columns
            .iter()
            .filter(|c| c.is_key)
            .map(|c| c.name.clone())
            .collect()
    }
}

/// One row-level operation within a transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Change {
    /// Row inserted.
    Insert {
        /// Target relation.
        relation: Relation,
        /// The new row.
        new: Row,
        /// Index within the transaction.
        op_index: u64,
    },
    /// Row updated. `old` is present only under `REPLICA IDENTITY FULL`
    /// (or when key columns changed).
    Update {
        /// Target relation.
        relation: Relation,
        /// The old row, when the server sent it.
        old: Option<Row>,
        /// The new row.
        new: Row,
        /// Index within the transaction.
        op_index: u64,
    },
    /// Row deleted.
    Delete {
        /// Target relation.
        relation: Relation,
        /// The old row (key columns only unless `REPLICA IDENTITY FULL`).
        old: Row,
        /// Index within the transaction.
        op_index: u64,
    },
    /// Table truncated.
    Truncate {
        /// Target relation.
        relation: Relation,
        /// Index within the transaction.
        op_index: u64,
    },
    /// Relation definition changed.
    Relation(SchemaChange),
}

impl Change {
    /// Returns the relation the change applies to.
    #[must_use]
    pub fn relation(&self) -> &Relation {
        match self {
            Change::Insert { relation, .. }
            | Change::Update { relation, .. }
            | Change::Delete { relation, .. }
            | Change::Truncate { relation, .. } => relation,
            Change::Relation(sc) => &sc.relation,
        }
    }

    /// Returns the operation's index within its transaction.
    #[must_use]
    pub fn op_index(&self) -> u64 {
        match self {
            Change::Insert { op_index, .. }
            | Change::Update { op_index, .. }
            | Change::Delete { op_index, .. }
            | Change::Truncate { op_index, .. } => *op_index,
            Change::Relation(sc) => sc.op_index,
        }
    }

    /// Re-stamps the operation's index within its transaction. The
    /// collector assigns indexes sequentially as it assembles fragments.
    pub fn set_op_index(&mut self, op_index: u64) {
        match self {
            Change::Insert { op_index: i, .. }
            | Change::Update { op_index: i, .. }
            | Change::Delete { op_index: i, .. }
            | Change::Truncate { op_index: i, .. } => *i = op_index,
            Change::Relation(sc) => sc.op_index = op_index,
        }
    }

    /// Returns a copy of the change relabelled onto another relation.
    ///
    /// Used by partition routing to re-address a change on a partition to
    /// its logical parent.
    #[must_use]
    pub fn with_relation(&self, relation: Relation) -> Change {
        let mut change = self.clone();
        match &mut change {
            Change::Insert { relation: r, .. }
            | Change::Update { relation: r, .. }
            | Change::Delete { relation: r, .. }
            | Change::Truncate { relation: r, .. } => *r = relation,
            Change::Relation(sc) => sc.relation = relation,
        }
        change
    }
}

/// Builds the stable record key for a row: the qualified relation name
/// followed by the quoted key-column values.
///
/// Falls back to every present column when `key_columns` is empty or none
/// of them are present in the row.
#[must_use]
pub fn record_key(relation: &Relation, row: &Row, key_columns: &[String]) -> String {
    let mut key = format!("\"{}\".\"{}\"", relation.schema, relation.table);
    let mut wrote_any = false;
    for col in key_columns {
        if let Some(value) = row.get(col) {
            key.push_str(&format!("/\"{}\"", value.unwrap_or("")));
            wrote_any = true;
        }
    }
    if !wrote_any {
        for (_, value) in row.iter() {
            key.push_str(&format!("/\"{}\"", value.unwrap_or("")));
        }
    }
    key
}

// ---------------------------------------------------------------------------
// Transactions and stream events
// ---------------------------------------------------------------------------

/// A complete committed transaction: an ordered, nonempty list of changes
/// with a single commit LSN.
#[derive(Debug, Clone, PartialEq)]
pub struct Transaction {
    /// Commit LSN.
    pub lsn: Lsn,
    /// Changes in operation order.
    pub changes: Vec<Change>,
}

/// A contiguous portion of one transaction's changes delivered as a
/// single event.
#[derive(Debug, Clone, PartialEq)]
pub struct TxnFragment {
    /// Commit LSN of the containing transaction.
    pub lsn: Lsn,
    /// Changes in operation order.
    pub changes: Vec<Change>,
}

/// An event on the dispatcher's input: either a whole transaction, or a
/// fragment / commit-marker pair for transactions streamed piecewise.
///
/// Payloads are reference-counted so fan-out to many consumers does not
/// copy change data.
#[derive(Debug, Clone)]
pub enum TxnEvent {
    /// A whole transaction, buffered upstream.
    Transaction(Arc<Transaction>),
    /// One fragment of an in-flight transaction.
    Fragment(Arc<TxnFragment>),
    /// Commit marker closing the in-flight transaction.
    Commit {
        /// Commit LSN of the transaction being closed.
        lsn: Lsn,
    },
}

impl TxnEvent {
    /// Returns the commit LSN the event belongs to.
    #[must_use]
    pub fn lsn(&self) -> Lsn {
        match self {
            TxnEvent::Transaction(txn) => txn.lsn,
            TxnEvent::Fragment(frag) => frag.lsn,
            TxnEvent::Commit { lsn } => *lsn,
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
