//! In-memory materialization of inner subquery shapes.
//!
//! One materializer runs per inner shape. It holds the shape's current
//! row-set keyed by record key and exposes it to dependent outer
//! consumers strictly at transaction boundaries: fragment-time changes
//! are journalled in `pending` and only a commit applies them, computes
//! the per-column move-in/move-out delta, and notifies subscribers.
//! Subscribers therefore never observe a half-applied transaction.
//!
//! Outer consumers additionally use the [`barrier`](MaterializerHandle::barrier)
//! round-trip to flush the mailbox before converting a transaction: once
//! the barrier returns, every notification for earlier commits has been
//! delivered to the subscriber channels.

use std::collections::{HashMap, HashSet};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::change::{Change, Row};
use crate::offset::{Lsn, Offset};
use crate::storage::{LogEntry, LogOp};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// A change paired with the stable record key of the row it touches.
///
/// Consumers compute keys once (they need them for log entries anyway)
/// and hand keyed changes to the materializer.
#[derive(Debug, Clone)]
pub struct KeyedChange {
    /// Stable record key.
    pub key: String,
    /// The underlying change.
    pub change: Change,
}

/// Notification sent to a subscriber at a commit boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaterializerNotification {
    /// Commit LSN of the transaction that was applied.
    pub lsn: Lsn,
    /// Values of the subscribed column that entered the shape.
    pub moved_in: Vec<String>,
    /// Values of the subscribed column that left the shape.
    pub moved_out: Vec<String>,
}

/// A granted subscription: the snapshot plus the notification stream.
#[derive(Debug)]
pub struct MaterializerSubscription {
    /// Value set of the subscribed column at the snapshot point.
    pub snapshot: HashSet<String>,
    /// LSN the snapshot is valid at (committed).
    pub applied_lsn: Lsn,
    /// Commit-boundary notifications, in LSN order.
    pub events: mpsc::UnboundedReceiver<MaterializerNotification>,
}

/// Errors from materializer operations.
#[derive(Debug, thiserror::Error)]
pub enum MaterializerError {
    /// The requested subscription offset has not been committed.
    #[error("offset {requested} is not committed (materializer applied up to {applied})")]
    OffsetNotCommitted {
        /// Offset the subscriber asked for.
        requested: Offset,
        /// LSN the materializer has applied.
        applied: Lsn,
    },

    /// The materializer task is gone.
    #[error("materializer is not running")]
    Closed,
}

// ---------------------------------------------------------------------------
// Materializer
// ---------------------------------------------------------------------------

struct ColumnIndex {
    counts: HashMap<String, usize>,
}

impl ColumnIndex {
    fn build(column: &str, rows: &HashMap<String, Row>) -> Self {
        let mut counts: HashMap<String, usize> = HashMap::new();
        for row in rows.values() {
            if let Some(value) = row.text(column) {
                *counts.entry(value.to_string()).or_insert(0) += 1;
            }
        }
        Self { counts }
    }

    fn value_set(&self) -> HashSet<String> {
        self.counts.keys().cloned().collect()
    }

    fn add(&mut self, row: &Row, column: &str) {
        if let Some(value) = row.text(column) {
            *self.counts.entry(value.to_string()).or_insert(0) += 1;
        }
    }

    fn remove(&mut self, row: &Row, column: &str) {
        if let Some(value) = row.text(column) {
            if let Some(count) = self.counts.get_mut(value) {
                *count -= 1;
                if *count == 0 {
                    self.counts.remove(value);
                }
            }
        }
    }
}

struct MatSubscriber {
    column: String,
    tx: mpsc::UnboundedSender<MaterializerNotification>,
}

/// The materializer state: authoritative row-set, journal, and
/// subscriber registry.
pub struct Materializer {
    rows: HashMap<String, Row>,
    pending: Vec<KeyedChange>,
    applied_lsn: Lsn,
    columns: HashMap<String, ColumnIndex>,
    subscribers: Vec<MatSubscriber>,
}

impl Materializer {
    /// Creates an empty materializer whose state is valid as of
    /// `applied_lsn` (the inner log's committed LSN at creation).
    #[must_use]
    pub fn new(applied_lsn: Lsn) -> Self {
        Self {
            rows: HashMap::new(),
            pending: Vec::new(),
            applied_lsn,
            columns: HashMap::new(),
            subscribers: Vec::new(),
        }
    }

    /// Rebuilds the row-set from committed log entries, in offset order.
    #[must_use]
    pub fn bootstrap(mut self, entries: &[LogEntry]) -> Self {
        for entry in entries {
            match entry.op {
                LogOp::Insert | LogOp::Update => {
                    if let Some(value) = &entry.value {
                        let incoming = Row::from_json(value);
                        let merged = match self.rows.get(&entry.key) {
                            Some(existing) => merge_rows(existing, &incoming),
                            None => incoming,
                        };
                        self.rows.insert(entry.key.clone(), merged);
                    }
                }
                LogOp::Delete => {
                    self.rows.remove(&entry.key);
                }
                LogOp::Truncate => {
                    self.rows.clear();
                }
            }
        }
        self
    }

    /// Returns the number of materialized rows.
    #[must_use]
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Returns the LSN the row-set is valid at.
    #[must_use]
    pub fn applied_lsn(&self) -> Lsn {
        self.applied_lsn
    }

    /// Journals fragment-time changes without touching the row-set.
    pub fn handle_changes(&mut self, changes: Vec<KeyedChange>) {
        self.pending.extend(changes);
    }

    /// Applies the journal, notifies subscribers with their move-in /
    /// move-out delta, and advances the applied LSN.
    ///
    /// Every subscriber gets a notification for every commit, even when
    /// its delta is empty; dependent consumers rely on that to order
    /// their own commits against this shape's state.
    pub fn handle_commit(&mut self, lsn: Lsn) {
        let before: HashMap<String, HashSet<String>> = self
            .columns
            .iter()
            .map(|(name, index)| (name.clone(), index.value_set()))
            .collect();

        for keyed in std::mem::take(&mut self.pending) {
            self.apply(&keyed);
        }
        self.applied_lsn = lsn;

        let mut subscribers = std::mem::take(&mut self.subscribers);
        subscribers.retain(|sub| {
            let after = self
                .columns
                .get(&sub.column)
                .map(ColumnIndex::value_set)
                .unwrap_or_default();
            let empty = HashSet::new();
            let was = before.get(&sub.column).unwrap_or(&empty);
            let mut moved_in: Vec<String> = after.difference(was).cloned().collect();
            let mut moved_out: Vec<String> = was.difference(&after).cloned().collect();
            moved_in.sort_unstable();
            moved_out.sort_unstable();
            sub.tx
                .send(MaterializerNotification {
                    lsn,
                    moved_in,
                    moved_out,
                })
                .is_ok()
        });
        self.subscribers = subscribers;
        debug!(%lsn, rows = self.rows.len(), "materializer applied commit");
    }

    /// Grants a subscription for one column's value set.
    ///
    /// `from` must be a committed offset: at or before the LSN this
    /// materializer has applied.
    ///
    /// # Errors
    ///
    /// Returns [`MaterializerError::OffsetNotCommitted`] when `from` is
    /// ahead of the applied LSN.
    pub fn subscribe(
        &mut self,
        from: Offset,
        column: &str,
    ) -> Result<MaterializerSubscription, MaterializerError> {
        if from.lsn > self.applied_lsn {
            return Err(MaterializerError::OffsetNotCommitted {
                requested: from,
                applied: self.applied_lsn,
            });
        }
        if !self.columns.contains_key(column) {
            self.columns
                .insert(column.to_string(), ColumnIndex::build(column, &self.rows));
        }
        let snapshot = self.columns[column].value_set();
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.push(MatSubscriber {
            column: column.to_string(),
            tx,
        });
        Ok(MaterializerSubscription {
            snapshot,
            applied_lsn: self.applied_lsn,
            events: rx,
        })
    }

    /// Applies one journalled change to the row-set and column indexes.
    fn apply(&mut self, keyed: &KeyedChange) {
        match &keyed.change {
            Change::Insert { new, .. } => {
                self.replace_row(&keyed.key, Some(new));
            }
            Change::Update { new, .. } => {
                let merged = match self.rows.get(&keyed.key) {
                    Some(existing) => merge_rows(existing, new),
                    None => new.clone(),
                };
                self.replace_row(&keyed.key, Some(&merged));
            }
            Change::Delete { .. } => {
                self.replace_row(&keyed.key, None);
            }
            Change::Truncate { .. } => {
                self.rows.clear();
                for index in self.columns.values_mut() {
                    index.counts.clear();
                }
            }
            Change::Relation(_) => {}
        }
    }

    fn replace_row(&mut self, key: &str, new: Option<&Row>) {
        if let Some(old) = self.rows.get(key) {
            for (column, index) in &mut self.columns {
                index.remove(old, column);
            }
        }
        match new {
            Some(row) => {
                for (column, index) in &mut self.columns {
                    index.add(row, column);
                }
                self.rows.insert(key.to_string(), row.clone());
            }
            None => {
                self.rows.remove(key);
            }
        }
    }

    /// Spawns the materializer as a task and returns its handle.
    #[must_use]
    pub fn spawn(self) -> (MaterializerHandle, tokio::task::JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(self.run(rx));
        (MaterializerHandle { tx }, task)
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<MaterializerMsg>) {
        while let Some(msg) = rx.recv().await {
            match msg {
                MaterializerMsg::Changes(changes) => self.handle_changes(changes),
                MaterializerMsg::Commit { lsn } => self.handle_commit(lsn),
                MaterializerMsg::Subscribe {
                    from,
                    column,
                    reply,
                } => {
                    let _ = reply.send(self.subscribe(from, &column));
                }
                MaterializerMsg::Barrier { reply } => {
                    let _ = reply.send(self.applied_lsn);
                }
            }
        }
        debug!("materializer stopped");
    }
}

/// Overlays `incoming` onto `base`, keeping base values for columns the
/// incoming row omits (unchanged TOAST columns).
fn merge_rows(base: &Row, incoming: &Row) -> Row {
    let mut merged = base.clone();
    for (column, value) in incoming.iter() {
        merged.set(column, value.map(str::to_string));
    }
    merged
}

// ---------------------------------------------------------------------------
// MaterializerHandle
// ---------------------------------------------------------------------------

enum MaterializerMsg {
    Changes(Vec<KeyedChange>),
    Commit {
        lsn: Lsn,
    },
    Subscribe {
        from: Offset,
        column: String,
        reply: oneshot::Sender<Result<MaterializerSubscription, MaterializerError>>,
    },
    Barrier {
        reply: oneshot::Sender<Lsn>,
    },
}

/// Cloneable handle for feeding and querying a running materializer.
#[derive(Clone)]
pub struct MaterializerHandle {
    tx: mpsc::UnboundedSender<MaterializerMsg>,
}

impl MaterializerHandle {
    /// Journals fragment-time changes (the `commit = false` phase).
    pub fn handle_changes(&self, changes: Vec<KeyedChange>) {
        if changes.is_empty() {
            return;
        }
        if self.tx.send(MaterializerMsg::Changes(changes)).is_err() {
            warn!("materializer gone; dropping journalled changes");
        }
    }

    /// Flushes the journal at a commit boundary (the `commit = true`
    /// phase).
    pub fn handle_commit(&self, lsn: Lsn) {
        if self.tx.send(MaterializerMsg::Commit { lsn }).is_err() {
            warn!(%lsn, "materializer gone; dropping commit");
        }
    }

    /// Subscribes to one column's value set from a committed offset.
    ///
    /// # Errors
    ///
    /// Returns [`MaterializerError::OffsetNotCommitted`] for offsets
    /// ahead of the applied LSN, or [`MaterializerError::Closed`] when
    /// the task is gone.
    pub async fn subscribe(
        &self,
        from: Offset,
        column: &str,
    ) -> Result<MaterializerSubscription, MaterializerError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(MaterializerMsg::Subscribe {
                from,
                column: column.to_string(),
                reply,
            })
            .map_err(|_| MaterializerError::Closed)?;
        rx.await.map_err(|_| MaterializerError::Closed)?
    }

    /// Round-trips the mailbox: when this returns, every commit enqueued
    /// before the call has been applied and its notifications delivered.
    /// Returns the applied LSN.
    ///
    /// # Errors
    ///
    /// Returns [`MaterializerError::Closed`] when the task is gone.
    pub async fn barrier(&self) -> Result<Lsn, MaterializerError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(MaterializerMsg::Barrier { reply })
            .map_err(|_| MaterializerError::Closed)?;
        rx.await.map_err(|_| MaterializerError::Closed)
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::Relation;

    fn teams() -> Relation {
        Relation::new("public", "teams")
    }

    fn insert(key: &str, pairs: &[(&str, Option<&str>)]) -> KeyedChange {
        KeyedChange {
            key: key.to_string(),
            change: Change::Insert {
                relation: teams(),
                new: Row::from_pairs(pairs.iter().map(|(k, v)| (*k, *v))),
                op_index: 0,
            },
        }
    }

    fn delete(key: &str, pairs: &[(&str, Option<&str>)]) -> KeyedChange {
        KeyedChange {
            key: key.to_string(),
            change: Change::Delete {
                relation: teams(),
                old: Row::from_pairs(pairs.iter().map(|(k, v)| (*k, *v))),
                op_index: 0,
            },
        }
    }

    fn subscribed(mat: &mut Materializer, column: &str) -> MaterializerSubscription {
        mat.subscribe(Offset::ZERO, column).unwrap()
    }

    // --- Two-phase journal tests ---

    #[test]
    fn test_journal_invisible_until_commit() {
        let mut mat = Materializer::new(Lsn::ZERO);
        let mut sub = subscribed(&mut mat, "id");

        mat.handle_changes(vec![insert("k1", &[("id", Some("1"))])]);
        assert_eq!(mat.row_count(), 0);
        assert!(sub.events.try_recv().is_err());

        mat.handle_commit(Lsn::new(5));
        assert_eq!(mat.row_count(), 1);
        let notif = sub.events.try_recv().unwrap();
        assert_eq!(notif.lsn, Lsn::new(5));
        assert_eq!(notif.moved_in, vec!["1".to_string()]);
        assert!(notif.moved_out.is_empty());
    }

    #[test]
    fn test_empty_commit_still_notifies() {
        let mut mat = Materializer::new(Lsn::ZERO);
        let mut sub = subscribed(&mut mat, "id");

        mat.handle_commit(Lsn::new(9));
        let notif = sub.events.try_recv().unwrap();
        assert_eq!(notif.lsn, Lsn::new(9));
        assert!(notif.moved_in.is_empty());
        assert!(notif.moved_out.is_empty());
        assert_eq!(mat.applied_lsn(), Lsn::new(9));
    }

    // --- Refcounting tests ---

    #[test]
    fn test_duplicate_values_refcounted() {
        let mut mat = Materializer::new(Lsn::ZERO);
        let mut sub = subscribed(&mut mat, "region");

        mat.handle_changes(vec![
        insert("k1", &[("id", Some("1")), ("region", Some("eu"))]),
            insert("k2", &[("id", Some("2")), ("region", Some("eu"))]),
        ]);
        mat.handle_commit(Lsn::new(1));
        assert_eq!(sub.events.try_recv().unwrap().moved_in, vec!["eu".to_string()]);

        // Removing one of two rows with the value is not a move-out.
        mat.handle_changes(vec![delete("k1", &[("id", Some("1"))])]);
        mat.handle_commit(Lsn::new(2));
        let notif = sub.events.try_recv().unwrap();
        assert!(notif.moved_out.is_empty());

        // Removing the last one is.
        mat.handle_changes(vec![delete("k2", &[("id", Some("2"))])]);
        mat.handle_commit(Lsn::new(3));
        let notif = sub.events.try_recv().unwrap();
        assert_eq!(notif.moved_out, vec!["eu".to_string()]);
    }

    #[test]
    fn test_update_moves_value() {
        let mut mat = Materializer::new(Lsn::ZERO);
        let mut sub = subscribed(&mut mat, "region");

        mat.handle_changes(vec![insert("k1", &[("id", Some("1")), ("region", Some("eu"))])]);
        mat.handle_commit(Lsn::new(1));
        sub.events.try_recv().unwrap();

        mat.handle_changes(vec![KeyedChange {
            key: "k1".to_string(),
            change: Change::Update {
                relation: teams(),
                old: None,
                new: Row::from_pairs([("id", Some("1")), ("region", Some("us"))]),
                op_index: 0,
            },
        }]);
        mat.handle_commit(Lsn::new(2));
        let notif = sub.events.try_recv().unwrap();
        assert_eq!(notif.moved_in, vec!["us".to_string()]);
        assert_eq!(notif.moved_out, vec!["eu".to_string()]);
    }

    #[test]
    fn test_update_merges_toast_omitted_columns() {
        let mut mat = Materializer::new(Lsn::ZERO);
        let mut sub = subscribed(&mut mat, "region");

        mat.handle_changes(vec![insert("k1", &[("id", Some("1")), ("region", Some("eu"))])]);
        mat.handle_commit(Lsn::new(1));
        sub.events.try_recv().unwrap();

        // Update that omits the region column must not drop the value.
        mat.handle_changes(vec![KeyedChange {
            key: "k1".to_string(),
            change: Change::Update {
                relation: teams(),
                old: None,
                new: Row::from_pairs([("id", Some("1"))]),
                op_index: 0,
            },
        }]);
        mat.handle_commit(Lsn::new(2));
        let notif = sub.events.try_recv().unwrap();
        assert!(notif.moved_in.is_empty());
        assert!(notif.moved_out.is_empty());
    }

    #[test]
    fn test_truncate_clears_everything() {
        let mut mat = Materializer::new(Lsn::ZERO);
        let mut sub = subscribed(&mut mat, "id");

        mat.handle_changes(vec![
            insert("k1", &[("id", Some("1"))]),
            insert("k2", &[("id", Some("2"))]),
        ]);
        mat.handle_commit(Lsn::new(1));
        sub.events.try_recv().unwrap();

        mat.handle_changes(vec![KeyedChange {
            key: String::new(),
            change: Change::Truncate {
                relation: teams(),
                op_index: 0,
            },
        }]);
        mat.handle_commit(Lsn::new(2));
        let notif = sub.events.try_recv().unwrap();
        assert_eq!(notif.moved_out.len(), 2);
        assert_eq!(mat.row_count(), 0);
    }

    // --- Subscribe tests ---

    #[test]
    fn test_subscribe_rejects_uncommitted_offset() {
        let mut mat = Materializer::new(Lsn::new(5));
        let err = mat
            .subscribe(Offset::new(Lsn::new(6), 0), "id")
            .unwrap_err();
        assert!(matches!(err, MaterializerError::OffsetNotCommitted { .. }));

        assert!(mat.subscribe(Offset::new(Lsn::new(5), 3), "id").is_ok());
        assert!(mat.subscribe(Offset::new(Lsn::new(2), 0), "id").is_ok());
    }

    #[test]
    fn test_subscribe_snapshot_reflects_bootstrap() {
        let entries = vec![
            LogEntry {
                offset: Offset::new(Lsn::new(1), 0),
                key: "k1".into(),
                op: LogOp::Insert,
                value: Some(serde_json::json!({ "id": "1" })),
                old_value: None,
            },
            LogEntry {
                offset: Offset::new(Lsn::new(2), 0),
                key: "k2".into(),
                op: LogOp::Insert,
                value: Some(serde_json::json!({ "id": "2" })),
                old_value: None,
            },
            LogEntry {
                offset: Offset::new(Lsn::new(3), 0),
                key: "k1".into(),
                op: LogOp::Delete,
                value: None,
                old_value: None,
            },
        ];
        let mut mat = Materializer::new(Lsn::new(3)).bootstrap(&entries);
        assert_eq!(mat.row_count(), 1);

        let sub = mat.subscribe(Offset::new(Lsn::new(3), 0), "id").unwrap();
        assert_eq!(sub.snapshot, HashSet::from(["2".to_string()]));
        assert_eq!(sub.applied_lsn, Lsn::new(3));
    }

    // --- Task-level tests ---

    #[tokio::test]
    async fn test_handle_roundtrip_and_barrier() {
        let mat = Materializer::new(Lsn::ZERO);
        let (handle, task) = mat.spawn();

        let mut sub = handle.subscribe(Offset::ZERO, "id").await.unwrap();
        handle.handle_changes(vec![insert("k1", &[("id", Some("1"))])]);
        handle.handle_commit(Lsn::new(4));

        // After the barrier, the commit notification is in our queue.
        let applied = handle.barrier().await.unwrap();
        assert_eq!(applied, Lsn::new(4));
        let notif = sub.events.try_recv().unwrap();
        assert_eq!(notif.moved_in, vec!["1".to_string()]);

        drop(handle);
        task.await.unwrap();
    }
}
