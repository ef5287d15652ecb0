//! Per-shape consumer: turns raw transaction events into the shape's
//! durable log.
//!
//! Each consumer owns its shape's log exclusively and runs as one task.
//! It receives events from the dispatcher over a capacity-1 channel and
//! acknowledges each one only after it has been durably processed, which
//! is what couples the producer's demand to the slowest consumer.
//!
//! The write unit decides what "processed" means:
//!
//! - `txn_fragment` — every fragment is appended to storage immediately
//!   and acknowledged; only the committed watermark waits for the commit
//!   marker. Memory stays bounded no matter how large the transaction is.
//! - `txn` — fragments accumulate in memory and the whole transaction is
//!   converted, appended, and committed at the commit marker. Shapes
//!   whose predicate consults inner shapes run in this mode, because the
//!   membership test must see inner state as of this commit, not some
//!   fragment interleaving.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::timeout;
use tracing::{debug, error, info};

use crate::change::{record_key, Change, Relation, Row, TxnEvent};
use crate::dispatcher::{DispatcherHandle, SubscriberId};
use crate::filter::Filter;
use crate::materializer::{
    KeyedChange, MaterializerError, MaterializerHandle, MaterializerNotification,
    MaterializerSubscription,
};
use crate::offset::{Lsn, Offset};
use crate::shape::{Shape, ShapeDependency, ShapeHandle, WriteUnit};
use crate::storage::{LogEntry, LogOp, ShapeLog, StorageError};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors from consumer operations.
#[derive(Debug, thiserror::Error)]
pub enum ConsumerError {
    /// The consumer task is gone.
    #[error("shape consumer is not running")]
    Closed,

    /// A storage operation failed; fatal to the consumer.
    #[error("storage append failed: {0}")]
    Storage(#[from] StorageError),

    /// An inner materializer went away or rejected us.
    #[error(transparent)]
    Materializer(#[from] MaterializerError),

    /// An inner shape's commit notification did not arrive in time.
    #[error("inner shape {inner} stalled before commit {lsn}")]
    InnerCommitStalled {
        /// The inner shape being waited on.
        inner: ShapeHandle,
        /// Commit LSN the consumer was converting.
        lsn: Lsn,
    },
}

// ---------------------------------------------------------------------------
// InnerMembership
// ---------------------------------------------------------------------------

/// An outer consumer's live mirror of one inner shape's membership set.
///
/// Seeded from the materializer's subscription snapshot and advanced by
/// its commit-boundary notifications.
pub struct InnerMembership {
    dep: ShapeDependency,
    inner_shape: Shape,
    handle: MaterializerHandle,
    members: HashSet<String>,
    events: mpsc::UnboundedReceiver<MaterializerNotification>,
}

impl InnerMembership {
    /// Builds a membership mirror from a granted subscription.
    #[must_use]
    pub fn new(
        dep: ShapeDependency,
        inner_shape: Shape,
        handle: MaterializerHandle,
        subscription: MaterializerSubscription,
    ) -> Self {
        Self {
            dep,
            inner_shape,
            handle,
            members: subscription.snapshot,
            events: subscription.events,
        }
    }

    fn apply(&mut self, notification: &MaterializerNotification) {
        for value in &notification.moved_out {
            self.members.remove(value);
        }
        for value in &notification.moved_in {
            self.members.insert(value.clone());
        }
    }
}

// ---------------------------------------------------------------------------
// ConsumerHandle
// ---------------------------------------------------------------------------

enum ConsumerControl {
    LatestOffset(oneshot::Sender<Offset>),
    LatestCommittedOffset(oneshot::Sender<Offset>),
    Read {
        from: Offset,
        max: usize,
        reply: oneshot::Sender<Result<Vec<LogEntry>, StorageError>>,
    },
    Shutdown(oneshot::Sender<()>),
}

/// Cloneable handle exposing a running consumer's log to readers and to
/// the registry.
#[derive(Clone)]
pub struct ConsumerHandle {
    control: mpsc::UnboundedSender<ConsumerControl>,
    committed: watch::Receiver<Offset>,
}

impl ConsumerHandle {
    /// Returns the offset of the last appended change, possibly
    /// mid-transaction.
    ///
    /// # Errors
    ///
    /// Returns [`ConsumerError::Closed`] when the consumer is gone.
    pub async fn latest_offset(&self) -> Result<Offset, ConsumerError> {
        let (reply, rx) = oneshot::channel();
        self.control
            .send(ConsumerControl::LatestOffset(reply))
            .map_err(|_| ConsumerError::Closed)?;
        rx.await.map_err(|_| ConsumerError::Closed)
    }

    /// Returns the committed watermark.
    ///
    /// # Errors
    ///
    /// Returns [`ConsumerError::Closed`] when the consumer is gone.
    pub async fn latest_committed_offset(&self) -> Result<Offset, ConsumerError> {
        let (reply, rx) = oneshot::channel();
        self.control
            .send(ConsumerControl::LatestCommittedOffset(reply))
            .map_err(|_| ConsumerError::Closed)?;
        rx.await.map_err(|_| ConsumerError::Closed)
    }

    /// Reads up to `max` committed entries with offsets strictly greater
    /// than `from`.
    ///
    /// # Errors
    ///
    /// Fails when the consumer is gone or the underlying read fails.
    pub async fn read(&self, from: Offset, max: usize) -> Result<Vec<LogEntry>, ConsumerError> {
        let (reply, rx) = oneshot::channel();
        self.control
            .send(ConsumerControl::Read { from, max, reply })
            .map_err(|_| ConsumerError::Closed)?;
        Ok(rx.await.map_err(|_| ConsumerError::Closed)??)
    }

    /// Returns a watch over the committed watermark, for long-poll tails.
    #[must_use]
    pub fn committed_offsets(&self) -> watch::Receiver<Offset> {
        self.committed.clone()
    }

    /// Waits until the committed watermark moves strictly past `offset`
    /// and returns the new watermark. This is the long-poll primitive:
    /// a reader that has drained the log parks here instead of polling.
    ///
    /// # Errors
    ///
    /// Returns [`ConsumerError::Closed`] when the consumer is gone.
    pub async fn wait_past(&self, offset: Offset) -> Result<Offset, ConsumerError> {
        let mut rx = self.committed.clone();
        loop {
            let current = *rx.borrow_and_update();
            if current > offset {
                return Ok(current);
            }
            rx.changed().await.map_err(|_| ConsumerError::Closed)?;
        }
    }

    /// Stops the consumer after it finishes the event in hand.
    ///
    /// # Errors
    ///
    /// Returns [`ConsumerError::Closed`] when the consumer is already
    /// gone.
    pub async fn shutdown(&self) -> Result<(), ConsumerError> {
        let (reply, rx) = oneshot::channel();
        self.control
            .send(ConsumerControl::Shutdown(reply))
            .map_err(|_| ConsumerError::Closed)?;
        rx.await.map_err(|_| ConsumerError::Closed)
    }

    /// Returns `true` if the consumer task has stopped.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.control.is_closed()
    }
}

// ---------------------------------------------------------------------------
// ShapeConsumer
// ---------------------------------------------------------------------------

/// A derived shape operation produced by change conversion, before it is
/// split into a log entry and a materializer notification.
struct DerivedOp {
    key: String,
    op: LogOp,
    new: Option<Row>,
    old: Option<Row>,
    op_index: u64,
}

/// The per-shape consumer state machine.
pub struct ShapeConsumer<S: ShapeLog> {
    id: SubscriberId,
    shape: Shape,
    shape_handle: ShapeHandle,
    write_unit: WriteUnit,
    log: S,
    dispatcher: DispatcherHandle,
    committed: watch::Sender<Offset>,
    /// Replica-identity key columns per relation, learned from
    /// schema-change events (the server sends one before a relation's
    /// first row).
    key_columns: HashMap<Relation, Vec<String>>,
    /// This shape's own materializer, when it is an inner shape.
    materializer: Option<MaterializerHandle>,
    /// Inner membership mirrors, when this shape is an outer shape.
    inner: Vec<InnerMembership>,
    /// Buffered raw changes of the in-flight transaction (`txn` mode).
    buffer: Vec<Change>,
    /// How long to wait on an inner shape at commit before giving up.
    inner_wait: Duration,
}

impl<S: ShapeLog> ShapeConsumer<S> {
    /// Creates a consumer for a shape over its log.
    #[must_use]
    pub fn new(
        id: SubscriberId,
        shape: Shape,
        write_unit: WriteUnit,
        log: S,
        dispatcher: DispatcherHandle,
        inner_wait: Duration,
    ) -> Self {
        let shape_handle = shape.handle();
        let committed = watch::Sender::new(log.latest_committed_offset());
        Self {
            id,
            shape,
            shape_handle,
            write_unit,
            log,
            dispatcher,
            committed,
            key_columns: HashMap::new(),
            materializer: None,
            inner: Vec::new(),
            buffer: Vec::new(),
            inner_wait,
        }
    }

    /// Attaches this shape's own materializer (inner-shape role).
    #[must_use]
    pub fn with_materializer(mut self, materializer: MaterializerHandle) -> Self {
        self.materializer = Some(materializer);
        self
    }

    /// Attaches a membership mirror of an inner shape (outer-shape role).
    #[must_use]
    pub fn with_inner_membership(mut self, membership: InnerMembership) -> Self {
        self.inner.push(membership);
        self
    }

    /// Returns the write unit the consumer runs under.
    #[must_use]
    pub fn write_unit(&self) -> WriteUnit {
        self.write_unit
    }

    /// Spawns the consumer task. Returns its handle, the event sender to
    /// register with the dispatcher (capacity 1), the channel on which
    /// the log comes back when the task stops (so restarts keep it), and
    /// the join handle.
    #[must_use]
    pub fn spawn(
        self,
    ) -> (
        ConsumerHandle,
        mpsc::Sender<TxnEvent>,
        oneshot::Receiver<S>,
        tokio::task::JoinHandle<()>,
    ) {
        let (events_tx, events_rx) = mpsc::channel(1);
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (log_back_tx, log_back_rx) = oneshot::channel();
        let handle = ConsumerHandle {
            control: control_tx,
            committed: self.committed.subscribe(),
        };
        let task = tokio::spawn(self.run(events_rx, control_rx, log_back_tx));
        (handle, events_tx, log_back_rx, task)
    }

    async fn run(
        mut self,
        events: mpsc::Receiver<TxnEvent>,
        control: mpsc::UnboundedReceiver<ConsumerControl>,
        log_back: oneshot::Sender<S>,
    ) {
        info!(shape = %self.shape_handle, write_unit = %self.write_unit, "shape consumer started");
        self.run_loop(events, control).await;
        // The log survives this consumer; a restarted one picks it up.
        let _ = log_back.send(self.log);
    }

    async fn run_loop(
        &mut self,
        mut events: mpsc::Receiver<TxnEvent>,
        mut control: mpsc::UnboundedReceiver<ConsumerControl>,
    ) {
        loop {
            tokio::select! {
                Some(msg) = control.recv() => {
                    if self.handle_control(msg) {
                        debug!(shape = %self.shape_handle, "shape consumer shut down");
                        return;
                    }
                }
                Some(event) = events.recv() => {
                    match self.handle_event(event).await {
                        Ok(()) => self.dispatcher.ask(self.id),
                        Err(err) => {
                            error!(shape = %self.shape_handle, %err, "shape consumer crashed");
                            self.dispatcher.cancel(self.id);
                            return;
                        }
                    }
                }
                else => return,
            }
        }
    }

    /// Handles a reader/registry request. Returns `true` on shutdown.
    fn handle_control(&mut self, msg: ConsumerControl) -> bool {
        match msg {
            ConsumerControl::LatestOffset(reply) => {
                let _ = reply.send(self.log.latest_offset());
            }
            ConsumerControl::LatestCommittedOffset(reply) => {
                let _ = reply.send(self.log.latest_committed_offset());
            }
            ConsumerControl::Read { from, max, reply } => {
                let _ = reply.send(self.log.read(from, max));
            }
            ConsumerControl::Shutdown(reply) => {
                let _ = reply.send(());
                return true;
            }
        }
        false
    }

    async fn handle_event(&mut self, event: TxnEvent) -> Result<(), ConsumerError> {
        match self.write_unit {
            WriteUnit::TxnFragment => match event {
                TxnEvent::Fragment(fragment) => {
                    self.write_txn_fragment(fragment.lsn, &fragment.changes)
                }
                TxnEvent::Commit { lsn } => self.complete_pending_txn(lsn),
                TxnEvent::Transaction(txn) => {
                    self.write_txn_fragment(txn.lsn, &txn.changes)?;
                    self.complete_pending_txn(txn.lsn)
                }
            },
            WriteUnit::Txn => match event {
                TxnEvent::Fragment(fragment) => {
                    self.buffer.extend(fragment.changes.iter().cloned());
                    Ok(())
                }
                TxnEvent::Commit { lsn } => {
                    let changes = std::mem::take(&mut self.buffer);
                    self.finish_txn(lsn, &changes).await
                }
                TxnEvent::Transaction(txn) => {
                    let mut changes = std::mem::take(&mut self.buffer);
                    changes.extend(txn.changes.iter().cloned());
                    self.finish_txn(txn.lsn, &changes).await
                }
            },
        }
    }

    /// Fragment-mode write path: append the shape's portion of the
    /// fragment and journal it to the materializer. The committed
    /// watermark does not move.
    fn write_txn_fragment(&mut self, lsn: Lsn, changes: &[Change]) -> Result<(), ConsumerError> {
        self.learn_schemas(changes);
        let ops: Vec<DerivedOp> = changes
            .iter()
            .filter_map(|change| self.convert_change(change, None, None))
            .collect();
        self.persist(ops, lsn, false)
    }

    /// Fragment-mode commit path: advance the committed watermark to the
    /// transaction's head and flush the materializer journal.
    fn complete_pending_txn(&mut self, lsn: Lsn) -> Result<(), ConsumerError> {
        self.log.commit(self.log.latest_offset())?;
        let watermark = self.log.latest_committed_offset();
        self.committed.send_replace(watermark);
        if let Some(materializer) = &self.materializer {
            materializer.handle_commit(lsn);
        }
        debug!(shape = %self.shape_handle, %lsn, %watermark, "committed");
        Ok(())
    }

    /// Whole-transaction path (`txn` mode): convert, append, and commit
    /// in one step.
    async fn finish_txn(&mut self, lsn: Lsn, changes: &[Change]) -> Result<(), ConsumerError> {
        self.learn_schemas(changes);

        let (before_sets, after_sets) = if self.inner.is_empty() {
            (None, None)
        } else {
            let (before, after) = self.sync_inner_memberships(lsn, changes).await?;
            (Some(before), Some(after))
        };

        let ops: Vec<DerivedOp> = changes
            .iter()
            .filter_map(|change| {
                self.convert_change(change, before_sets.as_deref(), after_sets.as_deref())
            })
            .collect();
        self.persist(ops, lsn, true)?;

        let watermark = self.log.latest_committed_offset();
        self.committed.send_replace(watermark);
        debug!(shape = %self.shape_handle, %lsn, %watermark, "transaction applied");
        Ok(())
    }

    /// Brings every inner membership mirror up to this transaction's
    /// commit and returns the membership value-sets before and after it.
    ///
    /// For each inner shape: a mailbox barrier on its materializer
    /// guarantees that all notifications for earlier commits are already
    /// queued here; those are drained into the mirror. If this
    /// transaction also touches the inner shape, its own notification is
    /// awaited so the "after" set reflects this commit.
    async fn sync_inner_memberships(
        &mut self,
        lsn: Lsn,
        changes: &[Change],
    ) -> Result<(Vec<HashSet<String>>, Vec<HashSet<String>>), ConsumerError> {
        let mut before_sets = Vec::with_capacity(self.inner.len());
        let mut after_sets = Vec::with_capacity(self.inner.len());

        for membership in &mut self.inner {
            membership.handle.barrier().await?;

            // Everything the inner shape committed before this transaction
            // is now queued; fold it into the mirror. A notification at
            // this commit's LSN is this transaction's own delta.
            let mut this_txn = None;
            while this_txn.is_none() {
                match membership.events.try_recv() {
                    Ok(notification) if notification.lsn < lsn => membership.apply(&notification),
                    Ok(notification) => this_txn = Some(notification),
                    Err(_) => break,
                }
            }

            // If this transaction also touches the inner shape, its
            // notification is guaranteed to arrive; wait for it so the
            // "after" set reflects this commit.
            let affects_inner = changes
                .iter()
                .any(|c| Filter::change_affects_shape(&membership.inner_shape, c));
            if this_txn.is_none() && affects_inner {
                loop {
                    let notification = timeout(self.inner_wait, membership.events.recv())
                        .await
                        .map_err(|_| ConsumerError::InnerCommitStalled {
                            inner: membership.dep.inner.clone(),
                            lsn,
                        })?
                        .ok_or(MaterializerError::Closed)?;
                    if notification.lsn < lsn {
                        membership.apply(&notification);
                    } else {
                        this_txn = Some(notification);
                        break;
                    }
                }
            }

            let before = membership.members.clone();
            if let Some(notification) = &this_txn {
                membership.apply(notification);
            }
            before_sets.push(before);
            after_sets.push(membership.members.clone());
        }
        Ok((before_sets, after_sets))
    }

    /// Records replica-identity key columns from schema changes.
    fn learn_schemas(&mut self, changes: &[Change]) {
        for change in changes {
            if let Change::Relation(sc) = change {
                self.key_columns
                    .insert(sc.relation.clone(), sc.key_columns());
            }
        }
    }

    /// Converts one raw change into this shape's derived operation, or
    /// `None` when the change does not belong to the shape.
    ///
    /// With membership sets present (subquery shapes at commit), rows are
    /// classified against inner state before and after the transaction:
    /// entering rows become inserts, leaving rows become deletes, rows
    /// inside on both sides pass through, rows outside on both sides are
    /// dropped.
    fn convert_change(
        &self,
        change: &Change,
        before: Option<&[HashSet<String>]>,
        after: Option<&[HashSet<String>]>,
    ) -> Option<DerivedOp> {
        if change.relation() != self.shape.relation() {
            return None;
        }
        match change {
            Change::Relation(_) => None,
            Change::Truncate { relation, op_index } => Some(DerivedOp {
                key: record_key(relation, &Row::new(), &[]),
                op: LogOp::Truncate,
                new: None,
                old: None,
                op_index: *op_index,
            }),
            Change::Insert {
                relation,
                new,
                op_index,
            } => {
                if !self.row_in_shape(new, after) {
                    return None;
                }
                Some(DerivedOp {
                    key: self.key_of(relation, new),
                    op: LogOp::Insert,
                    new: Some(new.clone()),
                    old: None,
                    op_index: *op_index,
                })
            }
            Change::Delete {
                relation,
                old,
                op_index,
            } => {
                if !self.row_in_shape(old, before) {
                    return None;
                }
                Some(DerivedOp {
                    key: self.key_of(relation, old),
                    op: LogOp::Delete,
                    new: None,
                    old: Some(old.clone()),
                    op_index: *op_index,
                })
            }
            Change::Update {
                relation,
                old,
                new,
                op_index,
            } => {
                // An absent old row (replica identity not FULL) counts as
                // previously inside, so a failing new row still emits the
                // delete a departing client needs.
                let was_in = old
                    .as_ref()
                    .map_or(true, |row| self.row_in_shape(row, before));
                let is_in = self.row_in_shape(new, after);
                let key = self.key_of(relation, new);
                match (was_in, is_in) {
                    (true, true) => Some(DerivedOp {
                        key,
                        op: LogOp::Update,
                        new: Some(new.clone()),
                        old: old.clone(),
                        op_index: *op_index,
                    }),
                    (false, true) => Some(DerivedOp {
                        key,
                        op: LogOp::Insert,
                        new: Some(new.clone()),
                        old: None,
                        op_index: *op_index,
                    }),
                    (true, false) => Some(DerivedOp {
                        key,
                        op: LogOp::Delete,
                        new: None,
                        old: old.clone().or_else(|| Some(new.clone())),
                        op_index: *op_index,
                    }),
                    (false, false) => None,
                }
            }
        }
    }

    /// Evaluates the shape predicate for a row, resolving subquery terms
    /// through the given membership sets when present.
    fn row_in_shape(
        &self,
        row: &Row,
        sets: Option<&[HashSet<String>]>,
    ) -> bool {
        let Some(pred) = self.shape.where_clause() else {
            return true;
        };
        match sets {
            None => pred.matches(row),
            Some(sets) => pred.matches_with_membership(row, &|handle, inner_column, value| {
                self.inner
                    .iter()
                    .zip(sets)
                    .find(|(m, _)| {
                        &m.dep.inner == handle && m.dep.inner_column == inner_column
                    })
                    .map_or(true, |(_, set)| set.contains(value))
            }),
        }
    }

    fn key_of(&self, relation: &Relation, row: &Row) -> String {
        let key_columns = self
            .key_columns
            .get(relation)
            .map_or(&[] as &[String], Vec::as_slice);
        record_key(relation, row, key_columns)
    }

    /// Appends derived ops to the log and journals them to the shape's
    /// materializer; commits when `commit` is set.
    fn persist(&mut self, ops: Vec<DerivedOp>, lsn: Lsn, commit: bool) -> Result<(), ConsumerError> {
        if !ops.is_empty() {
            let entries: Vec<LogEntry> = ops
                .iter()
                .map(|op| LogEntry {
                    offset: Offset::new(lsn, op.op_index),
                    key: op.key.clone(),
                    op: op.op,
                    value: op.new.as_ref().map(Row::to_json),
                    old_value: op.old.as_ref().map(Row::to_json),
                })
                .collect();
            self.log.append(entries)?;

            if let Some(materializer) = &self.materializer {
                let keyed: Vec<KeyedChange> = ops
                    .into_iter()
                    .map(|op| derived_to_keyed(self.shape.relation().clone(), op))
                    .collect();
                materializer.handle_changes(keyed);
            }
        }
        if commit {
            self.log.commit(self.log.latest_offset())?;
            if let Some(materializer) = &self.materializer {
                materializer.handle_commit(lsn);
            }
        }
        Ok(())
    }
}

/// Rebuilds a [`KeyedChange`] from a derived op so the materializer
/// mirrors exactly what the log recorded.
fn derived_to_keyed(relation: Relation, op: DerivedOp) -> KeyedChange {
    let change = match op.op {
        LogOp::Insert => Change::Insert {
            relation,
            new: op.new.unwrap_or_default(),
            op_index: op.op_index,
        },
        LogOp::Update => Change::Update {
            relation,
            old: op.old,
            new: op.new.unwrap_or_default(),
            op_index: op.op_index,
        },
        LogOp::Delete => Change::Delete {
            relation,
            old: op.old.unwrap_or_default(),
            op_index: op.op_index,
        },
        LogOp::Truncate => Change::Truncate {
            relation,
            op_index: op.op_index,
        },
    };
    KeyedChange {
        key: op.key,
        change,
    }
}

// ===========================================================================
// Tests
// ===========================================================================
