//! The replication producer: pulls the upstream stream under demand.
//!
//! [`LogCollector`] couples a [`ReplicationSource`] to the dispatcher.
//! It holds no buffer beyond the transaction being assembled: one demand
//! unit from the dispatcher buys exactly one dispatched event, so the
//! slowest consumer's acknowledgement pace is the pace at which WAL is
//! pulled from Postgres.
//!
//! Transactions at or below `max_fragment_changes` ship as a single
//! whole-transaction event; larger ones stream as fragments closed by a
//! commit marker, which is what keeps memory bounded for multi-gigabyte
//! transactions.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::change::{Change, Transaction, TxnEvent, TxnFragment};
use crate::dispatcher::DispatcherHandle;
use crate::offset::Lsn;

// ---------------------------------------------------------------------------
// ReplicationSource
// ---------------------------------------------------------------------------

/// An event pulled from the upstream replication stream.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceEvent {
    /// A transaction starts; `lsn` is its commit LSN.
    Begin {
        /// Commit LSN of the starting transaction.
        lsn: Lsn,
    },
    /// A batch of changes belonging to the open transaction.
    Changes {
        /// Changes in stream order.
        changes: Vec<Change>,
    },
    /// The open transaction committed.
    Commit {
        /// Commit LSN.
        lsn: Lsn,
    },
}

/// Errors from the replication source.
#[derive(Debug, thiserror::Error)]
pub enum ReplicationError {
    /// The stream ended cleanly (e.g. scripted sources in tests).
    #[error("replication stream ended")]
    EndOfStream,

    /// The connection dropped and could not be recovered.
    #[error("replication disconnected: {0}")]
    Disconnected(String),

    /// The stream violated the event grammar.
    #[error("replication protocol error: {0}")]
    Protocol(String),

    /// Transport-level I/O failure.
    #[error("replication I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// The upstream replication stream, pulled one event per demand unit.
///
/// Implementations own reconnection: a dropped connection is retried
/// with backoff internally and `next_event` resumes from the last
/// acknowledged LSN. Only unrecoverable failures surface as errors.
#[async_trait]
pub trait ReplicationSource: Send {
    /// Pulls the next event. Commit LSNs are monotonic across the
    /// stream's lifetime.
    async fn next_event(&mut self) -> Result<SourceEvent, ReplicationError>;

    /// Confirms that everything up to `lsn` is durably applied across
    /// all shapes, letting the server discard WAL and fixing the replay
    /// position for the next (re)connect.
    async fn acknowledge(&mut self, lsn: Lsn) -> Result<(), ReplicationError>;
}

// ---------------------------------------------------------------------------
// LogCollector
// ---------------------------------------------------------------------------

struct TxnBuilder {
    lsn: Lsn,
    changes: Vec<Change>,
    next_op_index: u64,
    fragmented: bool,
}

/// Pumps the replication source into the dispatcher under demand.
pub struct LogCollector<R: ReplicationSource> {
    source: R,
    dispatcher: DispatcherHandle,
    demand: mpsc::Receiver<()>,
    max_fragment_changes: usize,
    queue: VecDeque<TxnEvent>,
    txn: Option<TxnBuilder>,
    pending_ack: Option<Lsn>,
}

impl<R: ReplicationSource> LogCollector<R> {
    /// Creates a collector. `demand` is the channel the dispatcher grants
    /// demand units on.
    #[must_use]
    pub fn new(
        source: R,
        dispatcher: DispatcherHandle,
        demand: mpsc::Receiver<()>,
        max_fragment_changes: usize,
    ) -> Self {
        Self {
            source,
            dispatcher,
            demand,
            max_fragment_changes,
            queue: VecDeque::new(),
            txn: None,
            pending_ack: None,
        }
    }

    /// Runs the pump until the stream ends or the dispatcher goes away.
    /// Should be spawned as a tokio task.
    pub async fn run(mut self) {
        loop {
            if self.demand.recv().await.is_none() {
                info!("dispatcher gone; log collector stopping");
                return;
            }
            // Demand returning means every consumer durably processed the
            // previous event; the last commit can now be confirmed.
            if let Some(lsn) = self.pending_ack.take() {
                if let Err(err) = self.source.acknowledge(lsn).await {
                    warn!(%lsn, %err, "failed to acknowledge upstream");
                }
            }
            match self.next_out().await {
                Ok(Some(event)) => {
                    match &event {
                        TxnEvent::Commit { lsn } => self.pending_ack = Some(*lsn),
                        TxnEvent::Transaction(txn) => self.pending_ack = Some(txn.lsn),
                        TxnEvent::Fragment(_) => {}
                    }
                    self.dispatcher.dispatch(event);
                }
                Ok(None) => {
                    info!("replication stream ended; log collector stopping");
                    return;
                }
                Err(err) => {
                    error!(%err, "log collector stopping on replication error");
                    return;
                }
            }
        }
    }

    /// Produces the next dispatchable event, pulling and assembling
    /// source events as needed. `None` when the stream ended.
    async fn next_out(&mut self) -> Result<Option<TxnEvent>, ReplicationError> {
        loop {
            if let Some(event) = self.queue.pop_front() {
                return Ok(Some(event));
            }
            match self.source.next_event().await {
                Ok(SourceEvent::Begin { lsn }) => {
                    if self.txn.is_some() {
                        return Err(ReplicationError::Protocol(
                            "begin while a transaction is open".into(),
                        ));
                    }
                    self.txn = Some(TxnBuilder {
                        lsn,
                        changes: Vec::new(),
                        next_op_index: 0,
                        fragmented: false,
                    });
                }
                Ok(SourceEvent::Changes { changes }) => {
                    let Some(txn) = self.txn.as_mut() else {
                        return Err(ReplicationError::Protocol(
                            "changes outside a transaction".into(),
                        ));
                    };
                    for mut change in changes {
                        change.set_op_index(txn.next_op_index);
                        txn.next_op_index += 1;
                        txn.changes.push(change);
                    }
                    while txn.changes.len() >= self.max_fragment_changes {
                        let batch: Vec<Change> =
                            txn.changes.drain(..self.max_fragment_changes).collect();
                        txn.fragmented = true;
                        self.queue.push_back(TxnEvent::Fragment(Arc::new(TxnFragment {
                            lsn: txn.lsn,
                            changes: batch,
                        })));
                    }
                }
                Ok(SourceEvent::Commit { lsn }) => {
                    let Some(txn) = self.txn.take() else {
                        return Err(ReplicationError::Protocol(
                            "commit outside a transaction".into(),
                        ));
                    };
                    if txn.fragmented {
                        if !txn.changes.is_empty() {
                            self.queue.push_back(TxnEvent::Fragment(Arc::new(TxnFragment {
                                lsn: txn.lsn,
                                changes: txn.changes,
                            })));
                        }
                        self.queue.push_back(TxnEvent::Commit { lsn });
                    } else if txn.changes.is_empty() {
                        // Empty transaction: just close the demand loop.
                        self.queue.push_back(TxnEvent::Commit { lsn });
                    } else {
                        self.queue.push_back(TxnEvent::Transaction(Arc::new(Transaction {
                            lsn,
                            changes: txn.changes,
                        })));
                    }
                }
                Err(ReplicationError::EndOfStream) => return Ok(None),
                Err(err) => return Err(err),
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
