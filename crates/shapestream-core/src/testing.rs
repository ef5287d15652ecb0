//! Test doubles shared by unit and end-to-end tests.
//!
//! [`ScriptedSource`] replaces the Postgres ingress: it replays a fixed
//! list of source events and records upstream acknowledgements, so
//! pipeline behavior can be asserted without a database.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::change::{Change, Relation, Row};
use crate::collector::{ReplicationError, ReplicationSource, SourceEvent};
use crate::offset::Lsn;

/// A replication source that replays scripted events.
///
/// Once the script is exhausted, `next_event` parks forever (mirroring a
/// quiet upstream) unless [`end_when_drained`](Self::end_when_drained)
/// was set, in which case it reports end-of-stream.
pub struct ScriptedSource {
    events: VecDeque<SourceEvent>,
    acknowledged: Arc<Mutex<Vec<Lsn>>>,
    end_when_drained: bool,
}

impl ScriptedSource {
    /// Creates a source that ends the stream after the script drains.
    #[must_use]
    pub fn new(events: Vec<SourceEvent>) -> Self {
        Self {
            events: events.into(),
            acknowledged: Arc::new(Mutex::new(Vec::new())),
            end_when_drained: true,
        }
    }

    /// Makes the source park forever once drained instead of ending.
    #[must_use]
    pub fn parking(mut self) -> Self {
        self.end_when_drained = false;
        self
    }

    /// Returns the shared record of acknowledged LSNs.
    #[must_use]
    pub fn acknowledged(&self) -> Arc<Mutex<Vec<Lsn>>> {
        Arc::clone(&self.acknowledged)
    }
}

#[async_trait]
impl ReplicationSource for ScriptedSource {
    async fn next_event(&mut self) -> Result<SourceEvent, ReplicationError> {
        match self.events.pop_front() {
            Some(event) => Ok(event),
            None if self.end_when_drained => Err(ReplicationError::EndOfStream),
            None => {
                std::future::pending::<()>().await;
                unreachable!()
            }
        }
    }

    async fn acknowledge(&mut self, lsn: Lsn) -> Result<(), ReplicationError> {
        self.acknowledged.lock().unwrap().push(lsn);
        Ok(())
    }
}

/// A replication source fed interactively over a channel, for tests
/// that need to register shapes before any event flows.
pub struct ChannelSource {
    rx: mpsc::UnboundedReceiver<SourceEvent>,
    acknowledged: Arc<Mutex<Vec<Lsn>>>,
}

impl ChannelSource {
    /// Creates the source and the sender that scripts it. Dropping the
    /// sender ends the stream.
    #[must_use]
    pub fn new() -> (mpsc::UnboundedSender<SourceEvent>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            tx,
            Self {
                rx,
                acknowledged: Arc::new(Mutex::new(Vec::new())),
            },
        )
    }

    /// Returns the shared record of acknowledged LSNs.
    #[must_use]
    pub fn acknowledged(&self) -> Arc<Mutex<Vec<Lsn>>> {
        Arc::clone(&self.acknowledged)
    }
}

#[async_trait]
impl ReplicationSource for ChannelSource {
    async fn next_event(&mut self) -> Result<SourceEvent, ReplicationError> {
        self.rx
            .recv()
            .await
            .ok_or(ReplicationError::EndOfStream)
    }

    async fn acknowledge(&mut self, lsn: Lsn) -> Result<(), ReplicationError> {
        self.acknowledged.lock().unwrap().push(lsn);
        Ok(())
    }
}

/// Builds a row from `(column, value)` pairs.
#[must_use]
pub fn row(pairs: &[(&str, Option<&str>)]) -> Row {
    Row::from_pairs(pairs.iter().map(|(k, v)| (*k, *v)))
}

/// Builds an insert change; the collector re-stamps op indexes.
#[must_use]
pub fn insert(relation: Relation, pairs: &[(&str, Option<&str>)]) -> Change {
    Change::Insert {
        relation,
        new: row(pairs),
        op_index: 0,
    }
}

/// Builds an update change with both tuples present.
#[must_use]
pub fn update(
    relation: Relation,
    old: &[(&str, Option<&str>)],
    new: &[(&str, Option<&str>)],
) -> Change {
    Change::Update {
        relation,
        old: Some(row(old)),
        new: row(new),
        op_index: 0,
    }
}

/// Builds a delete change.
#[must_use]
pub fn delete(relation: Relation, old: &[(&str, Option<&str>)]) -> Change {
    Change::Delete {
        relation,
        old: row(old),
        op_index: 0,
    }
}

/// Scripts a whole transaction: begin, one change batch, commit.
#[must_use]
pub fn txn(lsn: u64, changes: Vec<Change>) -> Vec<SourceEvent> {
    vec![
        SourceEvent::Begin { lsn: Lsn::new(lsn) },
        SourceEvent::Changes { changes },
        SourceEvent::Commit { lsn: Lsn::new(lsn) },
    ]
}
