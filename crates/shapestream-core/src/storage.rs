//! The shape-log storage contract.
//!
//! Each shape owns one append-only log of [`LogEntry`] values keyed by
//! [`Offset`]. Appends advance `latest_offset`; the committed watermark
//! advances separately and atomically via [`ShapeLog::commit`], so
//! readers never observe a partially applied transaction.
//!
//! [`MemoryShapeLog`] is the in-process implementation used by tests and
//! ephemeral shapes; the durable file-backed implementation lives in the
//! storage crate.

use serde::{Deserialize, Serialize};

use crate::offset::Offset;

// ---------------------------------------------------------------------------
// LogEntry
// ---------------------------------------------------------------------------

/// Operation recorded in a shape log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogOp {
    /// Row entered the shape.
    Insert,
    /// Row changed while staying in the shape.
    Update,
    /// Row left the shape.
    Delete,
    /// The whole relation was truncated.
    Truncate,
}

impl LogOp {
    /// Returns the wire name of the operation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            LogOp::Insert => "insert",
            LogOp::Update => "update",
            LogOp::Delete => "delete",
            LogOp::Truncate => "truncate",
        }
    }
}

/// One stored change in a shape log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Position of the change.
    pub offset: Offset,
    /// Stable record key (`"schema"."table"/"pk"...`).
    pub key: String,
    /// Operation kind.
    pub op: LogOp,
    /// New row as a flat JSON object (inserts and updates).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
    /// Old row as a flat JSON object (updates and deletes, when known).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old_value: Option<serde_json::Value>,
}

// ---------------------------------------------------------------------------
// StorageError
// ---------------------------------------------------------------------------

/// Errors from shape-log operations.
///
/// Append failures are fatal to the owning consumer: it crashes and is
/// restarted against the log, replaying from the committed watermark.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Underlying I/O failure.
    #[error("shape log I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Entry could not be serialized or deserialized.
    #[error("shape log serialization error: {0}")]
    Serialization(String),

    /// An append would not advance the log.
    #[error("offset regression: appending {attempted} after {latest}")]
    OffsetRegression {
        /// Offset of the rejected entry.
        attempted: Offset,
        /// Current latest offset.
        latest: Offset,
    },

    /// A commit watermark beyond the appended head was requested.
    #[error("cannot commit {requested} beyond latest appended {latest}")]
    CommitBeyondAppended {
        /// Requested watermark.
        requested: Offset,
        /// Current latest offset.
        latest: Offset,
    },

    /// Stored data failed validation on open.
    #[error("corrupted shape log at byte {0}")]
    Corrupted(u64),
}

// ---------------------------------------------------------------------------
// ShapeLog
// ---------------------------------------------------------------------------

/// Append-only per-shape change log with an atomic committed watermark.
pub trait ShapeLog: Send + 'static {
    /// Appends entries, which must carry strictly increasing offsets.
    /// Returns the new latest offset. Does not move the committed
    /// watermark.
    ///
    /// # Errors
    ///
    /// Fails on I/O errors or if an entry's offset does not advance the
    /// log.
    fn append(&mut self, entries: Vec<LogEntry>) -> Result<Offset, StorageError>;

    /// Atomically advances the committed watermark to `upto`. Idempotent;
    /// a watermark at or before the current one is a no-op.
    ///
    /// # Errors
    ///
    /// Fails on I/O errors or if `upto` is beyond the appended head.
    fn commit(&mut self, upto: Offset) -> Result<(), StorageError>;

    /// Returns the offset of the last appended entry.
    fn latest_offset(&self) -> Offset;

    /// Returns the committed watermark.
    fn latest_committed_offset(&self) -> Offset;

    /// Reads up to `max` committed entries with offsets strictly greater
    /// than `from`, in offset order. Readers page through the log by
    /// passing the last offset they saw, which also makes interrupted
    /// reads restartable.
    ///
    /// # Errors
    ///
    /// Fails on I/O or deserialization errors.
    fn read(&mut self, from: Offset, max: usize) -> Result<Vec<LogEntry>, StorageError>;
}

// ---------------------------------------------------------------------------
// MemoryShapeLog
// ---------------------------------------------------------------------------

/// In-memory shape log.
#[derive(Debug, Default)]
pub struct MemoryShapeLog {
    entries: Vec<LogEntry>,
    latest: Offset,
    committed: Offset,
}

impl MemoryShapeLog {
    /// Creates an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the total number of stored entries, committed or not.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if nothing has been appended.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl ShapeLog for MemoryShapeLog {
    fn append(&mut self, entries: Vec<LogEntry>) -> Result<Offset, StorageError> {
        for entry in entries {
            // A replayed transaction re-delivers entries the committed
            // watermark already covers; dropping them is what makes
            // crash replay idempotent.
            if entry.offset <= self.committed {
                continue;
            }
            if !self.latest.is_zero() && entry.offset <= self.latest {
                return Err(StorageError::OffsetRegression {
                    attempted: entry.offset,
                    latest: self.latest,
                });
            }
            self.latest = entry.offset;
            self.entries.push(entry);
        }
        Ok(self.latest)
    }

    fn commit(&mut self, upto: Offset) -> Result<(), StorageError> {
        if upto > self.latest {
            return Err(StorageError::CommitBeyondAppended {
                requested: upto,
                latest: self.latest,
            });
        }
        if upto > self.committed {
            self.committed = upto;
        }
        Ok(())
    }

    fn latest_offset(&self) -> Offset {
        self.latest
    }

    fn latest_committed_offset(&self) -> Offset {
        self.committed
    }

    fn read(&mut self, from: Offset, max: usize) -> Result<Vec<LogEntry>, StorageError> {
        let committed = self.committed;
        Ok(self
            .entries
            .iter()
            .filter(|e| e.offset > from && e.offset <= committed)
            .take(max)
            .cloned()
            .collect())
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::offset::Lsn;

    fn entry(lsn: u64, index: u64) -> LogEntry {
        LogEntry {
            offset: Offset::new(Lsn::new(lsn), index),
            key: format!("\"public\".\"t\"/\"{index}\""),
            op: LogOp::Insert,
            value: Some(serde_json::json!({ "id": index.to_string() })),
            old_value: None,
        }
    }

    #[test]
    fn test_append_advances_latest_only() {
        let mut log = MemoryShapeLog::new();
        let latest = log.append(vec![entry(1, 0), entry(1, 1)]).unwrap();
        assert_eq!(latest, Offset::new(Lsn::new(1), 1));
        assert_eq!(log.latest_offset(), latest);
        assert_eq!(log.latest_committed_offset(), Offset::ZERO);
    }

    #[test]
    fn test_append_rejects_regression() {
        let mut log = MemoryShapeLog::new();
        log.append(vec![entry(2, 0)]).unwrap();
        let err = log.append(vec![entry(1, 5)]).unwrap_err();
        assert!(matches!(err, StorageError::OffsetRegression { .. }));
    }

    #[test]
    fn test_replayed_committed_entries_skipped() {
        let mut log = MemoryShapeLog::new();
        log.append(vec![entry(1, 0), entry(1, 1)]).unwrap();
        log.commit(Offset::new(Lsn::new(1), 1)).unwrap();

        // Crash replay re-delivers the whole transaction plus the next.
        log.append(vec![entry(1, 0), entry(1, 1), entry(2, 0)]).unwrap();
        assert_eq!(log.len(), 3);
        assert_eq!(log.latest_offset(), Offset::new(Lsn::new(2), 0));
    }

    #[test]
    fn test_commit_is_idempotent_and_monotonic() {
        let mut log = MemoryShapeLog::new();
        log.append(vec![entry(1, 0), entry(2, 0)]).unwrap();

        log.commit(Offset::new(Lsn::new(2), 0)).unwrap();
        assert_eq!(log.latest_committed_offset(), Offset::new(Lsn::new(2), 0));

        // Re-committing the same or an earlier watermark changes nothing.
        log.commit(Offset::new(Lsn::new(2), 0)).unwrap();
        log.commit(Offset::new(Lsn::new(1), 0)).unwrap();
        assert_eq!(log.latest_committed_offset(), Offset::new(Lsn::new(2), 0));
    }

    #[test]
    fn test_commit_beyond_appended_rejected() {
        let mut log = MemoryShapeLog::new();
        log.append(vec![entry(1, 0)]).unwrap();
        let err = log.commit(Offset::new(Lsn::new(9), 0)).unwrap_err();
        assert!(matches!(err, StorageError::CommitBeyondAppended { .. }));
    }

    #[test]
    fn test_read_is_bounded_by_committed_watermark() {
        let mut log = MemoryShapeLog::new();
        log.append(vec![entry(1, 0), entry(1, 1), entry(2, 0)]).unwrap();
        log.commit(Offset::new(Lsn::new(1), 1)).unwrap();

        // The uncommitted tail at lsn 2 is invisible.
        let entries = log.read(Offset::ZERO, 100).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].offset, Offset::new(Lsn::new(1), 1));
    }

    #[test]
    fn test_read_pages_from_offset() {
        let mut log = MemoryShapeLog::new();
        log.append((0..5).map(|i| entry(1, i)).collect()).unwrap();
        log.commit(Offset::new(Lsn::new(1), 4)).unwrap();

        let first = log.read(Offset::ZERO, 2).unwrap();
        assert_eq!(first.len(), 2);
        let rest = log.read(first.last().unwrap().offset, 100).unwrap();
        assert_eq!(rest.len(), 3);
        assert!(rest.iter().all(|e| e.offset > first[1].offset));
    }
}
