//! File-backed shape log.
//!
//! One directory per shape holds two files:
//!
//! - `log` — length-prefixed JSON entries in offset order. Appends go
//!   through a buffered writer and are only fsynced at commit time.
//! - `committed` — the committed watermark in the external offset
//!   encoding, replaced atomically (write-temp-then-rename) so readers
//!   never observe a torn watermark.
//!
//! Opening a log replays it: entries up to the watermark rebuild the
//! offset index, and any uncommitted tail (a crash mid-transaction) is
//! truncated away, which is what makes consumer replay idempotent.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use shapestream_core::offset::Offset;
use shapestream_core::storage::{LogEntry, ShapeLog, StorageError};

const LOG_FILE: &str = "log";
const COMMITTED_FILE: &str = "committed";

/// Durable append-only shape log.
pub struct FileShapeLog {
    dir: PathBuf,
    writer: BufWriter<File>,
    /// Byte position of the write head.
    position: u64,
    /// `(offset, byte position, encoded length)` per entry, in order.
    index: Vec<(Offset, u64, u32)>,
    latest: Offset,
    committed: Offset,
    /// Appends since the last fsync.
    dirty: bool,
}

impl FileShapeLog {
    /// Opens (or creates) the log in `dir`, replaying existing state.
    ///
    /// # Errors
    ///
    /// Fails on I/O errors or if committed data is corrupted.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StorageError> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let committed = read_watermark(&dir.join(COMMITTED_FILE))?;
        let log_path = dir.join(LOG_FILE);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&log_path)?;

        let (index, valid_len) = scan(&log_path, committed)?;
        let file_len = file.metadata()?.len();
        if valid_len < file_len {
            // Uncommitted tail from a crash mid-transaction; the whole
            // transaction replays from upstream.
            warn!(
                dir = %dir.display(),
                discarded = file_len - valid_len,
                "truncating uncommitted shape log tail"
            );
            file.set_len(valid_len)?;
        }

        let latest = index.last().map_or(Offset::ZERO, |(offset, _, _)| *offset);
        debug!(dir = %dir.display(), entries = index.len(), %latest, %committed, "shape log opened");
        Ok(Self {
            dir,
            writer: BufWriter::new(file),
            position: valid_len,
            index,
            latest,
            committed,
            dirty: false,
        })
    }

    /// Returns the directory this log lives in.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Returns the number of stored entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// Returns `true` if the log holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}

impl ShapeLog for FileShapeLog {
    fn append(&mut self, entries: Vec<LogEntry>) -> Result<Offset, StorageError> {
        for entry in entries {
            // Entries at or below the watermark are a crash replay of an
            // already-committed transaction; skip them.
            if entry.offset <= self.committed {
                continue;
            }
            if !self.latest.is_zero() && entry.offset <= self.latest {
                return Err(StorageError::OffsetRegression {
                    attempted: entry.offset,
                    latest: self.latest,
                });
            }
            let bytes = serde_json::to_vec(&entry)
                .map_err(|e| StorageError::Serialization(e.to_string()))?;
            #[allow(clippy::cast_possible_truncation)] // single entries stay far below 4 GiB
            let len = bytes.len() as u32;
            self.writer.write_all(&len.to_le_bytes())?;
            self.writer.write_all(&bytes)?;
            self.index.push((entry.offset, self.position, len));
            self.position += 4 + u64::from(len);
            self.latest = entry.offset;
            self.dirty = true;
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
        if upto <= self.committed {
            return Ok(());
        }
        if self.dirty {
            self.writer.flush()?;
            self.writer.get_ref().sync_all()?;
            self.dirty = false;
        }
        write_watermark(&self.dir, upto)?;
        self.committed = upto;
        Ok(())
    }

    fn latest_offset(&self) -> Offset {
        self.latest
    }

    fn latest_committed_offset(&self) -> Offset {
        self.committed
    }

    fn read(&mut self, from: Offset, max: usize) -> Result<Vec<LogEntry>, StorageError> {
        // Only the committed prefix is served, and commit flushed it.
        let start = self.index.partition_point(|(offset, _, _)| *offset <= from);
        let mut reader = BufReader::new(File::open(self.dir.join(LOG_FILE))?);
        let mut out = Vec::new();
        for (offset, position, len) in self.index.iter().skip(start) {
            if *offset > self.committed || out.len() >= max {
                break;
            }
            reader.seek(SeekFrom::Start(position + 4))?;
            let mut bytes = vec![0u8; *len as usize];
            reader.read_exact(&mut bytes)?;
            let entry: LogEntry = serde_json::from_slice(&bytes)
                .map_err(|e| StorageError::Serialization(e.to_string()))?;
            out.push(entry);
        }
        Ok(out)
    }
}

/// Reads the committed watermark sidecar; `Offset::ZERO` if absent.
fn read_watermark(path: &Path) -> Result<Offset, StorageError> {
    match std::fs::read_to_string(path) {
        Ok(text) => text
            .trim()
            .parse()
            .map_err(|_| StorageError::Serialization(format!("bad watermark: {text}"))),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Offset::ZERO),
        Err(err) => Err(err.into()),
    }
}

/// Replaces the committed watermark atomically.
fn write_watermark(dir: &Path, offset: Offset) -> Result<(), StorageError> {
    let tmp = dir.join(format!("{COMMITTED_FILE}.tmp"));
    let mut file = File::create(&tmp)?;
    file.write_all(offset.to_string().as_bytes())?;
    file.sync_all()?;
    std::fs::rename(&tmp, dir.join(COMMITTED_FILE))?;
    Ok(())
}

/// Scans the log file, returning the offset index of entries at or
/// before the watermark plus the byte length of that committed prefix.
///
/// Torn data beyond the watermark is a crash artifact and is excluded;
/// a watermark pointing past the readable entries means the committed
/// prefix itself is damaged.
fn scan(path: &Path, committed: Offset) -> Result<(Vec<(Offset, u64, u32)>, u64), StorageError> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut index = Vec::new();
    let mut position = 0u64;
    let mut valid_len = 0u64;

    loop {
        let mut len_bytes = [0u8; 4];
        match reader.read_exact(&mut len_bytes) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(err) => return Err(err.into()),
        }
        let len = u32::from_le_bytes(len_bytes);
        let mut bytes = vec![0u8; len as usize];
        if let Err(err) = reader.read_exact(&mut bytes) {
            if err.kind() == std::io::ErrorKind::UnexpectedEof {
                break;
            }
            return Err(err.into());
        }
        let Ok(entry) = serde_json::from_slice::<LogEntry>(&bytes) else {
            break;
        };
        index.push((entry.offset, position, len));
        position += 4 + u64::from(len);
        if entry.offset <= committed {
            valid_len = position;
        }
    }

    let last_committed = index
        .iter()
        .rev()
        .map(|(offset, _, _)| *offset)
        .find(|offset| *offset <= committed)
        .unwrap_or(Offset::ZERO);
    if last_committed < committed {
        return Err(StorageError::Corrupted(position));
    }

    index.retain(|(offset, _, _)| *offset <= committed);
    Ok((index, valid_len))
}

// ===========================================================================
// Tests
// ===========================================================================
