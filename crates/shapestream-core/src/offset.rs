//! WAL positions and shape-log offsets.
//!
//! An [`Lsn`] is a 64-bit byte position in the Postgres WAL stream,
//! displayed in the native `X/Y` format. An [`Offset`] totally orders the
//! changes stored in a shape log as a `(txn_lsn, op_index)` pair and is
//! what downstream readers hand back when tailing a log.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Lsn
// ---------------------------------------------------------------------------

/// A Postgres Log Sequence Number.
///
/// Represents a byte offset in the write-ahead log. Commit LSNs are
/// monotonic over a replication stream, which is what makes them usable
/// as the major component of a shape-log [`Offset`].
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Lsn(u64);

impl Lsn {
    /// The zero LSN, before any WAL record.
    pub const ZERO: Lsn = Lsn(0);

    /// Creates an LSN from a raw 64-bit value.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Lsn(value)
    }

    /// Returns the raw 64-bit value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns the upper 32 bits (segment number).
    #[must_use]
    pub const fn segment(self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// Returns the lower 32 bits (offset within the segment).
    #[must_use]
    #[allow(clippy::cast_possible_truncation)] // extracts the lower 32 bits
    pub const fn offset(self) -> u32 {
        self.0 as u32
    }

    /// Returns `true` if this is the zero LSN.
    #[must_use]
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:X}", self.segment(), self.offset())
    }
}

impl FromStr for Lsn {
    type Err = OffsetParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (high, low) = s
            .split_once('/')
            .ok_or_else(|| OffsetParseError::InvalidLsn(s.to_string()))?;
        let high = u32::from_str_radix(high, 16)
            .map_err(|_| OffsetParseError::InvalidLsn(s.to_string()))?;
        let low = u32::from_str_radix(low, 16)
            .map_err(|_| OffsetParseError::InvalidLsn(s.to_string()))?;
        Ok(Lsn((u64::from(high) << 32) | u64::from(low)))
    }
}

impl From<u64> for Lsn {
    fn from(value: u64) -> Self {
        Lsn(value)
    }
}

impl From<Lsn> for u64 {
    fn from(lsn: Lsn) -> Self {
        lsn.0
    }
}

// ---------------------------------------------------------------------------
// Offset
// ---------------------------------------------------------------------------

/// Position of a single change within a shape log.
///
/// Orders first by the commit LSN of the containing transaction, then by
/// the operation's index within that transaction. The external encoding is
/// `"<txn_lsn>_<op_index>"` with the LSN as 16 zero-padded hex digits and
/// the index in decimal, so lexicographic order on encoded offsets matches
/// the logical order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Offset {
    /// Commit LSN of the transaction the change belongs to.
    pub lsn: Lsn,
    /// Index of the operation within its transaction.
    pub op_index: u64,
}

impl Offset {
    /// The zero offset, strictly less than any stored change.
    pub const ZERO: Offset = Offset {
        lsn: Lsn::ZERO,
        op_index: 0,
    };

    /// Creates an offset from an LSN and an operation index.
    #[must_use]
    pub const fn new(lsn: Lsn, op_index: u64) -> Self {
        Offset { lsn, op_index }
    }

    /// Returns `true` if this is the zero offset.
    #[must_use]
    pub const fn is_zero(self) -> bool {
        self.lsn.is_zero() && self.op_index == 0
    }
}

impl fmt::Display for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}_{}", self.lsn.as_u64(), self.op_index)
    }
}

impl FromStr for Offset {
    type Err = OffsetParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (lsn, index) = s
            .split_once('_')
            .ok_or_else(|| OffsetParseError::InvalidOffset(s.to_string()))?;
        if lsn.len() != 16 {
            return Err(OffsetParseError::InvalidOffset(s.to_string()));
        }
        let lsn = u64::from_str_radix(lsn, 16)
            .map_err(|_| OffsetParseError::InvalidOffset(s.to_string()))?;
        let op_index = index
            .parse::<u64>()
            .map_err(|_| OffsetParseError::InvalidOffset(s.to_string()))?;
        Ok(Offset::new(Lsn::new(lsn), op_index))
    }
}

/// Errors from parsing LSN or offset strings.
#[derive(Debug, Clone, thiserror::Error)]
pub enum OffsetParseError {
    /// The string is not a valid `X/Y` LSN.
    #[error("invalid LSN (expected X/Y): {0}")]
    InvalidLsn(String),

    /// The string is not a valid `<hex-lsn>_<index>` offset.
    #[error("invalid offset (expected 16-hex-lsn_index): {0}")]
    InvalidOffset(String),
}

// ===========================================================================
// Tests
// ===========================================================================
