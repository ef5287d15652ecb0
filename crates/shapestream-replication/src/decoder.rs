//! `pgoutput` logical replication message parser.
//!
//! Parses the binary messages the `pgoutput` plugin emits over the
//! replication connection (PG 10+) into [`PgMessage`] values. See the
//! protocol reference: "Logical Replication Message Formats"
//! (<https://www.postgresql.org/docs/current/protocol-logicalrep-message-formats.html>).

use shapestream_core::offset::Lsn;

// ---------------------------------------------------------------------------
// Message types
// ---------------------------------------------------------------------------

/// A decoded `pgoutput` message.
#[derive(Debug, Clone, PartialEq)]
pub enum PgMessage {
    /// Transaction begin.
    Begin {
        /// LSN of the transaction's commit record.
        final_lsn: Lsn,
        /// Commit timestamp, microseconds since the Postgres epoch.
        commit_ts_us: i64,
        /// Transaction ID.
        xid: u32,
    },
    /// Transaction commit.
    Commit {
        /// LSN of the commit record.
        commit_lsn: Lsn,
        /// End LSN of the transaction.
        end_lsn: Lsn,
        /// Commit timestamp, microseconds since the Postgres epoch.
        commit_ts_us: i64,
    },
    /// Relation (table) schema description.
    Relation(PgRelation),
    /// Row inserted.
    Insert {
        /// Relation OID.
        relation_oid: u32,
        /// New tuple.
        new: PgTuple,
    },
    /// Row updated.
    Update {
        /// Relation OID.
        relation_oid: u32,
        /// Old tuple, present under `REPLICA IDENTITY FULL` or when key
        /// columns changed.
        old: Option<PgTuple>,
        /// New tuple.
        new: PgTuple,
    },
    /// Row deleted.
    Delete {
        /// Relation OID.
        relation_oid: u32,
        /// Old tuple (key columns only unless identity is FULL).
        old: PgTuple,
    },
    /// Tables truncated.
    Truncate {
        /// OIDs of the truncated relations.
        relation_oids: Vec<u32>,
        /// Option bits (1 = CASCADE, 2 = RESTART IDENTITY).
        options: u8,
    },
    /// Replication origin marker.
    Origin {
        /// Origin commit LSN.
        lsn: Lsn,
        /// Origin name.
        name: String,
    },
    /// Custom type description.
    Type {
        /// Type OID.
        oid: u32,
        /// Namespace.
        namespace: String,
        /// Type name.
        name: String,
    },
}

/// Replica identity of a relation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaIdentity {
    /// Primary key columns (`d`).
    Default,
    /// No identity (`n`).
    Nothing,
    /// All columns (`f`).
    Full,
    /// A chosen unique index (`i`).
    Index,
}

/// A relation description from an `R` message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PgRelation {
    /// Relation OID.
    pub oid: u32,
    /// Schema (namespace) name.
    pub namespace: String,
    /// Table name.
    pub name: String,
    /// Replica identity setting.
    pub replica_identity: ReplicaIdentity,
    /// Columns in ordinal order.
    pub columns: Vec<PgRelationColumn>,
}

/// One column of a relation description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PgRelationColumn {
    /// Column name.
    pub name: String,
    /// Type OID.
    pub type_oid: u32,
    /// Whether the column is part of the replica identity.
    pub is_key: bool,
}

/// Column values of one tuple, in ordinal order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PgTuple(pub Vec<PgValue>);

/// A single column value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PgValue {
    /// SQL NULL.
    Null,
    /// Unchanged TOAST value, not resent by the server.
    Unchanged,
    /// Text-format value.
    Text(String),
}

/// Errors from the decoder.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DecodeError {
    /// The buffer ended before the expected value.
    #[error("unexpected end of message at byte {at}, need {need} more")]
    Eof {
        /// Read position.
        at: usize,
        /// Bytes still required.
        need: usize,
    },

    /// Unknown top-level message tag.
    #[error("unknown message type: 0x{0:02X}")]
    UnknownMessage(u8),

    /// Unknown tuple column kind byte.
    #[error("unknown tuple value kind: 0x{0:02X}")]
    UnknownValueKind(u8),

    /// A string field was not valid UTF-8.
    #[error("invalid UTF-8 at byte {0}")]
    InvalidUtf8(usize),
}

// ---------------------------------------------------------------------------
// decode
// ---------------------------------------------------------------------------

/// Decodes one `pgoutput` message from `data`.
///
/// # Errors
///
/// Fails on truncated, malformed, or unknown messages.
pub fn decode(data: &[u8]) -> Result<PgMessage, DecodeError> {
    let mut reader = Reader::new(data);
    let tag = reader.u8()?;
    match tag {
        b'B' => Ok(PgMessage::Begin {
            final_lsn: Lsn::new(reader.u64()?),
            commit_ts_us: reader.i64()?,
            xid: reader.u32()?,
        }),
        b'C' => {
            let _flags = reader.u8()?;
            Ok(PgMessage::Commit {
                commit_lsn: Lsn::new(reader.u64()?),
                end_lsn: Lsn::new(reader.u64()?),
                commit_ts_us: reader.i64()?,
            })
        }
        b'R' => {
            let oid = reader.u32()?;
            let namespace = reader.cstr()?;
            let name = reader.cstr()?;
            let replica_identity = match reader.u8()? {
                b'n' => ReplicaIdentity::Nothing,
                b'f' => ReplicaIdentity::Full,
                b'i' => ReplicaIdentity::Index,
                _ => ReplicaIdentity::Default,
            };
            let count = reader.i16()?;
            let mut columns = Vec::with_capacity(count.max(0) as usize);
            for _ in 0..count {
                let flags = reader.u8()?;
                columns.push(PgRelationColumn {
                    name: reader.cstr()?,
                    type_oid: reader.u32()?,
                    is_key: flags & 1 != 0,
                });
                let _type_modifier = reader.i32()?;
            }
            Ok(PgMessage::Relation(PgRelation {
                oid,
                namespace,
                name,
                replica_identity,
                columns,
            }))
        }
        b'I' => {
            let relation_oid = reader.u32()?;
            reader.expect(b'N')?;
            Ok(PgMessage::Insert {
                relation_oid,
                new: reader.tuple()?,
            })
        }
        b'U' => {
            let relation_oid = reader.u32()?;
            let mut old = None;
            let mut marker = reader.u8()?;
            if marker == b'K' || marker == b'O' {
                old = Some(reader.tuple()?);
                marker = reader.u8()?;
            }
            if marker != b'N' {
                return Err(DecodeError::UnknownValueKind(marker));
            }
            Ok(PgMessage::Update {
                relation_oid,
                old,
                new: reader.tuple()?,
            })
        }
        b'D' => {
            let relation_oid = reader.u32()?;
            let marker = reader.u8()?;
            if marker != b'K' && marker != b'O' {
                return Err(DecodeError::UnknownValueKind(marker));
            }
            Ok(PgMessage::Delete {
                relation_oid,
                old: reader.tuple()?,
            })
        }
        b'T' => {
            let count = reader.i32()?;
            let options = reader.u8()?;
            let mut relation_oids = Vec::with_capacity(count.max(0) as usize);
            for _ in 0..count {
                relation_oids.push(reader.u32()?);
            }
            Ok(PgMessage::Truncate {
                relation_oids,
                options,
            })
        }
        b'O' => Ok(PgMessage::Origin {
            lsn: Lsn::new(reader.u64()?),
            name: reader.cstr()?,
        }),
        b'Y' => Ok(PgMessage::Type {
            oid: reader.u32()?,
            namespace: reader.cstr()?,
            name: reader.cstr()?,
        }),
        other => Err(DecodeError::UnknownMessage(other)),
    }
}

// ---------------------------------------------------------------------------
// Reader
// ---------------------------------------------------------------------------

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if self.data.len() - self.pos < n {
            return Err(DecodeError::Eof {
                at: self.pos,
                need: n - (self.data.len() - self.pos),
            });
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    fn expect(&mut self, byte: u8) -> Result<(), DecodeError> {
        let got = self.u8()?;
        if got == byte {
            Ok(())
        } else {
            Err(DecodeError::UnknownValueKind(got))
        }
    }

    fn i16(&mut self) -> Result<i16, DecodeError> {
        Ok(i16::from_be_bytes(self.take(2)?.try_into().unwrap()))
    }

    fn i32(&mut self) -> Result<i32, DecodeError> {
        Ok(i32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn u32(&mut self) -> Result<u32, DecodeError> {
        Ok(u32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64, DecodeError> {
        Ok(u64::from_be_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn i64(&mut self) -> Result<i64, DecodeError> {
        Ok(i64::from_be_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn cstr(&mut self) -> Result<String, DecodeError> {
        let start = self.pos;
        let rest = &self.data[self.pos..];
        let end = rest.iter().position(|b| *b == 0).ok_or(DecodeError::Eof {
            at: self.data.len(),
            need: 1,
        })?;
        self.pos += end + 1;
        std::str::from_utf8(&rest[..end])
            .map(str::to_string)
            .map_err(|_| DecodeError::InvalidUtf8(start))
    }

    fn tuple(&mut self) -> Result<PgTuple, DecodeError> {
        let count = self.i16()?;
        let mut values = Vec::with_capacity(count.max(0) as usize);
        for _ in 0..count {
            let kind = self.u8()?;
            let value = match kind {
                b'n' => PgValue::Null,
                b'u' => PgValue::Unchanged,
                b't' => {
                    let len = self.i32()?.max(0) as usize;
                    let at = self.pos;
                    let bytes = self.take(len)?;
                    PgValue::Text(
                        std::str::from_utf8(bytes)
                            .map(str::to_string)
                            .map_err(|_| DecodeError::InvalidUtf8(at))?,
                    )
                }
                other => return Err(DecodeError::UnknownValueKind(other)),
            };
            values.push(value);
        }
        Ok(PgTuple(values))
    }
}

// ===========================================================================
// Tests
// ===========================================================================
