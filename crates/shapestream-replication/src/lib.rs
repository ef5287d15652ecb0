//! # Shapestream Replication
//!
//! Postgres logical-replication ingress: decodes the `pgoutput` stream,
//! assembles transactions against a relation cache, and exposes the
//! whole thing as the core's `ReplicationSource` with reconnect
//! backoff. The actual replication connection lives behind
//! [`ReplicationTransport`].

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod decoder;
pub mod source;
pub mod stream;

pub use config::PgReplicationConfig;
pub use decoder::{decode, DecodeError, PgMessage, PgRelation, PgTuple, PgValue, ReplicaIdentity};
pub use source::{PgSource, ReplicationTransport};
pub use stream::{RelationCache, StreamError, TxnAssembler};
