//! # Shapestream
//!
//! A Postgres logical-replication sync service: committed transactions
//! fan out to a dynamic set of *shapes* — client-visible, predicate-
//! defined views of single relations — each backed by a durable,
//! offset-ordered change log that downstream clients tail by offset.
//!
//! This crate wires the pieces together ([`SyncService`]); the moving
//! parts live in `shapestream-core` (dispatch and consumption),
//! `shapestream-storage` (durable logs and identity), and
//! `shapestream-replication` (Postgres ingress).

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod service;

pub use service::{ServiceConfig, ServiceError, SyncService};

pub use shapestream_core::{
    Change, ConsumerHandle, Lsn, Offset, PipelineConfig, Relation, Row, Shape, ShapeHandle,
    WriteUnit,
};
pub use shapestream_core::shape::predicate::{CompareOp, Literal, Predicate};
pub use shapestream_replication::{PgReplicationConfig, PgSource, ReplicationTransport};
pub use shapestream_storage::{FileShapeLog, ServiceIdentity};
