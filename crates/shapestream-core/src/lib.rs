//! # Shapestream Core
//!
//! The shape dispatch and consumption core of a Postgres
//! logical-replication sync service: a single replication producer fans
//! committed transactions out to a dynamic set of shape consumers, each
//! maintaining a durable, offset-ordered change log that clients tail.
//!
//! Pipeline:
//!
//! ```text
//! Postgres ──► LogCollector ──► Dispatcher ──► ShapeConsumer ──► ShapeLog
//!                 (demand)       (filter,        (write unit,      (offset-
//!                                 partitions)     conversion)       ordered)
//!                                                    │
//!                                                    ▼
//!                                               Materializer ──► outer consumers
//! ```
//!
//! The dispatcher asks the producer for the next event only after every
//! consumer that received the current one has acknowledged it, so the
//! slowest consumer's backpressure reaches Postgres and in-flight memory
//! stays bounded.

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod change;
pub mod collector;
pub mod config;
pub mod consumer;
pub mod dispatcher;
pub mod filter;
pub mod materializer;
pub mod offset;
pub mod partitions;
pub mod shape;
pub mod state;
pub mod storage;
pub mod testing;

pub use change::{Change, Relation, Row, Transaction, TxnEvent, TxnFragment};
pub use collector::{LogCollector, ReplicationError, ReplicationSource, SourceEvent};
pub use config::PipelineConfig;
pub use consumer::{ConsumerError, ConsumerHandle, ShapeConsumer};
pub use dispatcher::{Dispatcher, DispatcherError, DispatcherHandle, SubscriberId};
pub use materializer::{Materializer, MaterializerError, MaterializerHandle};
pub use offset::{Lsn, Offset};
pub use shape::{Shape, ShapeHandle, WriteUnit};
pub use state::{StateError, StateRegistry};
pub use storage::{LogEntry, LogOp, MemoryShapeLog, ShapeLog, StorageError};

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type aggregating the core's failure modes.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Dispatcher-level error.
    #[error("dispatcher error: {0}")]
    Dispatcher(#[from] dispatcher::DispatcherError),

    /// Shape-log storage error.
    #[error("storage error: {0}")]
    Storage(#[from] storage::StorageError),

    /// Consumer error.
    #[error("consumer error: {0}")]
    Consumer(#[from] consumer::ConsumerError),

    /// Materializer error.
    #[error("materializer error: {0}")]
    Materializer(#[from] materializer::MaterializerError),

    /// Shape lifecycle error.
    #[error("state error: {0}")]
    State(#[from] state::StateError),

    /// Replication-stream error.
    #[error("replication error: {0}")]
    Replication(#[from] collector::ReplicationError),
}
