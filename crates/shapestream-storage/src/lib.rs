//! # Shapestream Storage
//!
//! Durable backends for the sync service: the file-backed shape log
//! ([`FileShapeLog`]), a small persistent key-value store for service
//! metadata ([`PersistentKvStore`]), and the installation/instance
//! identity bootstrap ([`ServiceIdentity`]).

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod identity;
pub mod kv;
pub mod log;

pub use identity::ServiceIdentity;
pub use kv::{KvError, PersistentKvStore};
pub use log::FileShapeLog;
