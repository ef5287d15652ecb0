//! Service wiring: identity, dispatcher, collector, and shape registry.

use std::path::PathBuf;

use tokio::sync::{mpsc, watch};
use tracing::info;

use shapestream_core::collector::{LogCollector, ReplicationSource};
use shapestream_core::config::PipelineConfig;
use shapestream_core::consumer::ConsumerHandle;
use shapestream_core::dispatcher::{Dispatcher, DispatcherHandle};
use shapestream_core::shape::{Shape, ShapeHandle};
use shapestream_core::state::{LogFactory, StateError, StateRegistry};
use shapestream_core::storage::{MemoryShapeLog, ShapeLog, StorageError};
use shapestream_storage::identity::ServiceIdentity;
use shapestream_storage::kv::{KvError, PersistentKvStore};
use shapestream_storage::log::FileShapeLog;

// ---------------------------------------------------------------------------
// Config and errors
// ---------------------------------------------------------------------------

/// Top-level service configuration.
#[derive(Debug, Clone, Default)]
pub struct ServiceConfig {
    /// Pipeline tunables (write unit override, fragmentation threshold,
    /// consumer supervision timeout).
    pub pipeline: PipelineConfig,
    /// Root directory for shape logs and service metadata; `None` runs
    /// fully in memory.
    pub storage_dir: Option<PathBuf>,
}

/// Errors from service startup and shape management.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// Metadata store failure during identity bootstrap.
    #[error("identity bootstrap failed: {0}")]
    Identity(#[from] KvError),

    /// Storage failure.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Shape lifecycle failure.
    #[error(transparent)]
    State(#[from] StateError),
}

// ---------------------------------------------------------------------------
// SyncService
// ---------------------------------------------------------------------------

/// A running sync service: one replication pipeline and its shapes.
pub struct SyncService<S: ShapeLog> {
    identity: Option<ServiceIdentity>,
    registry: StateRegistry<S>,
    dispatcher: DispatcherHandle,
    shutdown: watch::Sender<bool>,
    dispatcher_task: tokio::task::JoinHandle<()>,
    collector_task: tokio::task::JoinHandle<()>,
}

impl SyncService<MemoryShapeLog> {
    /// Starts an in-memory service over a replication source. Logs and
    /// identity do not survive the process.
    #[must_use]
    pub fn in_memory<R>(pipeline: PipelineConfig, source: R) -> Self
    where
        R: ReplicationSource + 'static,
    {
        Self::start(pipeline, source, Box::new(|_| Ok(MemoryShapeLog::new())), None)
    }
}

impl SyncService<FileShapeLog> {
    /// Starts a durable service rooted at `storage_dir`: loads (or
    /// creates) the installation identity and opens per-shape logs under
    /// `shapes/<handle>/`.
    ///
    /// # Errors
    ///
    /// Fails when the storage directory or metadata store is unusable.
    pub fn open<R>(config: &ServiceConfig, source: R) -> Result<Self, ServiceError>
    where
        R: ReplicationSource + 'static,
    {
        let dir = config
            .storage_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from("./shapestream-data"));
        std::fs::create_dir_all(&dir).map_err(StorageError::from)?;

        let mut kv = PersistentKvStore::open(dir.join("meta.json"))?;
        let identity = ServiceIdentity::load_or_create(&mut kv)?;

        let shapes_dir = dir.join("shapes");
        let factory: LogFactory<FileShapeLog> = Box::new(move |handle: &ShapeHandle| {
            FileShapeLog::open(shapes_dir.join(handle.as_str()))
        });
        Ok(Self::start(
            config.pipeline.clone(),
            source,
            factory,
            Some(identity),
        ))
    }
}

impl<S: ShapeLog> SyncService<S> {
    fn start<R>(
        pipeline: PipelineConfig,
        source: R,
        log_factory: LogFactory<S>,
        identity: Option<ServiceIdentity>,
    ) -> Self
    where
        R: ReplicationSource + 'static,
    {
        let (demand_tx, demand_rx) = mpsc::channel(4);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let (dispatcher, handle) = Dispatcher::new(demand_tx, shutdown_rx);
        let dispatcher_task = tokio::spawn(dispatcher.run());

        let collector = LogCollector::new(
            source,
            handle.clone(),
            demand_rx,
            pipeline.max_fragment_changes,
        );
        let collector_task = tokio::spawn(collector.run());

        let registry = StateRegistry::new(handle.clone(), pipeline, log_factory);
        info!("sync service started");
        Self {
            identity,
            registry,
            dispatcher: handle,
            shutdown,
            dispatcher_task,
            collector_task,
        }
    }

    /// Returns the service identity (durable services only).
    #[must_use]
    pub fn identity(&self) -> Option<&ServiceIdentity> {
        self.identity.as_ref()
    }

    /// Returns the dispatcher handle.
    #[must_use]
    pub fn dispatcher(&self) -> &DispatcherHandle {
        &self.dispatcher
    }

    /// Registers a shape and starts its consumer.
    ///
    /// # Errors
    ///
    /// See [`StateRegistry::create_shape`].
    pub async fn create_shape(&mut self, shape: Shape) -> Result<ShapeHandle, ServiceError> {
        Ok(self.registry.create_shape(shape).await?)
    }

    /// Removes a shape, stopping its consumer; its log stays on disk.
    ///
    /// # Errors
    ///
    /// See [`StateRegistry::remove_shape`].
    pub async fn remove_shape(&mut self, handle: &ShapeHandle) -> Result<(), ServiceError> {
        Ok(self.registry.remove_shape(handle).await?)
    }

    /// Returns the reader handle for a shape's log.
    #[must_use]
    pub fn reader(&self, handle: &ShapeHandle) -> Option<ConsumerHandle> {
        self.registry.consumer(handle).cloned()
    }

    /// Returns the number of registered shapes.
    #[must_use]
    pub fn shape_count(&self) -> usize {
        self.registry.len()
    }

    /// Stops consumers, the dispatcher, and the collector. Logs and
    /// identity remain on disk.
    pub async fn shutdown(mut self) {
        self.registry.shutdown().await;
        let _ = self.shutdown.send(true);
        let _ = self.dispatcher_task.await;
        // The collector may be parked waiting on upstream traffic rather
        // than on demand; it holds no state worth draining.
        self.collector_task.abort();
        let _ = self.collector_task.await;
        info!("sync service stopped");
    }
}
