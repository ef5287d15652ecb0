//! Shape registry and supervisor.
//!
//! The registry owns the lifecycle of every shape: it resolves subquery
//! dependencies (the dependency graph must be a DAG; cycles are rejected
//! at creation), starts inner consumers and their materializers before
//! outer consumers, picks each consumer's write unit, and wires outer
//! consumers to inner materializers at the inner log's committed offset.

use std::collections::{HashMap, HashSet};

use tracing::{info, warn};

use crate::config::PipelineConfig;
use crate::consumer::{ConsumerError, ConsumerHandle, InnerMembership, ShapeConsumer};
use crate::dispatcher::{DispatcherError, DispatcherHandle, SubscriberId};
use crate::materializer::{Materializer, MaterializerError, MaterializerHandle};
use crate::offset::Offset;
use crate::shape::{Shape, ShapeDependency, ShapeHandle, WriteUnit};
use crate::storage::{ShapeLog, StorageError};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors from shape lifecycle operations.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// A subquery references a shape that is not registered.
    #[error("unknown dependency shape: {0}")]
    UnknownDependency(ShapeHandle),

    /// Creating the shape would close a dependency cycle.
    #[error("shape dependency cycle involving {0}")]
    DependencyCycle(ShapeHandle),

    /// The shape still has dependents and cannot be removed.
    #[error("shape {0} still has dependent shapes")]
    HasDependents(ShapeHandle),

    /// No such shape.
    #[error("shape {0} is not registered")]
    UnknownShape(ShapeHandle),

    /// Log creation or bootstrap failed.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Dispatcher interaction failed.
    #[error(transparent)]
    Dispatcher(#[from] DispatcherError),

    /// Consumer interaction failed.
    #[error(transparent)]
    Consumer(#[from] ConsumerError),

    /// Materializer interaction failed.
    #[error(transparent)]
    Materializer(#[from] MaterializerError),
}

// ---------------------------------------------------------------------------
// StateRegistry
// ---------------------------------------------------------------------------

/// Factory producing (or reopening) the log for a shape handle.
pub type LogFactory<S> = Box<dyn Fn(&ShapeHandle) -> Result<S, StorageError> + Send + Sync>;

struct ShapeRuntime<S> {
    shape: Shape,
    write_unit: WriteUnit,
    subscriber: SubscriberId,
    consumer: ConsumerHandle,
    task: tokio::task::JoinHandle<()>,
    /// Receives the log back when the consumer task stops, so restarts
    /// keep the shape's log instead of reopening from scratch.
    log_back: Option<tokio::sync::oneshot::Receiver<S>>,
    materializer: Option<MaterializerHandle>,
    mat_task: Option<tokio::task::JoinHandle<()>>,
    dependents: HashSet<ShapeHandle>,
}

/// Instantiates consumers and materializers and tracks shape
/// dependencies.
pub struct StateRegistry<S: ShapeLog> {
    dispatcher: DispatcherHandle,
    config: PipelineConfig,
    log_factory: LogFactory<S>,
    shapes: HashMap<ShapeHandle, ShapeRuntime<S>>,
    next_subscriber: u64,
}

impl<S: ShapeLog> StateRegistry<S> {
    /// Creates a registry over a running dispatcher. `log_factory` opens
    /// (or reopens) the durable log for a shape handle.
    #[must_use]
    pub fn new(
        dispatcher: DispatcherHandle,
        config: PipelineConfig,
        log_factory: LogFactory<S>,
    ) -> Self {
        Self {
            dispatcher,
            config,
            log_factory,
            shapes: HashMap::new(),
            next_subscriber: 1,
        }
    }

    /// Returns the number of registered shapes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shapes.len()
    }

    /// Returns `true` if no shape is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.shapes.is_empty()
    }

    /// Returns `true` if the handle is registered.
    #[must_use]
    pub fn contains(&self, handle: &ShapeHandle) -> bool {
        self.shapes.contains_key(handle)
    }

    /// Returns the consumer handle for a shape.
    #[must_use]
    pub fn consumer(&self, handle: &ShapeHandle) -> Option<&ConsumerHandle> {
        self.shapes.get(handle).map(|rt| &rt.consumer)
    }

    /// Returns the write unit a shape's consumer runs under.
    #[must_use]
    pub fn write_unit_of(&self, handle: &ShapeHandle) -> Option<WriteUnit> {
        self.shapes.get(handle).map(|rt| rt.write_unit)
    }

    /// Registers a shape and starts its consumer. Idempotent: creating a
    /// shape with an identical definition returns the existing handle.
    ///
    /// Dependencies must already be registered. Inner shapes gain a
    /// materializer on their first dependent, which restarts their
    /// consumer (the log is preserved).
    ///
    /// # Errors
    ///
    /// Fails on unknown dependencies, dependency cycles, or wiring
    /// failures.
    pub async fn create_shape(&mut self, shape: Shape) -> Result<ShapeHandle, StateError> {
        let handle = shape.handle();
        if self.shapes.contains_key(&handle) {
            return Ok(handle);
        }

        let deps = shape.shape_dependencies();
        for dep in &deps {
            if !self.shapes.contains_key(&dep.inner) {
                return Err(StateError::UnknownDependency(dep.inner.clone()));
            }
        }
        if self.would_cycle(&handle, &deps) {
            return Err(StateError::DependencyCycle(handle));
        }

        let write_unit = if deps.is_empty() {
            self.config.write_unit.unwrap_or(WriteUnit::TxnFragment)
        } else {
            WriteUnit::Txn
        };

        // Inner side first: materializers and their subscriptions must
        // exist before the outer consumer sees its first event.
        let mut memberships = Vec::new();
        for dep in &deps {
            let materializer = self.ensure_materializer(&dep.inner).await?;
            let inner_rt = &self.shapes[&dep.inner];
            let inner_shape = inner_rt.shape.clone();
            let from = inner_rt.consumer.latest_committed_offset().await?;
            let subscription = materializer.subscribe(from, &dep.inner_column).await?;
            memberships.push(InnerMembership::new(
                dep.clone(),
                inner_shape,
                materializer,
                subscription,
            ));
        }

        let log = (self.log_factory)(&handle)?;
        let (subscriber, consumer, log_back, task) = self
            .spawn_consumer(shape.clone(), write_unit, log, None, memberships)
            .await?;

        for dep in &deps {
            if let Some(inner_rt) = self.shapes.get_mut(&dep.inner) {
                inner_rt.dependents.insert(handle.clone());
            }
        }
        info!(shape = %handle, %write_unit, deps = deps.len(), "shape created");
        self.shapes.insert(
            handle.clone(),
            ShapeRuntime {
                shape,
                write_unit,
                subscriber,
                consumer,
                task,
                log_back: Some(log_back),
                materializer: None,
                mat_task: None,
                dependents: HashSet::new(),
            },
        );
        Ok(handle)
    }

    /// Removes a shape: cancels its subscription and stops its consumer
    /// and materializer. The log stays on disk for later GC.
    ///
    /// # Errors
    ///
    /// Fails when the shape is unknown or still has dependents.
    pub async fn remove_shape(&mut self, handle: &ShapeHandle) -> Result<(), StateError> {
        let Some(rt) = self.shapes.get(handle) else {
            return Err(StateError::UnknownShape(handle.clone()));
        };
        if !rt.dependents.is_empty() {
            return Err(StateError::HasDependents(handle.clone()));
        }
        let rt = self.shapes.remove(handle).expect("checked above");
        self.dispatcher.cancel(rt.subscriber);
        if let Err(err) = rt.consumer.shutdown().await {
            warn!(shape = %handle, %err, "consumer already gone at removal");
        }
        let _ = rt.task.await;
        if let Some(mat_task) = rt.mat_task {
            drop(rt.materializer);
            let _ = mat_task.await;
        }
        for dep in rt.shape.shape_dependencies() {
            if let Some(inner_rt) = self.shapes.get_mut(&dep.inner) {
                inner_rt.dependents.remove(handle);
            }
        }
        info!(shape = %handle, "shape removed");
        Ok(())
    }

    /// Stops every consumer and materializer, leaves logs in place.
    pub async fn shutdown(&mut self) {
        for (handle, rt) in self.shapes.drain() {
            self.dispatcher.cancel(rt.subscriber);
            if rt.consumer.shutdown().await.is_err() {
                warn!(shape = %handle, "consumer already gone at shutdown");
            }
            let _ = rt.task.await;
            if let Some(mat_task) = rt.mat_task {
                drop(rt.materializer);
                let _ = mat_task.await;
            }
        }
    }

    /// Returns the inner shape's materializer, creating it (and
    /// restarting the inner consumer with it attached) on first use.
    async fn ensure_materializer(
        &mut self,
        inner: &ShapeHandle,
    ) -> Result<MaterializerHandle, StateError> {
        let (shape, write_unit, old_subscriber, old_consumer, log_back) = {
            let rt = self
                .shapes
                .get_mut(inner)
                .ok_or_else(|| StateError::UnknownDependency(inner.clone()))?;
            if let Some(materializer) = &rt.materializer {
                return Ok(materializer.clone());
            }
            (
                rt.shape.clone(),
                rt.write_unit,
                rt.subscriber,
                rt.consumer.clone(),
                rt.log_back.take(),
            )
        };

        // The consumer restarts to pick up its materializer; its log is
        // preserved and replayed into the materialized row-set.
        info!(shape = %inner, "restarting inner consumer with materializer");
        self.dispatcher.cancel(old_subscriber);
        if let Err(err) = old_consumer.shutdown().await {
            warn!(shape = %inner, %err, "inner consumer already gone at restart");
        }
        let mut log = match log_back {
            Some(rx) => match rx.await {
                Ok(log) => log,
                Err(_) => (self.log_factory)(inner)?,
            },
            None => (self.log_factory)(inner)?,
        };

        let committed_lsn = log.latest_committed_offset().lsn;
        let mut entries = Vec::new();
        let mut from = Offset::ZERO;
        loop {
            let page = log.read(from, 4096)?;
            let Some(last) = page.last() else { break };
            from = last.offset;
            entries.extend(page);
        }
        let (mat_handle, mat_task) = Materializer::new(committed_lsn).bootstrap(&entries).spawn();

        let (subscriber, consumer, log_back, task) = self
            .spawn_consumer(shape, write_unit, log, Some(mat_handle.clone()), Vec::new())
            .await?;

        let rt = self.shapes.get_mut(inner).expect("present above");
        rt.subscriber = subscriber;
        rt.consumer = consumer;
        rt.task = task;
        rt.log_back = Some(log_back);
        rt.materializer = Some(mat_handle.clone());
        rt.mat_task = Some(mat_task);
        Ok(mat_handle)
    }

    /// Spawns a consumer task over `log` and subscribes it.
    async fn spawn_consumer(
        &mut self,
        shape: Shape,
        write_unit: WriteUnit,
        log: S,
        materializer: Option<MaterializerHandle>,
        memberships: Vec<InnerMembership>,
    ) -> Result<
        (
            SubscriberId,
            ConsumerHandle,
            tokio::sync::oneshot::Receiver<S>,
            tokio::task::JoinHandle<()>,
        ),
        StateError,
    > {
        let subscriber = SubscriberId(self.next_subscriber);
        self.next_subscriber += 1;

        let mut consumer = ShapeConsumer::new(
            subscriber,
            shape.clone(),
            write_unit,
            log,
            self.dispatcher.clone(),
            self.config.consumer_ack_timeout,
        );
        if let Some(materializer) = materializer {
            consumer = consumer.with_materializer(materializer);
        }
        for membership in memberships {
            consumer = consumer.with_inner_membership(membership);
        }
        let (handle, events_tx, log_back, task) = consumer.spawn();
        self.dispatcher.subscribe(subscriber, shape, events_tx).await?;
        Ok((subscriber, handle, log_back, task))
    }

    /// Returns `true` if adding a shape with these dependencies would
    /// close a cycle through the existing graph.
    fn would_cycle(&self, new: &ShapeHandle, deps: &[ShapeDependency]) -> bool {
        let mut stack: Vec<ShapeHandle> = deps.iter().map(|d| d.inner.clone()).collect();
        let mut seen = HashSet::new();
        while let Some(handle) = stack.pop() {
            if &handle == new {
                return true;
            }
            if !seen.insert(handle.clone()) {
                continue;
            }
            if let Some(rt) = self.shapes.get(&handle) {
                stack.extend(rt.shape.shape_dependencies().into_iter().map(|d| d.inner));
            }
        }
        false
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use tokio::sync::{mpsc, watch};

    use crate::change::{Change, Relation, Row, Transaction, TxnEvent};
    use crate::dispatcher::Dispatcher;
    use crate::offset::Lsn;
    use crate::shape::predicate::Predicate;
    use crate::storage::MemoryShapeLog;

    struct Pipeline {
        registry: StateRegistry<MemoryShapeLog>,
        dispatcher: DispatcherHandle,
        demand_rx: mpsc::Receiver<()>,
        _shutdown_tx: watch::Sender<bool>,
    }

    fn pipeline() -> Pipeline {
        let (demand_tx, demand_rx) = mpsc::channel(4);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (dispatcher, handle) = Dispatcher::new(demand_tx, shutdown_rx);
        tokio::spawn(dispatcher.run());
        let registry = StateRegistry::new(
            handle.clone(),
            PipelineConfig::default(),
            Box::new(|_| Ok(MemoryShapeLog::new())),
        );
        Pipeline {
            registry,
            dispatcher: handle,
            demand_rx,
            _shutdown_tx: shutdown_tx,
        }
    }

    fn users() -> Relation {
        Relation::new("public", "users")
    }

    fn teams() -> Relation {
        Relation::new("public", "teams")
    }

    #[tokio::test]
    async fn test_create_plain_shape_runs_fragment_mode() {
        let mut p = pipeline();
        let handle = p.registry.create_shape(Shape::new(users())).await.unwrap();
        assert!(p.registry.contains(&handle));
        assert_eq!(
            p.registry.write_unit_of(&handle),
            Some(WriteUnit::TxnFragment)
        );
        // First subscription grants initial demand.
        p.demand_rx.recv().await.unwrap();
    }

    #[tokio::test]
    async fn test_create_is_idempotent() {
        let mut p = pipeline();
        let a = p.registry.create_shape(Shape::new(users())).await.unwrap();
        let b = p.registry.create_shape(Shape::new(users())).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(p.registry.len(), 1);
    }

    #[tokio::test]
    async fn test_write_unit_override_applies_to_plain_shapes() {
        let (demand_tx, _demand_rx) = mpsc::channel(4);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let (dispatcher, handle) = Dispatcher::new(demand_tx, shutdown_rx);
        tokio::spawn(dispatcher.run());
        let mut registry: StateRegistry<MemoryShapeLog> = StateRegistry::new(
            handle,
            PipelineConfig {
                write_unit: Some(WriteUnit::Txn),
                ..PipelineConfig::default()
            },
            Box::new(|_| Ok(MemoryShapeLog::new())),
        );
        let h = registry.create_shape(Shape::new(users())).await.unwrap();
        assert_eq!(registry.write_unit_of(&h), Some(WriteUnit::Txn));
    }

    #[tokio::test]
    async fn test_unknown_dependency_rejected() {
        let mut p = pipeline();
        let ghost = ShapeHandle::new("feedfeedfeedfeed");
        let outer =
            Shape::new(users()).with_where(Predicate::in_shape("team_id", ghost.clone(), "id"));
        let err = p.registry.create_shape(outer).await.unwrap_err();
        assert!(matches!(err, StateError::UnknownDependency(h) if h == ghost));
    }

    #[tokio::test]
    async fn test_outer_shape_gets_txn_mode_and_inner_gets_materializer() {
        let mut p = pipeline();
        let inner = p.registry.create_shape(Shape::new(teams())).await.unwrap();
        p.demand_rx.recv().await.unwrap();

        let outer_shape =
            Shape::new(users()).with_where(Predicate::in_shape("team_id", inner.clone(), "id"));
        let outer = p.registry.create_shape(outer_shape).await.unwrap();

        assert_eq!(p.registry.write_unit_of(&outer), Some(WriteUnit::Txn));
        assert_eq!(
            p.registry.write_unit_of(&inner),
            Some(WriteUnit::TxnFragment)
        );
        assert!(p.registry.shapes[&inner].materializer.is_some());
        assert!(p.registry.shapes[&inner].dependents.contains(&outer));
    }

    #[tokio::test]
    async fn test_remove_with_dependents_rejected_then_cascade_order() {
        let mut p = pipeline();
        let inner = p.registry.create_shape(Shape::new(teams())).await.unwrap();
        p.demand_rx.recv().await.unwrap();
        let outer = p
            .registry
            .create_shape(
                Shape::new(users()).with_where(Predicate::in_shape("team_id", inner.clone(), "id")),
            )
            .await
            .unwrap();

        let err = p.registry.remove_shape(&inner).await.unwrap_err();
        assert!(matches!(err, StateError::HasDependents(_)));

        p.registry.remove_shape(&outer).await.unwrap();
        p.registry.remove_shape(&inner).await.unwrap();
        assert!(p.registry.is_empty());
    }

    #[tokio::test]
    async fn test_cycle_detection_walks_dependency_graph() {
        let mut p = pipeline();
        let a = p.registry.create_shape(Shape::new(teams())).await.unwrap();
        p.demand_rx.recv().await.unwrap();
        let b = p
            .registry
            .create_shape(
                Shape::new(users()).with_where(Predicate::in_shape("team_id", a.clone(), "id")),
            )
            .await
            .unwrap();

        // A hypothetical shape whose handle equals `a` and which depends
        // on `b` would close the cycle a -> b -> a.
        let dep = ShapeDependency {
            inner: b,
            outer_column: "x".into(),
            inner_column: "y".into(),
        };
        assert!(p.registry.would_cycle(&a, &[dep]));
    }

    #[tokio::test]
    async fn test_created_consumer_processes_events() {
        let mut p = pipeline();
        let handle = p.registry.create_shape(Shape::new(users())).await.unwrap();
        p.demand_rx.recv().await.unwrap();

        let txn = TxnEvent::Transaction(Arc::new(Transaction {
            lsn: Lsn::new(5),
            changes: vec![Change::Insert {
                relation: users(),
                new: Row::from_pairs([("id", Some("1"))]),
                op_index: 0,
            }],
        }));
        p.dispatcher.dispatch(txn);
        // The consumer acks after the durable write; demand returns.
        p.demand_rx.recv().await.unwrap();

        let consumer = p.registry.consumer(&handle).unwrap();
        let committed = consumer.latest_committed_offset().await.unwrap();
        assert_eq!(committed, Offset::new(Lsn::new(5), 0));
        let entries = consumer.read(Offset::ZERO, 10).await.unwrap();
        assert_eq!(entries.len(), 1);
    }
}
