//! Demand-coupled fan-out from the replication producer to shape consumers.
//!
//! The dispatcher sits between the single event producer and a dynamic
//! set of shape consumers and enforces one invariant: the producer is
//! asked for the next event only after **every** consumer that received
//! the current event has acknowledged it. Backpressure from the slowest
//! affected consumer therefore reaches all the way upstream, capping the
//! number of in-flight events at one.
//!
//! [`DispatcherCore`] is the synchronous state machine (`subscribe`,
//! `ask`, `dispatch`, `cancel`); [`Dispatcher`] wraps it in a task that
//! owns an unbounded mailbox and grants demand units to the producer over
//! a channel. Consumers receive events over capacity-1 channels and
//! acknowledge by sending `ask` back to the mailbox.
//!
//! # The zero-match rule
//!
//! When an event affects no subscriber the demand loop must still close.
//! The core then parks an arbitrary subscriber in `pending` and the task
//! re-enqueues a synthetic `ask` from it, so demand is regenerated
//! through the ordinary acknowledgement path and the producer never
//! stalls.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, warn};

use crate::change::{Change, TxnEvent, TxnFragment};
use crate::filter::Filter;
use crate::partitions::Partitions;
use crate::shape::Shape;

// ---------------------------------------------------------------------------
// SubscriberId and Demand
// ---------------------------------------------------------------------------

/// Opaque token identifying a subscriber to the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(pub u64);

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Units of demand owed to the upstream producer; one unit buys exactly
/// one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Demand(pub u32);

impl Demand {
    /// No demand.
    pub const NONE: Demand = Demand(0);
    /// One event's worth of demand.
    pub const ONE: Demand = Demand(1);
}

/// Errors surfaced by dispatcher operations.
#[derive(Debug, thiserror::Error)]
pub enum DispatcherError {
    /// The process already holds a subscription.
    #[error("already subscribed")]
    AlreadySubscribed,

    /// The dispatcher task is gone.
    #[error("dispatcher is not running")]
    Closed,
}

// ---------------------------------------------------------------------------
// DispatcherMetrics
// ---------------------------------------------------------------------------

/// Atomic counters for monitoring the dispatcher.
#[derive(Debug, Default)]
pub struct DispatcherMetrics {
    /// Events accepted from the producer.
    pub events_dispatched: AtomicU64,
    /// Per-subscriber deliveries.
    pub deliveries: AtomicU64,
    /// Zero-match events closed via a synthetic self-ack.
    pub synthetic_acks: AtomicU64,
    /// Demand units granted upstream.
    pub demands_granted: AtomicU64,
    /// Subscribers removed (explicit cancel or dead channel).
    pub cancels: AtomicU64,
}

impl DispatcherMetrics {
    /// Returns events accepted from the producer.
    #[must_use]
    pub fn events_dispatched(&self) -> u64 {
        self.events_dispatched.load(Ordering::Relaxed)
    }

    /// Returns per-subscriber deliveries.
    #[must_use]
    pub fn deliveries(&self) -> u64 {
        self.deliveries.load(Ordering::Relaxed)
    }

    /// Returns zero-match events closed synthetically.
    #[must_use]
    pub fn synthetic_acks(&self) -> u64 {
        self.synthetic_acks.load(Ordering::Relaxed)
    }

    /// Returns demand units granted upstream.
    #[must_use]
    pub fn demands_granted(&self) -> u64 {
        self.demands_granted.load(Ordering::Relaxed)
    }

    /// Returns subscribers removed.
    #[must_use]
    pub fn cancels(&self) -> u64 {
        self.cancels.load(Ordering::Relaxed)
    }
}

// ---------------------------------------------------------------------------
// DispatcherCore
// ---------------------------------------------------------------------------

/// Outcome of a [`DispatcherCore::dispatch`] call, telling the task what
/// closes the demand loop for this event.
#[derive(Debug, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Real deliveries happened; acknowledgements will drive demand.
    AwaitingAcks,
    /// Nothing matched; the caller must re-enqueue `ask` from this
    /// subscriber so demand regenerates through the normal path.
    SyntheticAck(SubscriberId),
    /// No subscribers exist at all; demand returns immediately.
    Immediate(Demand),
}

/// The dispatcher's synchronous state machine.
pub struct DispatcherCore {
    /// Outstanding acknowledgements for the in-flight event.
    waiting: usize,
    /// Subscribers that received the in-flight event and have not acked.
    pending: HashSet<SubscriberId>,
    /// Subscription order; the head is the zero-match pick.
    order: Vec<SubscriberId>,
    /// Delivery channels, capacity 1 by contract.
    senders: HashMap<SubscriberId, mpsc::Sender<TxnEvent>>,
    /// Subscribers seen so far, for duplicate-subscription rejection.
    pids: HashSet<SubscriberId>,
    /// Subscribers that received any fragment of the in-flight
    /// transaction; the commit marker is routed to exactly these.
    txn_participants: HashSet<SubscriberId>,
    /// Whether the single circulating demand unit has been minted.
    /// Exactly one unit exists once the first subscriber ever arrives;
    /// after that, demand only regenerates through acks and cancels.
    started: bool,
    filter: Filter,
    partitions: Partitions,
    metrics: Arc<DispatcherMetrics>,
}

impl DispatcherCore {
    /// Creates an empty dispatcher state machine.
    #[must_use]
    pub fn new() -> Self {
        Self {
            waiting: 0,
            pending: HashSet::new(),
            order: Vec::new(),
            senders: HashMap::new(),
            pids: HashSet::new(),
            txn_participants: HashSet::new(),
            started: false,
            filter: Filter::new(),
            partitions: Partitions::new(),
            metrics: Arc::new(DispatcherMetrics::default()),
        }
    }

    /// Returns the shared metrics handle.
    #[must_use]
    pub fn metrics(&self) -> Arc<DispatcherMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Returns the number of active subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.order.len()
    }

    /// Returns the count of outstanding acknowledgements.
    #[must_use]
    pub fn waiting(&self) -> usize {
        self.waiting
    }

    /// Registers a subscriber. The first subscriber grants one unit of
    /// initial demand so the producer starts pulling.
    ///
    /// # Errors
    ///
    /// Rejects a second subscription from the same subscriber.
    pub fn subscribe(
        &mut self,
        subscriber: SubscriberId,
        shape: Shape,
        sender: mpsc::Sender<TxnEvent>,
    ) -> Result<Demand, DispatcherError> {
        if !self.pids.insert(subscriber) {
            return Err(DispatcherError::AlreadySubscribed);
        }
        self.partitions.add_shape(shape.relation());
        self.filter.add_shape(subscriber, shape);
        self.senders.insert(subscriber, sender);
        self.order.push(subscriber);
        debug!(%subscriber, total = self.order.len(), "subscriber added");
        if self.started {
            Ok(Demand::NONE)
        } else {
            self.started = true;
            Ok(Demand::ONE)
        }
    }

    /// Processes an acknowledgement from a consumer.
    ///
    /// Duplicate or premature acknowledgements (`waiting == 0`, or a
    /// sender not in `pending`) are ignored and generate no demand. The
    /// final outstanding acknowledgement clears `pending` and returns one
    /// unit of upstream demand.
    pub fn ask(&mut self, from: SubscriberId) -> Demand {
        if self.waiting == 0 {
            return Demand::NONE;
        }
        if self.waiting == 1 {
            if self.pending.contains(&from) {
                self.pending.clear();
                self.waiting = 0;
                return Demand::ONE;
            }
            return Demand::NONE;
        }
        if self.pending.remove(&from) {
            self.waiting -= 1;
        }
        Demand::NONE
    }

    /// Fans one event out to the affected subscribers.
    ///
    /// Applies partition rewriting, computes the affected set, delivers,
    /// and arms the `waiting`/`pending` ledger. Must only be called when
    /// no event is in flight (`waiting == 0`).
    pub fn dispatch(&mut self, event: TxnEvent) -> DispatchOutcome {
        debug_assert_eq!(self.waiting, 0, "dispatch while an event is in flight");
        self.metrics.events_dispatched.fetch_add(1, Ordering::Relaxed);

        let (event, affected) = match event {
            TxnEvent::Fragment(fragment) => {
                let (changes, affected) = self.route_changes(&fragment.changes);
                self.txn_participants.extend(affected.iter().copied());
                let event = match changes {
                    Some(changes) => TxnEvent::Fragment(Arc::new(TxnFragment {
                        lsn: fragment.lsn,
                        changes,
                    })),
                    None => TxnEvent::Fragment(fragment),
                };
                (event, affected)
            }
            TxnEvent::Transaction(txn) => {
                let (changes, affected) = self.route_changes(&txn.changes);
                let event = match changes {
                    Some(changes) => TxnEvent::Transaction(Arc::new(crate::change::Transaction {
                        lsn: txn.lsn,
                        changes,
                    })),
                    None => TxnEvent::Transaction(txn),
                };
                (event, affected)
            }
            TxnEvent::Commit { lsn } => {
                let affected = std::mem::take(&mut self.txn_participants);
                (TxnEvent::Commit { lsn }, affected)
            }
        };

        let mut delivered = HashSet::new();
        let mut dead = Vec::new();
        for id in affected {
            let Some(sender) = self.senders.get(&id) else {
                continue;
            };
            match sender.try_send(event.clone()) {
                Ok(()) => {
                    self.metrics.deliveries.fetch_add(1, Ordering::Relaxed);
                    delivered.insert(id);
                }
                Err(err) => {
                    warn!(subscriber = %id, %err, "dropping unreachable subscriber");
                    dead.push(id);
                }
            }
        }
        for id in dead {
            // Not yet pending for this event, so no demand can be owed.
            let _ = self.cancel(id);
        }

        if delivered.is_empty() {
            let Some(&chosen) = self.order.first() else {
                return DispatchOutcome::Immediate(Demand::ONE);
            };
            self.waiting = 1;
            self.pending = HashSet::from([chosen]);
            self.metrics.synthetic_acks.fetch_add(1, Ordering::Relaxed);
            return DispatchOutcome::SyntheticAck(chosen);
        }

        self.waiting = delivered.len();
        self.pending = delivered;
        DispatchOutcome::AwaitingAcks
    }

    /// Removes a subscriber. If it still owed an acknowledgement for the
    /// in-flight event, the ledger shrinks, and the last removal releases
    /// the demand unit the acknowledgement would have produced.
    pub fn cancel(&mut self, from: SubscriberId) -> Demand {
        if !self.pids.remove(&from) {
            return Demand::NONE;
        }
        self.metrics.cancels.fetch_add(1, Ordering::Relaxed);
        self.order.retain(|id| *id != from);
        self.senders.remove(&from);
        self.txn_participants.remove(&from);
        if let Some(shape) = self.filter.remove_shape(from) {
            self.partitions.remove_shape(shape.relation());
        }
        if self.pending.remove(&from) {
            self.waiting -= 1;
            if self.waiting == 0 {
                return Demand::ONE;
            }
        }
        Demand::NONE
    }

    /// Rewrites changes through the partition index and computes the
    /// union of affected subscribers. Returns `Some(changes)` only when a
    /// rewrite actually happened, so unmodified payloads keep their
    /// original `Arc`.
    fn route_changes(&mut self, changes: &[Change]) -> (Option<Vec<Change>>, HashSet<SubscriberId>) {
        for change in changes {
            if let Change::Relation(sc) = change {
                self.partitions.observe(sc);
            }
        }

        let mut rewritten: Option<Vec<Change>> = None;
        let mut affected = HashSet::new();
        for (i, change) in changes.iter().enumerate() {
            let routed = self.partitions.handle_change(change);
            let effective = routed.as_ref().unwrap_or(change);
            affected.extend(self.filter.affected_shapes(effective));
            if let Some(routed) = routed {
                rewritten
                    .get_or_insert_with(|| changes[..i].to_vec())
                    .push(routed);
            } else if let Some(out) = rewritten.as_mut() {
                out.push(change.clone());
            }
        }
        (rewritten, affected)
    }
}

impl Default for DispatcherCore {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Dispatcher task
// ---------------------------------------------------------------------------

/// Mailbox messages for the dispatcher task.
enum DispatcherMsg {
    Subscribe {
        subscriber: SubscriberId,
        shape: Shape,
        sender: mpsc::Sender<TxnEvent>,
        reply: oneshot::Sender<Result<(), DispatcherError>>,
    },
    Ask {
        from: SubscriberId,
    },
    Cancel {
        from: SubscriberId,
    },
    Dispatch(TxnEvent),
}

/// Cloneable handle for talking to a running [`Dispatcher`] task.
#[derive(Clone)]
pub struct DispatcherHandle {
    tx: mpsc::UnboundedSender<DispatcherMsg>,
    metrics: Arc<DispatcherMetrics>,
}

impl DispatcherHandle {
    /// Registers a subscriber with its delivery channel (capacity 1).
    ///
    /// # Errors
    ///
    /// Returns [`DispatcherError::AlreadySubscribed`] for a duplicate
    /// subscription, or [`DispatcherError::Closed`] when the task is gone.
    pub async fn subscribe(
        &self,
        subscriber: SubscriberId,
        shape: Shape,
        sender: mpsc::Sender<TxnEvent>,
    ) -> Result<(), DispatcherError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(DispatcherMsg::Subscribe {
                subscriber,
                shape,
                sender,
                reply,
            })
            .map_err(|_| DispatcherError::Closed)?;
        rx.await.map_err(|_| DispatcherError::Closed)?
    }

    /// Acknowledges the in-flight event on behalf of `from`.
    pub fn ask(&self, from: SubscriberId) {
        let _ = self.tx.send(DispatcherMsg::Ask { from });
    }

    /// Removes a subscriber.
    pub fn cancel(&self, from: SubscriberId) {
        let _ = self.tx.send(DispatcherMsg::Cancel { from });
    }

    /// Hands one producer event to the dispatcher. The producer must hold
    /// a demand unit for every call.
    pub fn dispatch(&self, event: TxnEvent) {
        let _ = self.tx.send(DispatcherMsg::Dispatch(event));
    }

    /// Returns the dispatcher metrics.
    #[must_use]
    pub fn metrics(&self) -> &Arc<DispatcherMetrics> {
        &self.metrics
    }
}

/// The dispatcher task: owns the state machine, its mailbox, and the
/// producer demand channel.
pub struct Dispatcher {
    core: DispatcherCore,
    rx: mpsc::UnboundedReceiver<DispatcherMsg>,
    /// Weak self-sender for synthetic acks, so the mailbox still closes
    /// when every external handle is dropped.
    self_tx: mpsc::WeakUnboundedSender<DispatcherMsg>,
    demand_tx: mpsc::Sender<()>,
    shutdown: watch::Receiver<bool>,
}

impl Dispatcher {
    /// Creates the task state and its handle. `demand_tx` carries demand
    /// units to the producer; `shutdown` stops the run loop.
    #[must_use]
    pub fn new(
        demand_tx: mpsc::Sender<()>,
        shutdown: watch::Receiver<bool>,
    ) -> (Self, DispatcherHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let core = DispatcherCore::new();
        let handle = DispatcherHandle {
            tx: tx.clone(),
            metrics: core.metrics(),
        };
        (
            Self {
                core,
                rx,
                self_tx: tx.downgrade(),
                demand_tx,
                shutdown,
            },
            handle,
        )
    }

    /// Runs the dispatcher loop until shutdown or until every handle is
    /// dropped. Should be spawned as a tokio task.
    pub async fn run(mut self) {
        loop {
            if *self.shutdown.borrow() {
                debug!("dispatcher shutting down");
                break;
            }
            tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                msg = self.rx.recv() => {
                    let Some(msg) = msg else { break };
                    self.handle_msg(msg).await;
                }
            }
        }
    }

    async fn handle_msg(&mut self, msg: DispatcherMsg) {
        match msg {
            DispatcherMsg::Subscribe {
                subscriber,
                shape,
                sender,
                reply,
            } => match self.core.subscribe(subscriber, shape, sender) {
                Ok(demand) => {
                    let _ = reply.send(Ok(()));
                    self.grant(demand).await;
                }
                Err(err) => {
                    let _ = reply.send(Err(err));
                }
            },
            DispatcherMsg::Ask { from } => {
                let demand = self.core.ask(from);
                self.grant(demand).await;
            }
            DispatcherMsg::Cancel { from } => {
                let demand = self.core.cancel(from);
                self.grant(demand).await;
            }
            DispatcherMsg::Dispatch(event) => match self.core.dispatch(event) {
                DispatchOutcome::AwaitingAcks => {}
                DispatchOutcome::SyntheticAck(chosen) => {
                    if let Some(tx) = self.self_tx.upgrade() {
                        let _ = tx.send(DispatcherMsg::Ask { from: chosen });
                    }
                }
                DispatchOutcome::Immediate(demand) => self.grant(demand).await,
            },
        }
    }

    /// Forwards demand units to the producer.
    async fn grant(&self, demand: Demand) {
        for _ in 0..demand.0 {
            self.core
                .metrics
                .demands_granted
                .fetch_add(1, Ordering::Relaxed);
            if self.demand_tx.send(()).await.is_err() {
                debug!("producer demand channel closed");
                return;
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::{Relation, Row, SchemaChange, Transaction};
    use crate::offset::Lsn;
    use crate::shape::predicate::{CompareOp, Literal, Predicate};

    fn users() -> Relation {
        Relation::new("public", "users")
    }

    fn orders() -> Relation {
        Relation::new("public", "orders")
    }

    fn fragment(lsn: u64, relation: Relation) -> TxnEvent {
        TxnEvent::Fragment(Arc::new(TxnFragment {
            lsn: Lsn::new(lsn),
            changes: vec![Change::Insert {
                relation,
                new: Row::from_pairs([("id", Some("1"))]),
                op_index: 0,
            }],
        }))
    }

    fn subscribe(
        core: &mut DispatcherCore,
        id: u64,
        shape: Shape,
    ) -> (SubscriberId, mpsc::Receiver<TxnEvent>) {
        let (tx, rx) = mpsc::channel(1);
        let sub = SubscriberId(id);
        core.subscribe(sub, shape, tx).unwrap();
        (sub, rx)
    }

    // --- Subscribe tests ---

    #[test]
    fn test_first_subscriber_grants_initial_demand() {
        let mut core = DispatcherCore::new();
        let (tx, _rx) = mpsc::channel(1);
        let demand = core
            .subscribe(SubscriberId(1), Shape::new(users()), tx)
            .unwrap();
        assert_eq!(demand, Demand::ONE);

        let (tx, _rx) = mpsc::channel(1);
        let demand = core
            .subscribe(SubscriberId(2), Shape::new(users()), tx)
            .unwrap();
        assert_eq!(demand, Demand::NONE);
    }

    #[test]
    fn test_duplicate_subscribe_rejected() {
        let mut core = DispatcherCore::new();
        let (_, _rx) = subscribe(&mut core, 1, Shape::new(users()));
        let (tx, _rx2) = mpsc::channel(1);
        let err = core
            .subscribe(SubscriberId(1), Shape::new(users()), tx)
            .unwrap_err();
        assert!(matches!(err, DispatcherError::AlreadySubscribed));
        // The original subscription is untouched.
        assert_eq!(core.subscriber_count(), 1);
    }

    // --- Dispatch and ack tests ---

    #[test]
    fn test_dispatch_delivers_and_awaits_ack() {
        let mut core = DispatcherCore::new();
        let (sub, mut rx) = subscribe(&mut core, 1, Shape::new(users()));

        let outcome = core.dispatch(fragment(1, users()));
        assert_eq!(outcome, DispatchOutcome::AwaitingAcks);
        assert_eq!(core.waiting(), 1);
        assert!(rx.try_recv().is_ok());

        assert_eq!(core.ask(sub), Demand::ONE);
        assert_eq!(core.waiting(), 0);
    }

    #[test]
    fn test_demand_waits_for_all_affected() {
        let mut core = DispatcherCore::new();
        let (a, mut rx_a) = subscribe(&mut core, 1, Shape::new(users()));
        let (b, mut rx_b) = subscribe(&mut core, 2, Shape::new(users()));

        core.dispatch(fragment(1, users()));
        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_ok());
        assert_eq!(core.waiting(), 2);

        assert_eq!(core.ask(a), Demand::NONE);
        assert_eq!(core.ask(b), Demand::ONE);
    }

    #[test]
    fn test_duplicate_and_premature_acks_ignored() {
        let mut core = DispatcherCore::new();
        let (a, _rx_a) = subscribe(&mut core, 1, Shape::new(users()));
        let (b, _rx_b) = subscribe(&mut core, 2, Shape::new(orders()));

        // Premature: nothing in flight.
        assert_eq!(core.ask(a), Demand::NONE);

        core.dispatch(fragment(1, users()));
        // b was not affected; its ack must not close the loop.
        assert_eq!(core.ask(b), Demand::NONE);
        assert_eq!(core.waiting(), 1);
        assert_eq!(core.ask(a), Demand::ONE);
        // Duplicate after completion.
        assert_eq!(core.ask(a), Demand::NONE);
    }

    #[test]
    fn test_only_affected_subscribers_receive() {
        let mut core = DispatcherCore::new();
        let (_, mut rx_users) = subscribe(&mut core, 1, Shape::new(users()));
        let (_, mut rx_orders) = subscribe(&mut core, 2, Shape::new(orders()));

        core.dispatch(fragment(1, users()));
        assert!(rx_users.try_recv().is_ok());
        assert!(rx_orders.try_recv().is_err());
    }

    #[test]
    fn test_predicate_filters_delivery() {
        let mut core = DispatcherCore::new();
        let narrow = Shape::new(users()).with_where(Predicate::compare(
            "id",
            CompareOp::Eq,
            Literal::Int(999),
        ));
        let (_, mut rx_narrow) = subscribe(&mut core, 1, narrow);
        let (sub_all, mut rx_all) = subscribe(&mut core, 2, Shape::new(users()));

        let outcome = core.dispatch(fragment(1, users()));
        assert_eq!(outcome, DispatchOutcome::AwaitingAcks);
        assert!(rx_narrow.try_recv().is_err());
        assert!(rx_all.try_recv().is_ok());
        assert_eq!(core.ask(sub_all), Demand::ONE);
    }

    // --- Zero-match tests ---

    #[test]
    fn test_zero_match_closes_demand_loop_synthetically() {
        let mut core = DispatcherCore::new();
        let (sub, mut rx) = subscribe(&mut core, 1, Shape::new(users()));

        let outcome = core.dispatch(fragment(1, orders()));
        let DispatchOutcome::SyntheticAck(chosen) = outcome else {
            panic!("expected synthetic ack, got {outcome:?}");
        };
        assert_eq!(chosen, sub);
        assert_eq!(core.waiting(), 1);
        assert!(rx.try_recv().is_err());

        // The synthetic ack arrives through the normal path and releases
        // exactly one demand unit.
        assert_eq!(core.ask(chosen), Demand::ONE);
        assert_eq!(core.metrics().synthetic_acks(), 1);
    }

    #[test]
    fn test_dispatch_with_no_subscribers_returns_demand() {
        let mut core = DispatcherCore::new();
        let outcome = core.dispatch(fragment(1, users()));
        assert_eq!(outcome, DispatchOutcome::Immediate(Demand::ONE));
    }

    // --- Commit routing tests ---

    #[test]
    fn test_commit_routed_to_txn_participants_only() {
        let mut core = DispatcherCore::new();
        let (a, mut rx_a) = subscribe(&mut core, 1, Shape::new(users()));
        let (_b, mut rx_b) = subscribe(&mut core, 2, Shape::new(orders()));

        core.dispatch(fragment(7, users()));
        rx_a.try_recv().unwrap();
        assert_eq!(core.ask(a), Demand::ONE);

        core.dispatch(TxnEvent::Commit { lsn: Lsn::new(7) });
        assert!(matches!(rx_a.try_recv().unwrap(), TxnEvent::Commit { .. }));
        assert!(rx_b.try_recv().is_err());
        assert_eq!(core.ask(a), Demand::ONE);

        // Participant set resets for the next transaction.
        core.dispatch(TxnEvent::Commit { lsn: Lsn::new(8) });
        assert!(rx_a.try_recv().is_err());
    }

    // --- Cancel tests ---

    #[test]
    fn test_cancel_pending_subscriber_releases_demand() {
        let mut core = DispatcherCore::new();
        let (a, mut rx_a) = subscribe(&mut core, 1, Shape::new(users()));
        let (b, _rx_b) = subscribe(&mut core, 2, Shape::new(users()));

        core.dispatch(fragment(1, users()));
        rx_a.try_recv().unwrap();
        assert_eq!(core.ask(a), Demand::NONE);

        // b never acks; cancelling it must release the demand unit.
        assert_eq!(core.cancel(b), Demand::ONE);
        assert_eq!(core.waiting(), 0);
        assert_eq!(core.subscriber_count(), 1);
    }

    #[test]
    fn test_cancel_idle_subscriber_no_demand() {
        let mut core = DispatcherCore::new();
        let (a, _rx) = subscribe(&mut core, 1, Shape::new(users()));
        assert_eq!(core.cancel(a), Demand::NONE);
        assert_eq!(core.cancel(a), Demand::NONE);
        assert_eq!(core.subscriber_count(), 0);
    }

    #[test]
    fn test_dead_subscriber_dropped_on_dispatch() {
        let mut core = DispatcherCore::new();
        let (_, rx) = subscribe(&mut core, 1, Shape::new(users()));
        let (b, mut rx_b) = subscribe(&mut core, 2, Shape::new(users()));
        drop(rx);

        let outcome = core.dispatch(fragment(1, users()));
        assert_eq!(outcome, DispatchOutcome::AwaitingAcks);
        assert_eq!(core.subscriber_count(), 1);
        assert!(rx_b.try_recv().is_ok());
        assert_eq!(core.ask(b), Demand::ONE);
    }

    // --- Partition routing ---

    #[test]
    fn test_partition_change_routed_to_parent_shape() {
        let parent = Relation::new("public", "events");
        let partition = Relation::new("public", "events_2026_08");

        let mut core = DispatcherCore::new();
        let (sub, mut rx) = subscribe(&mut core, 1, Shape::new(parent.clone()));

        // Schema change announcing the partition arrives on the stream.
        let announce = TxnEvent::Fragment(Arc::new(TxnFragment {
            lsn: Lsn::new(1),
            changes: vec![Change::Relation(SchemaChange {
                relation: partition.clone(),
                columns: vec![],
                parent: Some(parent.clone()),
                op_index: 0,
            })],
        }));
        match core.dispatch(announce) {
            DispatchOutcome::AwaitingAcks => {
                rx.try_recv().unwrap();
                core.ask(sub);
            }
            DispatchOutcome::SyntheticAck(chosen) => {
                core.ask(chosen);
            }
            DispatchOutcome::Immediate(_) => panic!("subscriber exists"),
        }

        // A row landing in the partition reaches the parent's shape,
        // relabelled onto the parent.
        core.dispatch(fragment(2, partition));
        let TxnEvent::Fragment(frag) = rx.try_recv().unwrap() else {
            panic!("expected fragment");
        };
        assert_eq!(frag.changes[0].relation(), &parent);
    }

    // --- Whole-transaction events ---

    #[test]
    fn test_whole_transaction_dispatch() {
        let mut core = DispatcherCore::new();
        let (sub, mut rx) = subscribe(&mut core, 1, Shape::new(users()));

        let txn = TxnEvent::Transaction(Arc::new(Transaction {
            lsn: Lsn::new(3),
            changes: vec![Change::Insert {
                relation: users(),
                new: Row::from_pairs([("id", Some("1"))]),
                op_index: 0,
            }],
        }));
        core.dispatch(txn);
        assert!(matches!(rx.try_recv().unwrap(), TxnEvent::Transaction(_)));
        assert_eq!(core.ask(sub), Demand::ONE);
    }

    // --- Task-level tests ---

    #[tokio::test]
    async fn test_task_grants_demand_through_full_cycle() {
        let (demand_tx, mut demand_rx) = mpsc::channel(4);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let (dispatcher, handle) = Dispatcher::new(demand_tx, shutdown_rx);
        let task = tokio::spawn(dispatcher.run());

        let (events_tx, mut events_rx) = mpsc::channel(1);
        handle
            .subscribe(SubscriberId(1), Shape::new(users()), events_tx)
            .await
            .unwrap();

        // Initial demand from the first subscription.
        demand_rx.recv().await.unwrap();

        handle.dispatch(fragment(1, users()));
        let event = events_rx.recv().await.unwrap();
        assert!(matches!(event, TxnEvent::Fragment(_)));

        handle.ask(SubscriberId(1));
        demand_rx.recv().await.unwrap();

        drop(handle);
        drop(events_rx);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_task_zero_match_regenerates_demand() {
        let (demand_tx, mut demand_rx) = mpsc::channel(4);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let (dispatcher, handle) = Dispatcher::new(demand_tx, shutdown_rx);
        let task = tokio::spawn(dispatcher.run());

        let (events_tx, mut events_rx) = mpsc::channel(1);
        handle
            .subscribe(SubscriberId(1), Shape::new(users()), events_tx)
            .await
            .unwrap();
        demand_rx.recv().await.unwrap();

        // Event for a relation nobody watches: demand must still return,
        // and the subscriber must see nothing.
        handle.dispatch(fragment(1, orders()));
        demand_rx.recv().await.unwrap();
        assert!(events_rx.try_recv().is_err());

        drop(handle);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_task_duplicate_subscribe_then_normal_delivery() {
        let (demand_tx, mut demand_rx) = mpsc::channel(4);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let (dispatcher, handle) = Dispatcher::new(demand_tx, shutdown_rx);
        let task = tokio::spawn(dispatcher.run());

        let (events_tx, mut events_rx) = mpsc::channel(1);
        handle
            .subscribe(SubscriberId(1), Shape::new(users()), events_tx)
            .await
            .unwrap();
        demand_rx.recv().await.unwrap();

        let (dup_tx, _dup_rx) = mpsc::channel(1);
        let err = handle
            .subscribe(SubscriberId(1), Shape::new(users()), dup_tx)
            .await
            .unwrap_err();
        assert!(matches!(err, DispatcherError::AlreadySubscribed));

        // The original subscription keeps receiving events normally.
        handle.dispatch(fragment(1, users()));
        assert!(events_rx.recv().await.is_some());

        drop(handle);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_task_shutdown() {
        let (demand_tx, _demand_rx) = mpsc::channel(4);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (dispatcher, handle) = Dispatcher::new(demand_tx, shutdown_rx);
        let task = tokio::spawn(dispatcher.run());

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
        drop(handle);
    }
}
