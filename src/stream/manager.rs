//! Stream manager: per-customer feed lifecycle, batch flushing, fan-out.
//!
//! The registry is a sharded lock table: a map of customer slots guarded
//! by a read-write lock, with every slot carrying its own mutex over an
//! explicit lifecycle state. All mutation of one customer's stream
//! (attach, detach, resubscribe, flush) happens under that slot mutex, so
//! check-and-create and check-and-delete cannot race, and the map lock is
//! never held across upstream I/O.

use crate::error::{Result, StreamError};
use crate::merge::merge_changes;
use crate::message::build_updates;
use crate::source::{ChangeSource, EntityCollection, TailHandle};
use crate::types::{ChangeRecord, CustomerId, EntityId, ListenerId, SelectionRef, Timestamp};
use crossbeam_channel::{bounded, select, tick, Receiver, Sender, TryRecvError};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::thread;
use tracing::{debug, error, trace, warn};

use super::types::{DetachReason, Listener, StreamConfig};

/// Lifecycle of one customer slot.
enum FeedState {
    /// Slot claimed; the claiming attach is still opening the feed.
    Opening,
    /// Feed pair live, worker ticking.
    Active(CustomerStream),
    /// Torn down. Slots are never reused; attach retries on a fresh one.
    Closed,
}

impl FeedState {
    /// Move the stream out, leaving the slot closed.
    fn take_stream(&mut self) -> Option<CustomerStream> {
        match std::mem::replace(self, FeedState::Closed) {
            FeedState::Active(stream) => Some(stream),
            _ => None,
        }
    }
}

/// One customer's live stream: the feed pair, its listeners, and the
/// owned handle that keeps the flush worker cancellable.
struct CustomerStream {
    /// Selection snapshot taken at attach/resubscribe time.
    selections: Vec<SelectionRef>,
    /// Attached listeners in registration order.
    listeners: Vec<Listener>,
    events_tail: TailHandle,
    markets_tail: TailHandle,
    /// Dropping this wakes the worker so it can exit.
    stop_tx: Sender<()>,
    _worker: thread::JoinHandle<()>,
}

impl CustomerStream {
    /// Stop the worker, cancel both tails, release buffered state. The
    /// listeners are handed back so resubscribe can carry them over;
    /// other teardown paths drop them, which the transport observes as a
    /// channel disconnect.
    fn shutdown(self) -> Vec<Listener> {
        let CustomerStream {
            listeners,
            events_tail,
            markets_tail,
            stop_tx,
            ..
        } = self;
        drop(stop_tx);
        events_tail.close();
        markets_tail.close();
        listeners
    }
}

struct CustomerSlot {
    customer_id: CustomerId,
    state: Mutex<FeedState>,
}

struct Registry {
    customers: RwLock<HashMap<CustomerId, Arc<CustomerSlot>>>,
}

impl Registry {
    /// Remove the map entry only if it still points at this slot; a
    /// concurrent attach may already have installed a fresh one.
    fn remove_if_same(&self, customer_id: CustomerId, slot: &Arc<CustomerSlot>) {
        let mut map = self.customers.write();
        if let Some(current) = map.get(&customer_id) {
            if Arc::ptr_eq(current, slot) {
                map.remove(&customer_id);
            }
        }
    }
}

/// Manages every customer's update stream.
///
/// Feeds are keyed by customer only: concurrent connections for one
/// customer share one upstream feed pair and one merge computation, so
/// fan-out cost is O(listeners) while upstream cost stays O(1) per
/// customer.
pub struct StreamManager {
    registry: Arc<Registry>,
    source: Arc<dyn ChangeSource>,
    config: StreamConfig,
}

impl StreamManager {
    /// Create a manager with the default configuration.
    pub fn new(source: Arc<dyn ChangeSource>) -> Self {
        Self::with_config(source, StreamConfig::default())
    }

    pub fn with_config(source: Arc<dyn ChangeSource>, config: StreamConfig) -> Self {
        Self {
            registry: Arc::new(Registry {
                customers: RwLock::new(HashMap::new()),
            }),
            source,
            config,
        }
    }

    /// Attach a subscriber connection to a customer's stream.
    ///
    /// Opens the feed pair (changes to the selections' entities after
    /// `after`) and starts the flush worker on first attach; later
    /// attaches share the existing feed as-is and receive the next flush,
    /// never a backfill. Fails only if the feed cannot be opened or the
    /// listener id is already attached; on failure the listener is not
    /// registered.
    pub fn attach(
        &self,
        customer_id: CustomerId,
        selections: Vec<SelectionRef>,
        after: Timestamp,
        listener: Listener,
    ) -> Result<()> {
        loop {
            let slot = self.slot(customer_id);
            let mut state = slot.state.lock();
            match &mut *state {
                FeedState::Closed => {
                    // Raced a teardown; retry against a fresh slot.
                    drop(state);
                    self.registry.remove_if_same(customer_id, &slot);
                }
                FeedState::Active(stream) => {
                    if stream.listeners.iter().any(|l| l.id() == listener.id()) {
                        return Err(StreamError::ListenerExists(listener.id()));
                    }
                    stream.listeners.push(listener);
                    debug!(
                        customer = %customer_id,
                        listeners = stream.listeners.len(),
                        "update stream already exists, listener added"
                    );
                    return Ok(());
                }
                FeedState::Opening => {
                    debug!(customer = %customer_id, "no update stream found, opening feed");
                    match self.open_stream(&slot, selections, after, listener) {
                        Ok(stream) => {
                            *state = FeedState::Active(stream);
                            return Ok(());
                        }
                        Err(e) => {
                            *state = FeedState::Closed;
                            drop(state);
                            self.registry.remove_if_same(customer_id, &slot);
                            return Err(e);
                        }
                    }
                }
            }
        }
    }

    /// Detach a subscriber connection.
    ///
    /// Removing the last listener synchronously stops the worker, cancels
    /// both tails, releases buffered state, and deletes the stream.
    /// Idempotent: unknown customers and already-detached listeners are
    /// no-ops.
    pub fn detach(&self, customer_id: CustomerId, listener_id: ListenerId) {
        let Some(slot) = self.registry.customers.read().get(&customer_id).cloned() else {
            return;
        };
        let mut state = slot.state.lock();
        let FeedState::Active(stream) = &mut *state else {
            return;
        };

        let before = stream.listeners.len();
        stream.listeners.retain(|l| l.id() != listener_id);
        if stream.listeners.len() == before {
            return;
        }
        debug!(
            customer = %customer_id,
            listeners = stream.listeners.len(),
            "listener detached"
        );

        if stream.listeners.is_empty() {
            let stream = state.take_stream().expect("active stream");
            drop(state);
            self.registry.remove_if_same(customer_id, &slot);
            stream.shutdown();
            debug!(customer = %customer_id, "last listener gone, stream closed");
        }
    }

    /// Rebuild a customer's stream around a new selection set.
    ///
    /// No-op without an active stream. Otherwise the old feed is torn
    /// down exactly as in detach-all and every preserved listener is
    /// re-attached with the new selections and a "now" timestamp. The
    /// delivery channels are reused, so the transport never observes a
    /// disconnect — only a gap while the new feed opens. Called from the
    /// selection write path, never by subscribers.
    pub fn resubscribe(&self, customer_id: CustomerId, new_selections: Vec<SelectionRef>) {
        let Some(slot) = self.registry.customers.read().get(&customer_id).cloned() else {
            return;
        };
        let stream = {
            let mut state = slot.state.lock();
            let Some(stream) = state.take_stream() else {
                return;
            };
            stream
        };
        self.registry.remove_if_same(customer_id, &slot);
        let listeners = stream.shutdown();
        debug!(
            customer = %customer_id,
            listeners = listeners.len(),
            "rebuilding stream for updated selections"
        );

        let now = Timestamp::now();
        for listener in listeners {
            let listener_id = listener.id();
            trace!(customer = %customer_id, listener = %listener_id, "re-attaching listener");
            if let Err(e) = self.attach(customer_id, new_selections.clone(), now, listener) {
                error!(
                    customer = %customer_id,
                    listener = %listener_id,
                    "resubscribe failed to re-attach listener: {e}"
                );
            }
        }
    }

    /// Number of customers with an active stream.
    pub fn stream_count(&self) -> usize {
        // Snapshot the slots first; holding the map lock while taking
        // slot locks would invert the teardown paths' lock order.
        let slots: Vec<_> = self.registry.customers.read().values().cloned().collect();
        slots
            .iter()
            .filter(|slot| matches!(&*slot.state.lock(), FeedState::Active(_)))
            .count()
    }

    /// Whether this customer has an active stream.
    pub fn has_stream(&self, customer_id: CustomerId) -> bool {
        self.listener_count(customer_id) > 0
    }

    /// Attached listeners for this customer (0 without a stream).
    pub fn listener_count(&self, customer_id: CustomerId) -> usize {
        let Some(slot) = self.registry.customers.read().get(&customer_id).cloned() else {
            return 0;
        };
        let count = match &*slot.state.lock() {
            FeedState::Active(stream) => stream.listeners.len(),
            _ => 0,
        };
        count
    }

    /// Get or insert this customer's slot. New slots start in `Opening`;
    /// whichever attach locks one first becomes the opener.
    fn slot(&self, customer_id: CustomerId) -> Arc<CustomerSlot> {
        if let Some(slot) = self.registry.customers.read().get(&customer_id) {
            return slot.clone();
        }
        self.registry
            .customers
            .write()
            .entry(customer_id)
            .or_insert_with(|| {
                Arc::new(CustomerSlot {
                    customer_id,
                    state: Mutex::new(FeedState::Opening),
                })
            })
            .clone()
    }

    /// Open the feed pair and start the flush worker for a first attach.
    /// Runs under the slot lock; a tail opened before a later failure is
    /// cancelled by its `Drop`.
    fn open_stream(
        &self,
        slot: &Arc<CustomerSlot>,
        selections: Vec<SelectionRef>,
        after: Timestamp,
        listener: Listener,
    ) -> Result<CustomerStream> {
        let event_ids = unique_ids(selections.iter().map(|s| &s.event_id));
        let market_ids = unique_ids(selections.iter().map(|s| &s.market_id));

        let events_tail = self
            .source
            .open_tail(EntityCollection::Events, &event_ids, after)?;
        let markets_tail = self
            .source
            .open_tail(EntityCollection::Markets, &market_ids, after)?;

        let (stop_tx, stop_rx) = bounded(0);
        let worker = spawn_flush_worker(
            Arc::clone(slot),
            Arc::downgrade(&self.registry),
            stop_rx,
            self.config.flush_interval,
        )?;

        Ok(CustomerStream {
            selections,
            listeners: vec![listener],
            events_tail,
            markets_tail,
            stop_tx,
            _worker: worker,
        })
    }
}

impl Drop for StreamManager {
    fn drop(&mut self) {
        let slots: Vec<_> = self
            .registry
            .customers
            .write()
            .drain()
            .map(|(_, slot)| slot)
            .collect();
        for slot in slots {
            let stream = slot.state.lock().take_stream();
            if let Some(stream) = stream {
                stream.shutdown();
            }
        }
    }
}

/// Deduplicate entity ids preserving first-appearance order.
fn unique_ids<'a>(ids: impl Iterator<Item = &'a EntityId>) -> Vec<EntityId> {
    let mut seen = HashSet::new();
    ids.filter(|id| seen.insert((*id).clone())).cloned().collect()
}

fn spawn_flush_worker(
    slot: Arc<CustomerSlot>,
    registry: Weak<Registry>,
    stop_rx: Receiver<()>,
    interval: std::time::Duration,
) -> std::io::Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("betslip-flush-{}", slot.customer_id))
        .spawn(move || {
            let ticker = tick(interval);
            loop {
                select! {
                    recv(stop_rx) -> _ => break,
                    recv(ticker) -> _ => {
                        if !flush_window(&slot, &registry) {
                            break;
                        }
                    }
                }
            }
        })
}

/// One flush tick for one customer. Returns false once the stream is
/// gone and the worker should exit.
fn flush_window(slot: &Arc<CustomerSlot>, registry: &Weak<Registry>) -> bool {
    let mut state = slot.state.lock();
    let FeedState::Active(stream) = &mut *state else {
        return false;
    };

    // Draining swaps the window: records arriving during processing sit
    // in the channels until the next tick.
    let drained = (
        drain_tail(&stream.events_tail),
        drain_tail(&stream.markets_tail),
    );
    let (events, markets) = match drained {
        (Ok(events), Ok(markets)) => (events, markets),
        _ => {
            let stream = state.take_stream().expect("active stream");
            drop(state);
            error!(
                customer = %slot.customer_id,
                reason = ?DetachReason::UpstreamLost,
                "upstream change feed lost, closing stream"
            );
            if let Some(registry) = registry.upgrade() {
                registry.remove_if_same(slot.customer_id, slot);
            }
            stream.shutdown();
            return false;
        }
    };

    if events.is_empty() && markets.is_empty() {
        return true;
    }
    debug!(
        customer = %slot.customer_id,
        events = events.len(),
        markets = markets.len(),
        listeners = stream.listeners.len(),
        "flushing buffered updates"
    );

    let mut merged_events = merge_changes(events);
    merged_events.retain(|m| !m.changeset.is_empty());
    let mut merged_markets = merge_changes(markets);
    merged_markets.retain(|m| !m.changeset.is_empty());
    if merged_events.is_empty() && merged_markets.is_empty() {
        return true;
    }

    let batch = build_updates(&stream.selections, &merged_events, &merged_markets, false);
    if batch.is_empty() {
        return true;
    }

    // Deliver in registration order; one dead listener never blocks the
    // rest of the fan-out.
    let mut failed: Vec<ListenerId> = Vec::new();
    for listener in &stream.listeners {
        if !listener.try_deliver(batch.clone()) {
            warn!(
                customer = %slot.customer_id,
                listener = %listener.id(),
                reason = ?DetachReason::DeliveryFailed,
                "dropping listener"
            );
            failed.push(listener.id());
        }
    }
    if !failed.is_empty() {
        stream.listeners.retain(|l| !failed.contains(&l.id()));
        if stream.listeners.is_empty() {
            let stream = state.take_stream().expect("active stream");
            drop(state);
            if let Some(registry) = registry.upgrade() {
                registry.remove_if_same(slot.customer_id, slot);
            }
            stream.shutdown();
            debug!(customer = %slot.customer_id, "last listener gone, stream closed");
            return false;
        }
    }

    true
}

/// Drain a tail's buffered records. `Err` means the upstream feed
/// disconnected underneath us.
fn drain_tail(tail: &TailHandle) -> Result<Vec<ChangeRecord>> {
    let mut records = Vec::new();
    loop {
        match tail.records().try_recv() {
            Ok(record) => records.push(record),
            Err(TryRecvError::Empty) => return Ok(records),
            Err(TryRecvError::Disconnected) => {
                return Err(StreamError::Upstream("change feed disconnected".into()))
            }
        }
    }
}
