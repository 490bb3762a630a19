//! In-memory change source.
//!
//! Keeps every published record in arrival order and serves both query
//! primitives over it. `open_tail` behaves like a tailable cursor: it
//! first replays matching history after the given timestamp, then streams
//! live publishes until the handle is closed. Backs the test suite and
//! embedded single-process deployments.

use super::{ChangeSource, EntityCollection, TailHandle};
use crate::error::Result;
use crate::types::{ChangeRecord, EntityId, Timestamp};
use crossbeam_channel::{unbounded, Sender};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// One registered tailing query.
struct Tail {
    collection: EntityCollection,
    entity_ids: HashSet<EntityId>,
    after: Timestamp,
    sender: Sender<ChangeRecord>,
}

impl Tail {
    fn matches(&self, collection: EntityCollection, record: &ChangeRecord) -> bool {
        self.collection == collection
            && record.timestamp > self.after
            && self.entity_ids.contains(&record.entity_id)
    }
}

struct Inner {
    /// Full publish history in arrival order.
    history: Mutex<Vec<(EntityCollection, ChangeRecord)>>,
    /// Live tails by id.
    tails: Mutex<HashMap<u64, Tail>>,
    next_tail: AtomicU64,
}

/// In-memory [`ChangeSource`] implementation.
#[derive(Clone)]
pub struct MemoryChangeSource {
    inner: Arc<Inner>,
}

impl MemoryChangeSource {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                history: Mutex::new(Vec::new()),
                tails: Mutex::new(HashMap::new()),
                next_tail: AtomicU64::new(1),
            }),
        }
    }

    /// Publish a change record to a collection.
    ///
    /// The record is appended to history and fanned out to every open
    /// tail whose filter it matches. Tails whose receiver is gone are
    /// pruned here.
    pub fn publish(&self, collection: EntityCollection, record: ChangeRecord) {
        // History lock is taken before the tails lock everywhere, so a
        // concurrent open_tail can neither miss nor duplicate a record.
        let mut history = self.inner.history.lock();
        history.push((collection, record.clone()));

        let mut tails = self.inner.tails.lock();
        tails.retain(|_, tail| {
            if !tail.matches(collection, &record) {
                return true;
            }
            tail.sender.send(record.clone()).is_ok()
        });
    }

    /// Number of open tailing queries.
    pub fn tail_count(&self) -> usize {
        self.inner.tails.lock().len()
    }
}

impl Default for MemoryChangeSource {
    fn default() -> Self {
        Self::new()
    }
}

impl ChangeSource for MemoryChangeSource {
    fn open_tail(
        &self,
        collection: EntityCollection,
        entity_ids: &[EntityId],
        after: Timestamp,
    ) -> Result<TailHandle> {
        let (sender, receiver) = unbounded();
        let tail = Tail {
            collection,
            entity_ids: entity_ids.iter().cloned().collect(),
            after,
            sender,
        };

        // Replay matching history, then register for live records, all
        // under the history lock so no publish can slip between the two.
        let history = self.inner.history.lock();
        for (record_collection, record) in history.iter() {
            if tail.matches(*record_collection, record) {
                let _ = tail.sender.send(record.clone());
            }
        }

        let id = self.inner.next_tail.fetch_add(1, Ordering::SeqCst);
        self.inner.tails.lock().insert(id, tail);
        drop(history);

        debug!(collection = %collection, ids = entity_ids.len(), "opened tailing query");

        let inner = Arc::clone(&self.inner);
        Ok(TailHandle::new(receiver, move || {
            inner.tails.lock().remove(&id);
        }))
    }

    fn fetch_changes(
        &self,
        collection: EntityCollection,
        entity_ids: &[EntityId],
        after: Timestamp,
    ) -> Result<Vec<ChangeRecord>> {
        let wanted: HashSet<&EntityId> = entity_ids.iter().collect();
        let history = self.inner.history.lock();

        Ok(history
            .iter()
            .filter(|(record_collection, record)| {
                *record_collection == collection
                    && record.timestamp > after
                    && wanted.contains(&record.entity_id)
            })
            .map(|(_, record)| record.clone())
            .collect())
    }
}
