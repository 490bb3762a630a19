//! Entity change source abstraction.
//!
//! The engine never talks to the change-log store directly; it consumes
//! this trait. Two primitives are required: a tailing query (live,
//! order-preserving, cancellable) and a one-shot fetch in arrival order.

mod memory;

pub use memory::MemoryChangeSource;

use crate::error::Result;
use crate::types::{ChangeRecord, EntityId, Timestamp};
use crossbeam_channel::Receiver;
use std::fmt;

/// Which entity collection a query targets.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EntityCollection {
    Events,
    Markets,
}

impl fmt::Display for EntityCollection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityCollection::Events => write!(f, "events"),
            EntityCollection::Markets => write!(f, "markets"),
        }
    }
}

/// A live tailing query over one entity collection.
///
/// The receiver doubles as the raw-record buffer between flush windows;
/// records drain in the order the source emitted them. Dropping the
/// handle cancels the query upstream, so abandoning a feed on an error
/// path cannot leak a cursor.
pub struct TailHandle {
    receiver: Receiver<ChangeRecord>,
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl TailHandle {
    pub fn new(receiver: Receiver<ChangeRecord>, cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            receiver,
            cancel: Some(Box::new(cancel)),
        }
    }

    /// The live record channel.
    pub fn records(&self) -> &Receiver<ChangeRecord> {
        &self.receiver
    }

    /// Cancel the query and release buffered records.
    pub fn close(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for TailHandle {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl fmt::Debug for TailHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TailHandle")
            .field("buffered", &self.receiver.len())
            .finish()
    }
}

/// Upstream dependency contract for entity change feeds.
pub trait ChangeSource: Send + Sync {
    /// Open a tailing query: changes to `entity_ids` after `after`,
    /// existing matches first, then live.
    fn open_tail(
        &self,
        collection: EntityCollection,
        entity_ids: &[EntityId],
        after: Timestamp,
    ) -> Result<TailHandle>;

    /// Fetch all matching changes in arrival order.
    fn fetch_changes(
        &self,
        collection: EntityCollection,
        entity_ids: &[EntityId],
        after: Timestamp,
    ) -> Result<Vec<ChangeRecord>>;
}
