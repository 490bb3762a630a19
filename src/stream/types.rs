//! Listener types and stream configuration.

use crate::types::{BetslipUpdate, ListenerId};
use crossbeam_channel::{bounded, Receiver, Sender};
use std::time::Duration;

/// A delivered batch: one update per selection that changed this window.
pub type UpdateBatch = Vec<BetslipUpdate>;

/// Configuration for the stream manager.
#[derive(Clone, Debug)]
pub struct StreamConfig {
    /// Fixed period between batch flushes per customer stream.
    /// Default: 1000 ms
    pub flush_interval: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_millis(1000),
        }
    }
}

/// The delivery side of one subscriber connection.
///
/// The engine holds this for the duration of attachment; the transport
/// keeps the matching [`ListenerHandle`]. Connection lifetime stays with
/// the transport — the engine only reacts to attach/detach.
pub struct Listener {
    id: ListenerId,
    sender: Sender<UpdateBatch>,
}

impl Listener {
    /// Build a listener and its transport-side handle with a bounded
    /// delivery buffer.
    pub fn channel(id: ListenerId, buffer_size: usize) -> (Listener, ListenerHandle) {
        let (sender, receiver) = bounded(buffer_size);
        (Listener { id, sender }, ListenerHandle { id, receiver })
    }

    pub fn id(&self) -> ListenerId {
        self.id
    }

    /// Try to deliver a batch. Returns false if the buffer is full or the
    /// connection is gone; the caller detaches the listener then.
    pub(crate) fn try_deliver(&self, batch: UpdateBatch) -> bool {
        self.sender.try_send(batch).is_ok()
    }
}

/// Why a listener was removed from its stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DetachReason {
    /// Delivery failed (buffer full or connection gone).
    DeliveryFailed,
    /// The upstream feed died underneath the stream.
    UpstreamLost,
    /// Explicit detach from the transport.
    Detached,
}

/// Transport-side handle for receiving update batches.
///
/// A disconnect on the receiver means the stream was torn down.
pub struct ListenerHandle {
    pub id: ListenerId,
    receiver: Receiver<UpdateBatch>,
}

impl ListenerHandle {
    /// Receive the next batch (blocking).
    pub fn recv(&self) -> Result<UpdateBatch, crossbeam_channel::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive a batch (non-blocking).
    pub fn try_recv(&self) -> Result<UpdateBatch, crossbeam_channel::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Receive with timeout.
    pub fn recv_timeout(
        &self,
        timeout: Duration,
    ) -> Result<UpdateBatch, crossbeam_channel::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }
}
