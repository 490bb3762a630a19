//! Live update streams with per-customer multiplexing.
//!
//! Many concurrent subscriber connections for one customer (several
//! browser tabs, say) share a single upstream feed pair and a single
//! merge computation. The manager owns the lifecycle:
//! - first attach opens the feed and starts the flush worker
//! - last detach tears everything down synchronously
//! - a selection-set change rebuilds the feed with listeners preserved
//!
//! Delivery is periodic, deduplicated per window, and best-effort: a
//! listener that cannot accept a batch is detached, nobody else is held
//! up.
//!
//! # Example
//!
//! ```ignore
//! let manager = StreamManager::new(Arc::new(source));
//!
//! let (listener, handle) = Listener::channel(ListenerId(1), 64);
//! manager.attach(customer, selections, Timestamp::now(), listener)?;
//!
//! while let Ok(batch) = handle.recv() {
//!     for update in batch {
//!         println!("selection {} changed", update.selection_id);
//!     }
//! }
//! ```

mod manager;
mod types;

pub use manager::StreamManager;
pub use types::{DetachReason, Listener, ListenerHandle, StreamConfig, UpdateBatch};
