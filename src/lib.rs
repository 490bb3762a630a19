//! # Slipstream
//!
//! Live update multiplexing for betslip selections: converts a customer's
//! set of entities-of-interest into one shared change feed, a reusable
//! delta-merge computation, and a fan-out that lets many concurrent
//! connections for the same customer receive periodic, deduplicated,
//! filtered change batches.
//!
//! ## Core Concepts
//!
//! - **Change records**: raw per-entity field changes from an upstream feed
//! - **Merging**: one accumulated snapshot per entity per flush window
//! - **Streams**: one feed pair per customer, shared by all listeners
//! - **Delta query**: one-shot "what changed since T" over the same pipeline
//!
//! ## Example
//!
//! ```ignore
//! use slipstream::{
//!     Listener, ListenerId, MemoryChangeSource, SelectionRef, StreamManager,
//!     CustomerId, Timestamp,
//! };
//! use std::sync::Arc;
//!
//! let source = MemoryChangeSource::new();
//! let manager = StreamManager::new(Arc::new(source.clone()));
//!
//! let selections = vec![SelectionRef::new("sel-1", "event-9", "market-4")];
//! let (listener, handle) = Listener::channel(ListenerId(1), 64);
//! manager.attach(CustomerId(42), selections, Timestamp::now(), listener)?;
//!
//! // Batches arrive on `handle` once entities start changing.
//! let batch = handle.recv()?;
//! ```

pub mod delta;
pub mod error;
pub mod merge;
pub mod message;
pub mod source;
pub mod stream;
pub mod types;

// Re-exports
pub use delta::fetch_betslip_updates;
pub use error::{Result, StreamError};
pub use merge::merge_changes;
pub use message::{build_updates, filter_market_for_selection};
pub use source::{ChangeSource, EntityCollection, MemoryChangeSource, TailHandle};
pub use stream::{DetachReason, Listener, ListenerHandle, StreamConfig, StreamManager, UpdateBatch};
pub use types::*;
