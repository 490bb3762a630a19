//! Core types for the update engine.

use crate::error::{Result, StreamError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Identifies the customer whose betslip is being watched. One customer
/// owns at most one live feed, shared by all of their connections.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CustomerId(pub i64);

impl fmt::Debug for CustomerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CustomerId({})", self.0)
    }
}

impl fmt::Display for CustomerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Transport-assigned identity of one subscriber connection.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ListenerId(pub u64);

impl fmt::Debug for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ListenerId({})", self.0)
    }
}

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of an upstream entity (sport event or market).
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub String);

impl EntityId {
    pub fn new(id: impl Into<String>) -> Self {
        EntityId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntityId({})", self.0)
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of one line item in a betslip.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SelectionId(pub String);

impl SelectionId {
    pub fn new(id: impl Into<String>) -> Self {
        SelectionId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SelectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SelectionId({})", self.0)
    }
}

impl fmt::Display for SelectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Milliseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current time.
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("Time went backwards");
        Timestamp(duration.as_millis() as i64)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// What kind of change a record describes. Serialized by variant name;
/// part of the wire contract.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeOperation {
    Insert,
    Update,
    Delete,
}

/// Mapping of field name to new value for one update.
///
/// Field names may be dotted paths. Market changesets address
/// selection-scoped fields as `selections.<selectionId>.<field>`; keys
/// without that prefix apply to the whole market.
pub type Changeset = serde_json::Map<String, serde_json::Value>;

/// One line item of a customer's betslip and the two upstream entities
/// it depends on. Immutable once produced by the selection lookup.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectionRef {
    pub selection_id: SelectionId,
    pub event_id: EntityId,
    pub market_id: EntityId,
}

impl SelectionRef {
    pub fn new(
        selection_id: impl Into<String>,
        event_id: impl Into<String>,
        market_id: impl Into<String>,
    ) -> Self {
        Self {
            selection_id: SelectionId::new(selection_id),
            event_id: EntityId::new(event_id),
            market_id: EntityId::new(market_id),
        }
    }
}

/// A raw change record as emitted by the entity change source.
///
/// Ordering within one entity's stream is by arrival order, which the
/// merge treats as chronological.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeRecord {
    pub entity_id: EntityId,
    pub timestamp: Timestamp,
    pub operation: ChangeOperation,
    pub changeset: Changeset,
}

impl ChangeRecord {
    /// Decode an untrusted upstream document.
    ///
    /// Missing or mistyped fields surface as [`StreamError::MalformedRecord`]
    /// so a bad document can be dropped without aborting its window.
    pub fn from_json(value: serde_json::Value) -> Result<Self> {
        serde_json::from_value(value).map_err(|e| StreamError::MalformedRecord(e.to_string()))
    }
}

/// Accumulated snapshot of one entity over a flush window. Derived from a
/// sequence of change records, never persisted.
#[derive(Clone, Debug, PartialEq)]
pub struct MergedEntity {
    pub entity_id: EntityId,
    /// Timestamp of the last contributing record.
    pub timestamp: Timestamp,
    /// Operation of the last contributing record.
    pub operation: ChangeOperation,
    /// Union of all changeset fields seen, later value wins per field.
    pub changeset: Changeset,
}

/// The per-entity slice of an update message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityUpdate {
    pub changeset: Changeset,
    pub timestamp: Timestamp,
    pub operation: ChangeOperation,
}

impl From<MergedEntity> for EntityUpdate {
    fn from(merged: MergedEntity) -> Self {
        Self {
            changeset: merged.changeset,
            timestamp: merged.timestamp,
            operation: merged.operation,
        }
    }
}

/// One selection's update in a batch.
///
/// The streaming path only emits selections with at least one changed
/// dependency; the one-shot query emits every selection, with both
/// options absent when nothing changed. This JSON shape is the only
/// serialized contract of the crate and must stay stable.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BetslipUpdate {
    pub selection_id: SelectionId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event: Option<EntityUpdate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub market: Option<EntityUpdate>,
}

impl BetslipUpdate {
    /// A message carrying neither entity: "no change" for this selection.
    pub fn unchanged(selection_id: SelectionId) -> Self {
        Self {
            selection_id,
            event: None,
            market: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.event.is_none() && self.market.is_none()
    }
}
