//! Market selection filtering and update message assembly.
//!
//! Markets publish changes for all their selections together. A customer
//! only sees the slice relevant to the selections actually in their
//! betslip, so merged market snapshots are narrowed per selection before
//! a [`BetslipUpdate`] is built.

use crate::types::{
    BetslipUpdate, EntityId, EntityUpdate, MergedEntity, SelectionId, SelectionRef,
};
use std::collections::HashMap;

/// Prefix of selection-scoped fields in a market changeset.
const SELECTION_FIELD_PREFIX: &str = "selections.";

/// Whether a market changeset field pertains to the given selection.
///
/// Fields keyed `selections.<selectionId>.<field>` belong to that one
/// selection; any other key is market-wide and pertains to every selection.
fn pertains_to_selection(field: &str, selection_id: &SelectionId) -> bool {
    match field.strip_prefix(SELECTION_FIELD_PREFIX) {
        Some(rest) => rest
            .strip_prefix(selection_id.as_str())
            .is_some_and(|tail| tail.starts_with('.')),
        None => true,
    }
}

/// Restrict a merged market to the fields relevant to one selection.
///
/// An empty filtered changeset means "no change" for that selection in
/// this window.
pub fn filter_market_for_selection(
    market: &MergedEntity,
    selection_id: &SelectionId,
) -> MergedEntity {
    MergedEntity {
        entity_id: market.entity_id.clone(),
        timestamp: market.timestamp,
        operation: market.operation,
        changeset: market
            .changeset
            .iter()
            .filter(|(field, _)| pertains_to_selection(field, selection_id))
            .map(|(field, value)| (field.clone(), value.clone()))
            .collect(),
    }
}

/// Assemble one [`BetslipUpdate`] per selection from merged snapshots.
///
/// With `include_unchanged` false (the streaming path), selections with no
/// changed event and no post-filter market change are omitted. With it
/// true (the one-shot query), every selection gets a message so callers
/// can observe "no change" explicitly.
pub fn build_updates(
    selections: &[SelectionRef],
    merged_events: &[MergedEntity],
    merged_markets: &[MergedEntity],
    include_unchanged: bool,
) -> Vec<BetslipUpdate> {
    let events: HashMap<&EntityId, &MergedEntity> =
        merged_events.iter().map(|m| (&m.entity_id, m)).collect();
    let markets: HashMap<&EntityId, &MergedEntity> =
        merged_markets.iter().map(|m| (&m.entity_id, m)).collect();

    let mut updates = Vec::new();
    for selection in selections {
        let event = events
            .get(&selection.event_id)
            .map(|&m| EntityUpdate::from(m.clone()));
        let market = markets.get(&selection.market_id).and_then(|&m| {
            let filtered = filter_market_for_selection(m, &selection.selection_id);
            if filtered.changeset.is_empty() {
                None
            } else {
                Some(EntityUpdate::from(filtered))
            }
        });

        if event.is_none() && market.is_none() && !include_unchanged {
            continue;
        }
        updates.push(BetslipUpdate {
            selection_id: selection.selection_id.clone(),
            event,
            market,
        });
    }

    updates
}
