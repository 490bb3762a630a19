//! One-shot delta query: "what changed since timestamp T".
//!
//! Polling-style callers use this instead of the continuous stream. It
//! shares the merge and filter pipeline but has no lifecycle: two
//! point-in-time fetches, one pass, done.

use crate::error::Result;
use crate::merge::merge_changes;
use crate::message::build_updates;
use crate::source::{ChangeSource, EntityCollection};
use crate::types::{BetslipUpdate, EntityId, SelectionRef, Timestamp};
use std::collections::HashSet;
use tracing::debug;

/// Fetch and merge every change to the selections' entities after `after`.
///
/// Returns one message per selection, **including** selections with no
/// change (neither `event` nor `market` set) — unlike the stream, which
/// omits them. The one-shot query is a complete answer to "what changed
/// since T"; the stream is an incremental delta feed.
///
/// Upstream failures surface directly to the caller; there is no
/// listener to isolate here.
pub fn fetch_betslip_updates(
    source: &dyn ChangeSource,
    selections: &[SelectionRef],
    after: Timestamp,
) -> Result<Vec<BetslipUpdate>> {
    let event_ids = unique_ids(selections.iter().map(|s| &s.event_id));
    let market_ids = unique_ids(selections.iter().map(|s| &s.market_id));

    let events = source.fetch_changes(EntityCollection::Events, &event_ids, after)?;
    let markets = source.fetch_changes(EntityCollection::Markets, &market_ids, after)?;
    debug!(
        selections = selections.len(),
        events = events.len(),
        markets = markets.len(),
        "one-shot delta fetch"
    );

    let merged_events = merge_changes(events);
    let merged_markets = merge_changes(markets);

    Ok(build_updates(
        selections,
        &merged_events,
        &merged_markets,
        true,
    ))
}

fn unique_ids<'a>(ids: impl Iterator<Item = &'a EntityId>) -> Vec<EntityId> {
    let mut seen = HashSet::new();
    ids.filter(|id| seen.insert((*id).clone())).cloned().collect()
}
