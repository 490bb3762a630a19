//! Delta merge: folds a window of change records into per-entity snapshots.

use crate::types::{ChangeRecord, EntityId, MergedEntity};
use std::collections::HashMap;
use tracing::warn;

/// Fold an ordered sequence of change records into one [`MergedEntity`] per
/// distinct entity, in first-appearance order.
///
/// Only the **last** record's timestamp and operation survive, but the
/// changeset is the union of every field seen, later value winning per
/// field. Input order must be arrival order, not a sort by timestamp, so
/// that last-write-wins matches what the source actually emitted.
///
/// Entities whose accumulated changeset ends up empty (e.g. delete-only
/// records with no field payload) are kept; callers that treat them as
/// noise filter them out.
pub fn merge_changes(records: impl IntoIterator<Item = ChangeRecord>) -> Vec<MergedEntity> {
    let mut merged: Vec<MergedEntity> = Vec::new();
    let mut by_entity: HashMap<EntityId, usize> = HashMap::new();

    for record in records {
        if record.entity_id.as_str().is_empty() {
            warn!("dropping change record with empty entity id");
            continue;
        }

        match by_entity.get(&record.entity_id) {
            Some(&index) => {
                let entry = &mut merged[index];
                entry.timestamp = record.timestamp;
                entry.operation = record.operation;
                for (field, value) in record.changeset {
                    entry.changeset.insert(field, value);
                }
            }
            None => {
                by_entity.insert(record.entity_id.clone(), merged.len());
                merged.push(MergedEntity {
                    entity_id: record.entity_id,
                    timestamp: record.timestamp,
                    operation: record.operation,
                    changeset: record.changeset,
                });
            }
        }
    }

    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChangeOperation, Changeset, EntityId, Timestamp};
    use proptest::prelude::*;
    use serde_json::json;

    fn record(
        entity_id: &str,
        timestamp: i64,
        operation: ChangeOperation,
        changeset: serde_json::Value,
    ) -> ChangeRecord {
        ChangeRecord {
            entity_id: EntityId::new(entity_id),
            timestamp: Timestamp(timestamp),
            operation,
            changeset: changeset.as_object().cloned().unwrap_or_default(),
        }
    }

    #[test]
    fn test_last_value_wins_per_field() {
        let merged = merge_changes(vec![
            record("M1", 50, ChangeOperation::Update, json!({"odds": 1.5})),
            record("M1", 60, ChangeOperation::Update, json!({"odds": 1.8})),
        ]);

        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].changeset["odds"], json!(1.8));
        assert_eq!(merged[0].timestamp, Timestamp(60));
    }

    #[test]
    fn test_changeset_is_union_of_fields() {
        let merged = merge_changes(vec![
            record("E1", 10, ChangeOperation::Update, json!({"status": "live"})),
            record("E1", 20, ChangeOperation::Update, json!({"score": "1-0"})),
        ]);

        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].changeset["status"], "live");
        assert_eq!(merged[0].changeset["score"], "1-0");
        assert_eq!(merged[0].operation, ChangeOperation::Update);
    }

    #[test]
    fn test_arrival_order_beats_timestamp_order() {
        // A record with an older timestamp arriving later still wins.
        let merged = merge_changes(vec![
            record("E1", 100, ChangeOperation::Update, json!({"status": "live"})),
            record("E1", 90, ChangeOperation::Update, json!({"status": "suspended"})),
        ]);

        assert_eq!(merged[0].changeset["status"], "suspended");
        assert_eq!(merged[0].timestamp, Timestamp(90));
    }

    #[test]
    fn test_entities_keep_first_appearance_order() {
        let merged = merge_changes(vec![
            record("E2", 1, ChangeOperation::Update, json!({"a": 1})),
            record("E1", 2, ChangeOperation::Update, json!({"b": 2})),
            record("E2", 3, ChangeOperation::Update, json!({"c": 3})),
        ]);

        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].entity_id, EntityId::new("E2"));
        assert_eq!(merged[1].entity_id, EntityId::new("E1"));
    }

    #[test]
    fn test_last_operation_survives() {
        let merged = merge_changes(vec![
            record("E1", 10, ChangeOperation::Insert, json!({"status": "open"})),
            record("E1", 20, ChangeOperation::Delete, json!({})),
        ]);

        assert_eq!(merged[0].operation, ChangeOperation::Delete);
        // Delete with no payload keeps the earlier fields.
        assert_eq!(merged[0].changeset["status"], "open");
    }

    #[test]
    fn test_delete_only_entity_kept_with_empty_changeset() {
        let merged = merge_changes(vec![record("E1", 10, ChangeOperation::Delete, json!({}))]);

        assert_eq!(merged.len(), 1);
        assert!(merged[0].changeset.is_empty());
        assert_eq!(merged[0].operation, ChangeOperation::Delete);
    }

    #[test]
    fn test_malformed_record_skipped() {
        let merged = merge_changes(vec![
            record("", 10, ChangeOperation::Update, json!({"status": "live"})),
            record("E1", 20, ChangeOperation::Update, json!({"score": "1-0"})),
        ]);

        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].entity_id, EntityId::new("E1"));
    }

    // --- Property: merging is batch-associative ---

    fn arb_record() -> impl Strategy<Value = ChangeRecord> {
        (
            prop::sample::select(vec!["E1", "E2", "M1"]),
            0i64..1000,
            prop::sample::select(vec![
                ChangeOperation::Insert,
                ChangeOperation::Update,
                ChangeOperation::Delete,
            ]),
            prop::collection::btree_map(
                prop::sample::select(vec!["odds", "status", "score"]),
                0u32..100,
                0..3,
            ),
        )
            .prop_map(|(entity, ts, op, fields)| {
                let mut changeset = Changeset::new();
                for (field, value) in fields {
                    changeset.insert(field.to_string(), json!(value));
                }
                ChangeRecord {
                    entity_id: EntityId::new(entity),
                    timestamp: Timestamp(ts),
                    operation: op,
                    changeset,
                }
            })
    }

    fn as_records(merged: Vec<MergedEntity>) -> Vec<ChangeRecord> {
        merged
            .into_iter()
            .map(|m| ChangeRecord {
                entity_id: m.entity_id,
                timestamp: m.timestamp,
                operation: m.operation,
                changeset: m.changeset,
            })
            .collect()
    }

    proptest! {
        /// merge(merge(A) ++ B) == merge(A ++ B) for sequential windows.
        #[test]
        fn prop_merge_of_merged_prefix(
            a in prop::collection::vec(arb_record(), 0..20),
            b in prop::collection::vec(arb_record(), 0..20),
        ) {
            let mut combined = a.clone();
            combined.extend(b.clone());

            let mut folded = as_records(merge_changes(a));
            folded.extend(b);

            prop_assert_eq!(merge_changes(folded), merge_changes(combined));
        }
    }
}
