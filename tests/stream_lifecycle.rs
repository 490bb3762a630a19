//! Integration tests for stream lifecycle and fan-out.

use proptest::prelude::*;
use serde_json::json;
use slipstream::{
    ChangeOperation, ChangeRecord, CustomerId, EntityCollection, EntityId, Listener, ListenerId,
    MemoryChangeSource, SelectionRef, StreamConfig, StreamManager, Timestamp,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

const FLUSH: Duration = Duration::from_millis(20);
const WAIT: Duration = Duration::from_millis(500);

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn test_manager(source: &MemoryChangeSource) -> StreamManager {
    StreamManager::with_config(
        Arc::new(source.clone()),
        StreamConfig {
            flush_interval: FLUSH,
        },
    )
}

fn record(entity_id: &str, timestamp: i64, changeset: serde_json::Value) -> ChangeRecord {
    ChangeRecord {
        entity_id: EntityId::new(entity_id),
        timestamp: Timestamp(timestamp),
        operation: ChangeOperation::Update,
        changeset: changeset.as_object().cloned().unwrap_or_default(),
    }
}

// --- Scenario Tests ---

#[test]
fn test_event_change_reaches_subscriber_with_exact_shape() {
    init_tracing();
    let source = MemoryChangeSource::new();
    let manager = test_manager(&source);

    let selections = vec![SelectionRef::new("a", "E1", "M1")];
    let (listener, handle) = Listener::channel(ListenerId(1), 16);
    manager
        .attach(CustomerId(1), selections, Timestamp(0), listener)
        .unwrap();

    source.publish(
        EntityCollection::Events,
        record("E1", 100, json!({"status": "live"})),
    );

    let batch = handle.recv_timeout(WAIT).unwrap();
    let wire = serde_json::to_value(&batch).unwrap();
    assert_eq!(
        wire,
        json!([{
            "selectionId": "a",
            "event": {
                "changeset": {"status": "live"},
                "timestamp": 100,
                "operation": "Update"
            }
        }])
    );
}

#[test]
fn test_fan_out_is_fair_across_listeners() {
    init_tracing();
    let source = MemoryChangeSource::new();
    let manager = test_manager(&source);

    let selections = vec![SelectionRef::new("a", "E1", "M1")];
    let handles: Vec<_> = (1..=3)
        .map(|i| {
            let (listener, handle) = Listener::channel(ListenerId(i), 16);
            manager
                .attach(CustomerId(1), selections.clone(), Timestamp(0), listener)
                .unwrap();
            handle
        })
        .collect();

    source.publish(
        EntityCollection::Markets,
        record("M1", 50, json!({"selections.a.odds": 2.1})),
    );

    let batches: Vec<_> = handles
        .iter()
        .map(|h| h.recv_timeout(WAIT).unwrap())
        .collect();
    assert!(batches.windows(2).all(|pair| pair[0] == pair[1]));
    assert_eq!(batches[0].len(), 1);
}

#[test]
fn test_resubscribe_preserves_listeners() {
    init_tracing();
    let source = MemoryChangeSource::new();
    let manager = test_manager(&source);

    let old = vec![SelectionRef::new("a", "E1", "M1")];
    let (l1, h1) = Listener::channel(ListenerId(1), 16);
    let (l2, h2) = Listener::channel(ListenerId(2), 16);
    manager
        .attach(CustomerId(1), old.clone(), Timestamp(0), l1)
        .unwrap();
    manager.attach(CustomerId(1), old, Timestamp(0), l2).unwrap();

    // Selection set changes underneath the live stream.
    let new = vec![SelectionRef::new("b", "E2", "M2")];
    manager.resubscribe(CustomerId(1), new);

    assert_eq!(manager.listener_count(CustomerId(1)), 2);

    // Both original connections receive flushes from the rebuilt feed
    // without ever having re-attached. Timestamps must beat the
    // resubscribe "now" cutoff.
    let ts = Timestamp::now().0 + 10_000;
    source.publish(
        EntityCollection::Events,
        record("E2", ts, json!({"status": "live"})),
    );

    let b1 = h1.recv_timeout(WAIT).unwrap();
    let b2 = h2.recv_timeout(WAIT).unwrap();
    assert_eq!(b1, b2);
    assert_eq!(b1[0].selection_id.as_str(), "b");
}

#[test]
fn test_resubscribe_drops_interest_in_old_entities() {
    init_tracing();
    let source = MemoryChangeSource::new();
    let manager = test_manager(&source);

    let (listener, handle) = Listener::channel(ListenerId(1), 16);
    manager
        .attach(
            CustomerId(1),
            vec![SelectionRef::new("a", "E1", "M1")],
            Timestamp(0),
            listener,
        )
        .unwrap();
    manager.resubscribe(CustomerId(1), vec![SelectionRef::new("b", "E2", "M2")]);

    // A change to the old entity no longer produces a batch.
    let ts = Timestamp::now().0 + 10_000;
    source.publish(
        EntityCollection::Events,
        record("E1", ts, json!({"status": "live"})),
    );

    assert!(handle.recv_timeout(FLUSH * 4).is_err());
}

#[test]
fn test_resubscribe_without_stream_is_noop() {
    let source = MemoryChangeSource::new();
    let manager = test_manager(&source);

    manager.resubscribe(CustomerId(1), vec![SelectionRef::new("a", "E1", "M1")]);
    assert_eq!(manager.stream_count(), 0);
    assert_eq!(source.tail_count(), 0);
}

#[test]
fn test_changes_across_windows_arrive_as_separate_batches() {
    init_tracing();
    let source = MemoryChangeSource::new();
    let manager = test_manager(&source);

    let (listener, handle) = Listener::channel(ListenerId(1), 16);
    manager
        .attach(
            CustomerId(1),
            vec![SelectionRef::new("a", "E1", "M1")],
            Timestamp(0),
            listener,
        )
        .unwrap();

    source.publish(
        EntityCollection::Events,
        record("E1", 10, json!({"status": "live"})),
    );
    let first = handle.recv_timeout(WAIT).unwrap();
    assert_eq!(first[0].event.as_ref().unwrap().changeset["status"], "live");

    source.publish(
        EntityCollection::Events,
        record("E1", 20, json!({"score": "1-0"})),
    );
    let second = handle.recv_timeout(WAIT).unwrap();
    // The second window only carries the second change.
    assert!(!second[0]
        .event
        .as_ref()
        .unwrap()
        .changeset
        .contains_key("status"));
    assert_eq!(second[0].event.as_ref().unwrap().changeset["score"], "1-0");
}

#[test]
fn test_new_listener_gets_next_flush_not_history() {
    init_tracing();
    let source = MemoryChangeSource::new();
    let manager = test_manager(&source);

    let selections = vec![SelectionRef::new("a", "E1", "M1")];
    let (l1, h1) = Listener::channel(ListenerId(1), 16);
    manager
        .attach(CustomerId(1), selections.clone(), Timestamp(0), l1)
        .unwrap();

    source.publish(
        EntityCollection::Events,
        record("E1", 10, json!({"status": "live"})),
    );
    h1.recv_timeout(WAIT).unwrap();

    // Attach a second listener after the first flush already went out.
    let (l2, h2) = Listener::channel(ListenerId(2), 16);
    manager
        .attach(CustomerId(1), selections, Timestamp(0), l2)
        .unwrap();

    // No backfill of the already-flushed window.
    assert!(h2.recv_timeout(FLUSH * 4).is_err());

    source.publish(
        EntityCollection::Events,
        record("E1", 20, json!({"score": "1-0"})),
    );
    let batch = h2.recv_timeout(WAIT).unwrap();
    assert_eq!(batch[0].event.as_ref().unwrap().changeset["score"], "1-0");
}

// --- Lifecycle Property ---

#[derive(Clone, Debug)]
enum LifecycleOp {
    Attach { customer: i64, listener: u64 },
    Detach { customer: i64, listener: u64 },
}

fn arb_op() -> impl Strategy<Value = LifecycleOp> {
    let customer = 0i64..3;
    let listener = 0u64..4;
    prop_oneof![
        (customer.clone(), listener.clone())
            .prop_map(|(customer, listener)| LifecycleOp::Attach { customer, listener }),
        (customer, listener).prop_map(|(customer, listener)| LifecycleOp::Detach {
            customer,
            listener
        }),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// After any attach/detach sequence, a stream exists for a customer
    /// if and only if it has listeners.
    #[test]
    fn prop_stream_exists_iff_listeners(ops in prop::collection::vec(arb_op(), 1..16)) {
        let source = MemoryChangeSource::new();
        let manager = test_manager(&source);
        let selections = vec![SelectionRef::new("a", "E1", "M1")];

        // Model of expected listener sets, plus handles kept alive so
        // delivery channels stay open.
        let mut expected: HashMap<i64, Vec<u64>> = HashMap::new();
        let mut handles = Vec::new();

        for op in ops {
            match op {
                LifecycleOp::Attach { customer, listener } => {
                    let (l, h) = Listener::channel(ListenerId(listener), 16);
                    let attached = manager
                        .attach(CustomerId(customer), selections.clone(), Timestamp(0), l)
                        .is_ok();
                    let entry = expected.entry(customer).or_default();
                    if entry.contains(&listener) {
                        // Duplicate attach must have been rejected.
                        prop_assert!(!attached);
                    } else {
                        prop_assert!(attached);
                        entry.push(listener);
                        handles.push(h);
                    }
                }
                LifecycleOp::Detach { customer, listener } => {
                    manager.detach(CustomerId(customer), ListenerId(listener));
                    if let Some(entry) = expected.get_mut(&customer) {
                        entry.retain(|&l| l != listener);
                    }
                }
            }

            for customer in 0..3 {
                let want = expected.get(&customer).map_or(0, |e| e.len());
                prop_assert_eq!(manager.listener_count(CustomerId(customer)), want);
                prop_assert_eq!(manager.has_stream(CustomerId(customer)), want > 0);
            }
        }

        // Two tails per customer that still has listeners, none else.
        let live = expected.values().filter(|e| !e.is_empty()).count();
        prop_assert_eq!(source.tail_count(), live * 2);
    }
}
