//! Event Store scenarios: optimistic concurrency conflicts on append, and a
//! catch-up subscription that replays history before switching to live
//! delivery of newly-appended events.

use std::collections::BTreeMap;
use std::sync::Arc;

use ensemble_runtime::config::EventStoreConfig;
use ensemble_runtime::context::Context;
use ensemble_runtime::error::RuntimeError;
use ensemble_runtime::eventstore::model::NewEvent;
use ensemble_runtime::eventstore::subscription::{SubscriptionMessage, SubscriptionMode, SubscriptionTarget};
use ensemble_runtime::eventstore::EventStore;
use ensemble_runtime::testsupport::InMemoryStorage;

fn new_event(event_type: &str) -> NewEvent {
    NewEvent {
        event_type: event_type.to_string(),
        payload: event_type.as_bytes().to_vec(),
        metadata: BTreeMap::new(),
        correlation_id: None,
        causation_id: None,
    }
}

fn store() -> EventStore<InMemoryStorage> {
    EventStore::new(Arc::new(InMemoryStorage::new()), Context::system(), EventStoreConfig::default())
}

#[tokio::test]
async fn append_with_stale_expected_version_is_rejected() {
    let store = store();

    let first = store.append("orders-1", vec![new_event("OrderCreated")], -1).await.expect("first append succeeds");
    assert_eq!(first.new_version, 1);

    // A second writer still believes the stream is empty.
    let err = store
        .append("orders-1", vec![new_event("OrderCancelled")], 0)
        .await
        .expect_err("stale expected_version must be rejected");
    match err {
        RuntimeError::ConcurrencyConflict { expected, actual } => {
            assert_eq!(expected, 0);
            assert_eq!(actual, 1);
        }
        other => panic!("expected ConcurrencyConflict, got {other:?}"),
    }

    // The correct expected_version still succeeds, and the stream was left
    // untouched by the rejected append.
    let second = store.append("orders-1", vec![new_event("OrderCancelled")], 1).await.expect("correct expected_version succeeds");
    assert_eq!(second.new_version, 2);

    let read = store.read_stream("orders-1", 0, 10).await.expect("read back");
    assert_eq!(read.events.len(), 2);
    assert_eq!(read.events[0].event_type, "OrderCreated");
    assert_eq!(read.events[1].event_type, "OrderCancelled");
}

#[tokio::test]
async fn unconditional_append_ignores_current_version() {
    let store = store();
    store.append("orders-2", vec![new_event("A")], -1).await.unwrap();
    // -1 means "don't care"; it must succeed regardless of current version.
    let result = store.append("orders-2", vec![new_event("B")], -1).await;
    assert!(result.is_ok());
}

#[tokio::test]
async fn catch_up_subscription_replays_then_switches_to_live() {
    let store = Arc::new(store());

    for i in 0..5 {
        store.append("widgets-1", vec![new_event(&format!("Tick{i}"))], -1).await.unwrap();
    }

    let (_id, mut rx) = store
        .subscribe(SubscriptionTarget::Stream("widgets-1".to_string()), SubscriptionMode::CatchUp, 0)
        .await
        .expect("subscribe");

    // The five historical events arrive first, in stream order.
    for i in 0..5 {
        match rx.recv().await.expect("historical event") {
            SubscriptionMessage::Event(e) => assert_eq!(e.event_type, format!("Tick{i}")),
            other => panic!("expected Event, got {other:?}"),
        }
    }

    // Then a CaughtUp marker before anything live.
    match rx.recv().await.expect("caught up marker") {
        SubscriptionMessage::CaughtUp => {}
        other => panic!("expected CaughtUp, got {other:?}"),
    }

    // Appends after registration are delivered live, without re-reading.
    store.append("widgets-1", vec![new_event("Live0")], -1).await.unwrap();
    match rx.recv().await.expect("live event") {
        SubscriptionMessage::Event(e) => assert_eq!(e.event_type, "Live0"),
        other => panic!("expected Event, got {other:?}"),
    }
}

#[tokio::test]
async fn appended_events_verify_and_tampered_ones_do_not() {
    let store = store();
    store.append("s-1", vec![new_event("First")], -1).await.unwrap();

    let read = store.read_stream("s-1", 0, 10).await.expect("clean read");
    let mut event = read.events[0].clone();
    assert!(event.verify_checksum());

    event.payload = b"tampered".to_vec();
    assert!(!event.verify_checksum());
}
