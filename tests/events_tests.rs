//! Tests for the event bus.
//!
//! Covers registration, once semantics, listener isolation, async delivery
//! and namespaces.

use futures::FutureExt;
use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use wasmhive::{Error, Event, EventBus};

fn counter() -> (Arc<AtomicUsize>, impl Fn(&Event) + Send + Sync + 'static) {
    let hits = Arc::new(AtomicUsize::new(0));
    let inner = Arc::clone(&hits);
    (hits, move |_: &Event| {
        inner.fetch_add(1, Ordering::SeqCst);
    })
}

// =============================================================================
// Registration Tests
// =============================================================================

#[test]
fn test_on_and_emit() {
    let bus = EventBus::new();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let _sub = bus.on("container:created", move |event| {
        sink.lock().push(event.clone());
    });

    let invoked = bus.emit(
        "container:created",
        Event::for_container("container:created", "c1", json!({"name": "counter"})),
    );

    assert_eq!(invoked, 1);
    let seen = seen.lock();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].container_id.as_deref(), Some("c1"));
    assert_eq!(seen[0].payload["name"], "counter");
}

#[test]
fn test_emit_without_listeners() {
    let bus = EventBus::new();
    assert_eq!(bus.emit("nothing", Event::new("nothing", json!(null))), 0);
}

#[test]
fn test_off_removes_listener() {
    let bus = EventBus::new();
    let (hits, listener) = counter();
    let sub = bus.on("x", listener);

    assert!(bus.off("x", sub.id()));
    assert!(!bus.off("x", sub.id()), "second removal finds nothing");

    bus.emit("x", Event::new("x", json!(null)));
    assert_eq!(hits.load(Ordering::SeqCst), 0);
}

#[test]
fn test_subscription_unsubscribe() {
    let bus = EventBus::new();
    let (hits, listener) = counter();
    let sub = bus.on("x", listener);
    assert_eq!(sub.event(), "x");

    assert!(sub.unsubscribe());
    bus.emit("x", Event::new("x", json!(null)));
    assert_eq!(hits.load(Ordering::SeqCst), 0);
    assert_eq!(bus.listener_count("x"), 0);
}

#[test]
fn test_once_fires_exactly_once() {
    let bus = EventBus::new();
    let (hits, listener) = counter();
    let _sub = bus.once("x", listener);
    assert_eq!(bus.listener_count("x"), 1);

    bus.emit("x", Event::new("x", json!(1)));
    bus.emit("x", Event::new("x", json!(2)));

    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert_eq!(bus.listener_count("x"), 0);
}

#[test]
fn test_listener_added_during_emit_does_not_fire() {
    let bus = EventBus::new();
    let (hits, listener) = counter();
    let listener = Arc::new(listener);
    let inner_bus = bus.clone();
    let _sub = bus.once("x", move |_| {
        let listener = Arc::clone(&listener);
        let _late = inner_bus.on("x", move |e| listener(e));
    });

    bus.emit("x", Event::new("x", json!(null)));
    assert_eq!(hits.load(Ordering::SeqCst), 0);

    bus.emit("x", Event::new("x", json!(null)));
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

// =============================================================================
// Isolation Tests
// =============================================================================

#[test]
fn test_panicking_listener_does_not_block_others() {
    let bus = EventBus::new();
    let (hits, listener) = counter();
    let _bad = bus.on("x", |_| panic!("boom"));
    let _good = bus.on("x", listener);

    let invoked = bus.emit("x", Event::new("x", json!(null)));
    assert_eq!(invoked, 2);
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_emit_async_waits_for_listeners() {
    let bus = EventBus::new();
    let hits = Arc::new(AtomicUsize::new(0));
    let inner = Arc::clone(&hits);
    let _sub = bus.on_async("x", move |_| {
        let inner = Arc::clone(&inner);
        async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            inner.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        .boxed()
    });

    bus.emit_async("x", Event::new("x", json!(null))).await;
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_failing_async_listener_is_isolated() {
    let bus = EventBus::new();
    let (hits, listener) = counter();
    let _bad = bus.on_async("x", |_| {
        async { Err(Error::Internal("listener failed".to_string())) }.boxed()
    });
    let _good = bus.on("x", listener);

    bus.emit_async("x", Event::new("x", json!(null))).await;
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_emit_spawns_async_listeners() {
    let bus = EventBus::new();
    let (tx, rx) = tokio::sync::oneshot::channel();
    let tx = Arc::new(Mutex::new(Some(tx)));
    let _sub = bus.on_async("x", move |event| {
        let tx = Arc::clone(&tx);
        async move {
            if let Some(tx) = tx.lock().take() {
                let _ = tx.send(event.kind);
            }
            Ok(())
        }
        .boxed()
    });

    assert_eq!(bus.emit("x", Event::new("x", json!(null))), 1);
    let kind = tokio::time::timeout(Duration::from_secs(1), rx)
        .await
        .expect("listener should run")
        .expect("sender kept");
    assert_eq!(kind, "x");
}

// =============================================================================
// Introspection Tests
// =============================================================================

#[test]
fn test_listener_count_and_event_names() {
    let bus = EventBus::new();
    let _a = bus.on("b:event", |_| {});
    let _b = bus.on("a:event", |_| {});
    let _c = bus.once("a:event", |_| {});

    assert_eq!(bus.listener_count("a:event"), 2);
    assert_eq!(bus.listener_count("b:event"), 1);
    assert_eq!(bus.event_names(), vec!["a:event", "b:event"]);
}

#[test]
fn test_remove_all_listeners() {
    let bus = EventBus::new();
    let _a = bus.on("a", |_| {});
    let _b = bus.on("b", |_| {});

    bus.remove_all_listeners(Some("a"));
    assert_eq!(bus.event_names(), vec!["b"]);

    bus.remove_all_listeners(None);
    assert!(bus.event_names().is_empty());
}

// =============================================================================
// Namespace Tests
// =============================================================================

#[test]
fn test_namespace_prefixes_events() {
    let bus = EventBus::new();
    let ns = bus.create_namespace("plugin");
    assert_eq!(ns.namespace(), "plugin");

    let (hits, listener) = counter();
    let _sub = ns.on("ready", listener);

    assert_eq!(bus.listener_count("plugin:ready"), 1);
    bus.emit("plugin:ready", Event::new("plugin:ready", json!(null)));
    ns.emit("ready", Event::new("plugin:ready", json!(null)));
    bus.emit("ready", Event::new("ready", json!(null)));

    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

#[test]
fn test_namespace_off() {
    let bus = EventBus::new();
    let ns = bus.create_namespace("plugin");
    let sub = ns.on("ready", |_| {});

    assert!(ns.off("ready", sub.id()));
    assert_eq!(bus.listener_count("plugin:ready"), 0);
}

#[test]
fn test_event_serializes_with_type_key() {
    let event = Event::for_container("container:stop", "c1", json!({}));
    let value = serde_json::to_value(&event).unwrap();

    assert_eq!(value["type"], "container:stop");
    assert_eq!(value["containerId"], "c1");
    assert!(value.get("timestamp").is_some());
}
