//! Event system for container lifecycle notifications.
//!
//! [`EventBus`] is a typed publish/subscribe hub keyed by event name.
//! Listeners are either synchronous closures or async closures returning a
//! boxed future. Delivery is best-effort: a panicking synchronous listener or
//! a failing async listener is logged and never prevents the remaining
//! listeners from running.
//!
//! The bus is cheap to clone; all clones share the same listener table.
//! [`EventBus::create_namespace`] returns a thin facade that rewrites event
//! names to `"<ns>:<event>"` and delegates to the parent bus.

use crate::error::Result;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::warn;

// =============================================================================
// Event Names
// =============================================================================

/// Event names emitted by containers and the manager.
pub mod names {
    /// A container was created and registered.
    pub const CONTAINER_CREATED: &str = "container:created";
    /// A guest call failed.
    pub const CONTAINER_ERROR: &str = "container:error";
    /// A container stopped.
    pub const CONTAINER_STOP: &str = "container:stop";
    /// A container restarted with its state restored.
    pub const CONTAINER_RESTART: &str = "container:restart";
    /// A container swapped its module while preserving state.
    pub const CONTAINER_HOTRELOAD: &str = "container:hotreload";
    /// Periodic metrics snapshot.
    pub const CONTAINER_METRICS: &str = "container:metrics";
    /// Container state was updated.
    pub const STATE_CHANGE: &str = "state:change";
    /// Memory usage crossed the warning threshold.
    pub const MEMORY_WARNING: &str = "memory:warning";
    /// CPU usage heuristic crossed the threshold.
    pub const CPU_THRESHOLD: &str = "cpu:threshold";

    /// A container was removed from the registry.
    pub const MANAGER_CONTAINER_REMOVED: &str = "manager:container_removed";
    /// The manager restarted a container.
    pub const MANAGER_CONTAINER_RESTARTED: &str = "manager:container_restarted";
    /// The manager hot reloaded a container.
    pub const MANAGER_CONTAINER_HOTRELOADED: &str = "manager:container_hotreloaded";
    /// A replica was created and registered.
    pub const MANAGER_REPLICA_CREATED: &str = "manager:replica_created";
    /// A scale operation finished.
    pub const MANAGER_SCALED: &str = "manager:scaled";
    /// A container was deployed to docker.
    pub const MANAGER_DOCKER_DEPLOYED: &str = "manager:docker_deployed";
    /// Summary of a restart-all batch.
    pub const MANAGER_RESTART_ALL: &str = "manager:restart_all";
    /// The manager was cleaned up.
    pub const MANAGER_CLEANUP: &str = "manager:cleanup";
}

// =============================================================================
// Event
// =============================================================================

/// An ephemeral lifecycle event.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Event type, e.g. `container:created`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Container the event concerns, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
    /// Emission time.
    pub timestamp: DateTime<Utc>,
    /// Event-specific data.
    pub payload: serde_json::Value,
}

impl Event {
    /// Creates an event stamped with the current time.
    pub fn new(kind: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            kind: kind.into(),
            container_id: None,
            timestamp: Utc::now(),
            payload,
        }
    }

    /// Creates an event concerning a container.
    pub fn for_container(
        kind: impl Into<String>,
        container_id: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            container_id: Some(container_id.into()),
            ..Self::new(kind, payload)
        }
    }
}

// =============================================================================
// Listeners
// =============================================================================

/// Identifier of a registered listener, used with [`EventBus::off`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type SyncListener = Arc<dyn Fn(&Event) + Send + Sync>;
type AsyncListener = Arc<dyn Fn(Event) -> BoxFuture<'static, Result<()>> + Send + Sync>;

#[derive(Clone)]
enum Listener {
    Sync(SyncListener),
    Async(AsyncListener),
}

#[derive(Clone)]
struct Entry {
    id: ListenerId,
    listener: Listener,
}

#[derive(Default)]
struct Listeners {
    persistent: HashMap<String, Vec<Entry>>,
    once: HashMap<String, Vec<Entry>>,
}

impl Listeners {
    fn remove(&mut self, event: &str, id: ListenerId) -> bool {
        let mut removed = false;
        for table in [&mut self.persistent, &mut self.once] {
            if let Some(entries) = table.get_mut(event) {
                let before = entries.len();
                entries.retain(|e| e.id != id);
                removed |= entries.len() != before;
                if entries.is_empty() {
                    table.remove(event);
                }
            }
        }
        removed
    }
}

struct Inner {
    listeners: Mutex<Listeners>,
    next_id: AtomicU64,
}

/// Handle returned by [`EventBus::on`]; call [`Subscription::unsubscribe`]
/// to remove the listener. Dropping the handle keeps the listener active.
#[must_use = "dropping a subscription keeps the listener registered; call unsubscribe() to remove it"]
pub struct Subscription {
    event: String,
    id: ListenerId,
    bus: Weak<Inner>,
}

impl Subscription {
    /// Listener identifier.
    pub fn id(&self) -> ListenerId {
        self.id
    }

    /// Event name the listener is registered under.
    pub fn event(&self) -> &str {
        &self.event
    }

    /// Removes the listener. Returns false if it was already gone.
    pub fn unsubscribe(self) -> bool {
        match self.bus.upgrade() {
            Some(inner) => inner.listeners.lock().remove(&self.event, self.id),
            None => false,
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("event", &self.event)
            .field("id", &self.id)
            .finish()
    }
}

// =============================================================================
// Event Bus
// =============================================================================

/// Publish/subscribe hub for lifecycle events.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Inner>,
}

impl EventBus {
    /// Creates an empty event bus.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                listeners: Mutex::new(Listeners::default()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    fn register(&self, event: &str, listener: Listener, once: bool) -> Subscription {
        let id = ListenerId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        {
            let mut listeners = self.inner.listeners.lock();
            let table = if once {
                &mut listeners.once
            } else {
                &mut listeners.persistent
            };
            table
                .entry(event.to_string())
                .or_default()
                .push(Entry { id, listener });
        }
        Subscription {
            event: event.to_string(),
            id,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Registers a listener that fires on every emission of `event`.
    pub fn on<F>(&self, event: &str, callback: F) -> Subscription
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.register(event, Listener::Sync(Arc::new(callback)), false)
    }

    /// Registers an async listener that fires on every emission of `event`.
    pub fn on_async<F>(&self, event: &str, callback: F) -> Subscription
    where
        F: Fn(Event) -> BoxFuture<'static, Result<()>> + Send + Sync + 'static,
    {
        self.register(event, Listener::Async(Arc::new(callback)), false)
    }

    /// Registers a listener that fires on the next emission of `event` only.
    pub fn once<F>(&self, event: &str, callback: F) -> Subscription
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.register(event, Listener::Sync(Arc::new(callback)), true)
    }

    /// Removes a listener. Returns false if it was not registered.
    pub fn off(&self, event: &str, id: ListenerId) -> bool {
        self.inner.listeners.lock().remove(event, id)
    }

    /// Snapshots the listeners for `event`, taking all pending once-listeners.
    ///
    /// Once-listeners leave the table in the same critical section that
    /// snapshots them, so concurrent emissions can never fire one twice.
    fn snapshot(&self, event: &str) -> Vec<Entry> {
        let mut listeners = self.inner.listeners.lock();
        let mut entries = listeners
            .persistent
            .get(event)
            .cloned()
            .unwrap_or_default();
        if let Some(once) = listeners.once.remove(event) {
            entries.extend(once);
        }
        entries
    }

    /// Emits an event to all listeners registered under `event`.
    ///
    /// Synchronous listeners run inline. Async listeners are spawned on the
    /// current tokio runtime; outside a runtime they are skipped with a
    /// warning. Returns the number of listeners invoked.
    pub fn emit(&self, event: &str, data: Event) -> usize {
        let entries = self.snapshot(event);
        let mut invoked = 0;
        for entry in entries {
            match entry.listener {
                Listener::Sync(f) => {
                    invoke_sync(event, &f, &data);
                    invoked += 1;
                }
                Listener::Async(f) => match tokio::runtime::Handle::try_current() {
                    Ok(handle) => {
                        let fut = invoke_async(event.to_string(), f, data.clone());
                        handle.spawn(fut);
                        invoked += 1;
                    }
                    Err(_) => warn!(
                        event = %event,
                        "Skipping async listener: no tokio runtime available"
                    ),
                },
            }
        }
        invoked
    }

    /// Emits an event and waits for every listener to settle.
    ///
    /// A failing listener is logged and does not fail the aggregate.
    pub async fn emit_async(&self, event: &str, data: Event) {
        let entries = self.snapshot(event);
        let mut pending = Vec::new();
        for entry in entries {
            match entry.listener {
                Listener::Sync(f) => invoke_sync(event, &f, &data),
                Listener::Async(f) => {
                    pending.push(invoke_async(event.to_string(), f, data.clone()));
                }
            }
        }
        futures::future::join_all(pending).await;
    }

    /// Removes all listeners for `event`, or every listener when `None`.
    pub fn remove_all_listeners(&self, event: Option<&str>) {
        let mut listeners = self.inner.listeners.lock();
        match event {
            Some(event) => {
                listeners.persistent.remove(event);
                listeners.once.remove(event);
            }
            None => {
                listeners.persistent.clear();
                listeners.once.clear();
            }
        }
    }

    /// Number of listeners (persistent and once) registered for `event`.
    pub fn listener_count(&self, event: &str) -> usize {
        let listeners = self.inner.listeners.lock();
        listeners.persistent.get(event).map_or(0, Vec::len)
            + listeners.once.get(event).map_or(0, Vec::len)
    }

    /// Names of all events with at least one listener, sorted.
    pub fn event_names(&self) -> Vec<String> {
        let listeners = self.inner.listeners.lock();
        let mut names: Vec<String> = listeners
            .persistent
            .keys()
            .chain(listeners.once.keys())
            .cloned()
            .collect();
        names.sort();
        names.dedup();
        names
    }

    /// Returns a facade that prefixes event names with `"<ns>:"`.
    pub fn create_namespace(&self, namespace: impl Into<String>) -> EventNamespace {
        EventNamespace {
            bus: self.clone(),
            namespace: namespace.into(),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("events", &self.event_names())
            .finish()
    }
}

fn invoke_sync(event: &str, f: &SyncListener, data: &Event) {
    if std::panic::catch_unwind(AssertUnwindSafe(|| f(data))).is_err() {
        warn!(event = %event, "Event listener panicked");
    }
}

async fn invoke_async(event: String, f: AsyncListener, data: Event) {
    let outcome = AssertUnwindSafe(async move { f(data).await })
        .catch_unwind()
        .await;
    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(event = %event, error = %e, "Async event listener failed"),
        Err(_) => warn!(event = %event, "Async event listener panicked"),
    }
}

// =============================================================================
// Namespaces
// =============================================================================

/// Name-rewriting facade over a parent [`EventBus`].
///
/// Holds no listener storage of its own: `on("x")` registers `"<ns>:x"` on
/// the parent, so emitting `"<ns>:x"` on the parent reaches it.
#[derive(Clone, Debug)]
pub struct EventNamespace {
    bus: EventBus,
    namespace: String,
}

impl EventNamespace {
    /// Namespace prefix.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn qualify(&self, event: &str) -> String {
        format!("{}:{}", self.namespace, event)
    }

    /// See [`EventBus::on`].
    pub fn on<F>(&self, event: &str, callback: F) -> Subscription
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.bus.on(&self.qualify(event), callback)
    }

    /// See [`EventBus::once`].
    pub fn once<F>(&self, event: &str, callback: F) -> Subscription
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.bus.once(&self.qualify(event), callback)
    }

    /// See [`EventBus::off`].
    pub fn off(&self, event: &str, id: ListenerId) -> bool {
        self.bus.off(&self.qualify(event), id)
    }

    /// See [`EventBus::emit`].
    pub fn emit(&self, event: &str, data: Event) -> usize {
        self.bus.emit(&self.qualify(event), data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_listener_ids_are_unique() {
        let bus = EventBus::new();
        let a = bus.on("x", |_| {});
        let b = bus.on("x", |_| {});
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_panicking_listener_is_isolated() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let _bad = bus.on("x", |_| panic!("listener failure"));
        let counter = Arc::clone(&hits);
        let _good = bus.on("x", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit("x", Event::new("x", serde_json::Value::Null));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unsubscribe_after_bus_dropped() {
        let bus = EventBus::new();
        let sub = bus.on("x", |_| {});
        drop(bus);
        assert!(!sub.unsubscribe());
    }
}
