//! # Container Instances
//!
//! A [`ContainerInstance`] is one governed execution unit: a guest instance
//! produced by a [`Runtime`], plus state, metrics and lifecycle.
//!
//! ## State Machine
//!
//! ```text
//!                 success
//!   Starting ───────────────► Running ──stop──► Stopping ──► Stopped
//!      │                        ▲  │
//!      │ failure                │  └──hot_reload (stays Running)
//!      ▼                        │
//!    Error        restart: * ──► Stopped ──► Starting ──► Running
//! ```
//!
//! ## Call Governance
//!
//! Every [`ContainerInstance::call`] runs these checks in order before the
//! guest is touched:
//!
//! | Check    | Rejects with                  | Condition                              |
//! |----------|-------------------------------|----------------------------------------|
//! | status   | `InvalidState`                | status is not `Running`                |
//! | CPU time | `Timeout`                     | uptime exceeds `max_cpu_time`          |
//! | memory   | `MemoryLimitExceeded`         | linear memory exceeds `max_memory`     |
//! | security | `SecurityViolation`           | not whitelisted, or `fs_*`/`net_*` denied |
//! | export   | `FunctionNotFound`            | no such export                         |
//!
//! The guest call itself runs on a blocking thread and races the call
//! timeout. A timed-out call is interrupted at its next epoch check, which
//! releases the store for later calls; its result is discarded. Call
//! failures never change `status`.

use crate::config::ContainerConfig;
use crate::constants::{
    CPU_THRESHOLD_PERCENT, MEMORY_WARNING_RATIO, RESTART_GRACE_PERIOD, WASM_PAGE_SIZE,
    validate_container_id,
};
use crate::error::{Error, Result};
use crate::events::{Event, EventBus, names};
use crate::guest::{GuestInstance, WasmValue};
use crate::runtime::{Runtime, RuntimeBackend};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use wasmtime::Module;

/// Container state: a JSON object merged shallowly by `update_state`.
pub type State = serde_json::Map<String, Value>;

type StateCallback = Arc<dyn Fn(&State) + Send + Sync>;

// =============================================================================
// Status & Snapshots
// =============================================================================

/// Lifecycle status of a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    Starting,
    Running,
    Paused,
    Stopping,
    Stopped,
    Error,
}

impl std::fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// Linear memory accounting in bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryUsage {
    /// Current linear memory size.
    pub used: u64,
    /// Bytes the store may grow to (page-rounded limit).
    pub allocated: u64,
    /// Largest `used` observed.
    pub peak: u64,
    /// Configured limit.
    pub limit: u64,
}

/// Snapshot of a container's metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerMetrics {
    /// Heuristic CPU usage in percent, derived from the last call duration.
    pub cpu_usage: f64,
    pub memory_usage: MemoryUsage,
    pub uptime_ms: u64,
    pub call_count: u64,
    pub error_count: u64,
    pub last_activity: Option<DateTime<Utc>>,
}

/// Result of a health check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthStatus {
    pub healthy: bool,
    pub last_check: DateTime<Utc>,
    pub details: HealthDetails,
}

/// Health check details. `error` is set instead of the figures when the
/// check itself failed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthDetails {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<ContainerStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uptime_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_usage: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_limit: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub call_count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Identity and placement of a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    pub version: String,
    pub backend: RuntimeBackend,
    pub status: ContainerStatus,
    pub created_at: DateTime<Utc>,
    /// Hex SHA-256 of the module bytes, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub module_digest: Option<String>,
}

/// CPU usage heuristic: percent of one second spent in the last call, capped
/// at 100.
pub(crate) fn cpu_usage_percent(elapsed: Duration) -> f64 {
    (elapsed.as_secs_f64() * 100.0).min(100.0)
}

/// Generates a container id: `<name>-<unix millis>-<8 hex chars>`.
pub fn generate_container_id(name: &str) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}-{}", name, Utc::now().timestamp_millis(), &suffix[..8])
}

// =============================================================================
// Subscribers
// =============================================================================

#[derive(Default)]
struct Subscribers {
    next_id: u64,
    callbacks: Vec<(u64, StateCallback)>,
}

/// Handle returned by [`ContainerInstance::subscribe`].
#[must_use = "dropping a subscription keeps the callback registered; call unsubscribe() to remove it"]
pub struct StateSubscription {
    id: u64,
    subscribers: Weak<Mutex<Subscribers>>,
}

impl StateSubscription {
    /// Removes the callback. Returns false if it was already gone.
    pub fn unsubscribe(self) -> bool {
        let Some(subscribers) = self.subscribers.upgrade() else {
            return false;
        };
        let mut subscribers = subscribers.lock();
        let before = subscribers.callbacks.len();
        subscribers.callbacks.retain(|(id, _)| *id != self.id);
        subscribers.callbacks.len() != before
    }
}

impl std::fmt::Debug for StateSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateSubscription").field("id", &self.id).finish()
    }
}

// =============================================================================
// Container Instance
// =============================================================================

/// Inputs for [`ContainerInstance::create`].
pub struct InstanceOptions {
    /// Container id. Generated from `name` when `None`.
    pub id: Option<String>,
    pub name: String,
    /// Runtime the guest is instantiated with; its config governs the container.
    pub runtime: Arc<dyn Runtime>,
    pub module: Module,
    pub module_digest: Option<String>,
    pub events: EventBus,
}

#[derive(Debug, Default)]
struct Counters {
    cpu_usage: f64,
    peak: u64,
    call_count: u64,
    error_count: u64,
    last_activity: Option<DateTime<Utc>>,
}

/// One governed guest container.
pub struct ContainerInstance {
    id: String,
    name: String,
    config: ContainerConfig,
    runtime: Arc<dyn Runtime>,
    module: RwLock<Module>,
    module_digest: RwLock<Option<String>>,
    guest: RwLock<Option<Arc<GuestInstance>>>,
    status: watch::Sender<ContainerStatus>,
    state: RwLock<State>,
    subscribers: Arc<Mutex<Subscribers>>,
    counters: Mutex<Counters>,
    started_at: Mutex<Instant>,
    created_at: DateTime<Utc>,
    memory_warned: AtomicBool,
    events: EventBus,
    /// Serializes stop, restart and hot reload.
    lifecycle: tokio::sync::Mutex<()>,
    metrics_task: Mutex<Option<JoinHandle<()>>>,
}

impl ContainerInstance {
    /// Creates and initializes a container.
    ///
    /// The instance starts in `Starting`; on failure it moves to `Error` and
    /// the cause is returned.
    pub async fn create(options: InstanceOptions) -> Result<Arc<Self>> {
        let id = options
            .id
            .unwrap_or_else(|| generate_container_id(&options.name));

        // SECURITY: Validate container ID format
        validate_container_id(&id).map_err(|reason| Error::InvalidContainerId {
            id: id.clone(),
            reason: reason.to_string(),
        })?;

        let (status, _) = watch::channel(ContainerStatus::Starting);
        let instance = Arc::new(Self {
            config: options.runtime.config().clone(),
            id,
            name: options.name,
            runtime: options.runtime,
            module: RwLock::new(options.module),
            module_digest: RwLock::new(options.module_digest),
            guest: RwLock::new(None),
            status,
            state: RwLock::new(State::new()),
            subscribers: Arc::new(Mutex::new(Subscribers::default())),
            counters: Mutex::new(Counters::default()),
            started_at: Mutex::new(Instant::now()),
            created_at: Utc::now(),
            memory_warned: AtomicBool::new(false),
            events: options.events,
            lifecycle: tokio::sync::Mutex::new(()),
            metrics_task: Mutex::new(None),
        });

        if let Err(e) = instance.initialize().await {
            instance.set_status(ContainerStatus::Error);
            warn!(container = %instance.id, error = %e, "Container failed to start");
            return Err(e);
        }

        info!(
            container = %instance.id,
            backend = %instance.runtime.backend(),
            "Container running"
        );
        Ok(instance)
    }

    /// Instantiates the current module and enters `Running` with empty state.
    async fn initialize(&self) -> Result<()> {
        let module = self.module.read().clone();
        let guest = self.runtime.instantiate(&module, &self.id).await?;

        *self.guest.write() = Some(Arc::new(guest));
        self.state.write().clear();
        *self.started_at.lock() = Instant::now();
        self.memory_warned.store(false, Ordering::Relaxed);
        self.set_status(ContainerStatus::Running);
        Ok(())
    }

    fn set_status(&self, status: ContainerStatus) {
        let previous = self.status.send_replace(status);
        if previous != status {
            debug!(container = %self.id, from = %previous, to = %status, "Status changed");
        }
    }

    fn emit(&self, event: &str, payload: Value) {
        self.events
            .emit(event, Event::for_container(event, &self.id, payload));
    }

    fn current_guest(&self) -> Result<Arc<GuestInstance>> {
        self.guest.read().clone().ok_or_else(|| Error::InvalidState {
            id: self.id.clone(),
            state: self.status().to_string(),
            expected: ContainerStatus::Running.to_string(),
        })
    }

    // -------------------------------------------------------------------------
    // Accessors
    // -------------------------------------------------------------------------

    /// Container id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Module name the container was created from.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Version label.
    pub fn version(&self) -> &str {
        &self.config.version
    }

    /// Governing configuration.
    pub fn config(&self) -> &ContainerConfig {
        &self.config
    }

    /// Backend the guest runs on.
    pub fn backend(&self) -> RuntimeBackend {
        self.runtime.backend()
    }

    /// Current status.
    pub fn status(&self) -> ContainerStatus {
        *self.status.borrow()
    }

    /// Watch channel receiving every status change.
    pub fn status_watch(&self) -> watch::Receiver<ContainerStatus> {
        self.status.subscribe()
    }

    /// Snapshot of the current state.
    pub fn state(&self) -> State {
        self.state.read().clone()
    }

    /// Hex SHA-256 of the current module bytes, when known.
    pub fn module_digest(&self) -> Option<String> {
        self.module_digest.read().clone()
    }

    /// Exported function names of the current guest.
    pub fn functions(&self) -> Vec<String> {
        self.guest
            .read()
            .as_ref()
            .map(|g| g.functions().to_vec())
            .unwrap_or_default()
    }

    /// Time since the container last entered `Running`.
    pub fn uptime(&self) -> Duration {
        self.started_at.lock().elapsed()
    }

    /// Identity and placement.
    pub fn info(&self) -> ContainerInfo {
        ContainerInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            version: self.config.version.clone(),
            backend: self.backend(),
            status: self.status(),
            created_at: self.created_at,
            module_digest: self.module_digest(),
        }
    }

    // -------------------------------------------------------------------------
    // Calls
    // -------------------------------------------------------------------------

    /// Calls an exported guest function under the container's limits.
    pub async fn call(&self, function: &str, args: &[WasmValue]) -> Result<Vec<WasmValue>> {
        let status = self.status();
        if status != ContainerStatus::Running {
            return Err(Error::InvalidState {
                id: self.id.clone(),
                state: status.to_string(),
                expected: ContainerStatus::Running.to_string(),
            });
        }

        let started = Instant::now();
        match self.governed_call(function, args).await {
            Ok(results) => {
                let cpu = cpu_usage_percent(started.elapsed());
                {
                    let mut counters = self.counters.lock();
                    counters.call_count += 1;
                    counters.last_activity = Some(Utc::now());
                    counters.cpu_usage = cpu;
                }
                if cpu > CPU_THRESHOLD_PERCENT {
                    self.emit(
                        names::CPU_THRESHOLD,
                        json!({
                            "containerId": self.id,
                            "function": function,
                            "cpuUsage": cpu,
                            "threshold": CPU_THRESHOLD_PERCENT,
                        }),
                    );
                }
                Ok(results)
            }
            Err(e) => {
                self.counters.lock().error_count += 1;
                debug!(container = %self.id, function, error = %e, "Call failed");
                self.emit(
                    names::CONTAINER_ERROR,
                    json!({
                        "containerId": self.id,
                        "function": function,
                        "error": e.to_string(),
                    }),
                );
                Err(e)
            }
        }
    }

    async fn governed_call(&self, function: &str, args: &[WasmValue]) -> Result<Vec<WasmValue>> {
        if let Some(budget) = self.config.max_cpu_time
            && self.uptime() > budget
        {
            return Err(Error::Timeout {
                operation: format!("CPU time budget of container '{}'", self.id),
                limit: budget,
            });
        }

        let usage = self.get_memory_usage()?;
        if usage.used > usage.limit {
            return Err(Error::MemoryLimitExceeded {
                container: self.id.clone(),
                used: usage.used,
                limit: usage.limit,
            });
        }

        self.check_security(function)?;

        let guest = self.current_guest()?;
        if !guest.has_function(function) {
            return Err(Error::FunctionNotFound {
                container: self.id.clone(),
                function: function.to_string(),
            });
        }

        let timeout = self.config.call_timeout();
        let interrupt = Arc::new(AtomicBool::new(false));
        let task = {
            let guest = Arc::clone(&guest);
            let interrupt = Arc::clone(&interrupt);
            let name = function.to_string();
            let args = args.to_vec();
            tokio::task::spawn_blocking(move || guest.call_interruptible(&name, &args, interrupt))
        };

        match tokio::time::timeout(timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(Error::Internal(format!("guest call task failed: {}", e))),
            Err(_) => {
                // The detached task traps at its next epoch check; its result is discarded.
                guest.interrupt(&interrupt);
                Err(Error::Timeout {
                    operation: format!("call '{}' in container '{}'", function, self.id),
                    limit: timeout,
                })
            }
        }
    }

    fn check_security(&self, function: &str) -> Result<()> {
        let violation = |detail: String| Error::SecurityViolation {
            container: self.id.clone(),
            detail,
        };

        if !self.config.is_allowed(function) {
            return Err(violation(format!(
                "function '{}' is not in the allowed list",
                function
            )));
        }

        let isolation = self.config.isolation();
        if function.starts_with("fs_") && !isolation.file_system_access {
            return Err(violation(format!(
                "filesystem access denied for '{}'",
                function
            )));
        }
        if function.starts_with("net_") && !isolation.network_access {
            return Err(violation(format!("network access denied for '{}'", function)));
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // State
    // -------------------------------------------------------------------------

    /// Shallow-merges `update` into the state and notifies subscribers.
    pub fn update_state(&self, update: State) {
        let (state, previous) = {
            let mut current = self.state.write();
            let previous = current.clone();
            current.extend(update);
            (current.clone(), previous)
        };

        self.emit(
            names::STATE_CHANGE,
            json!({
                "containerId": self.id,
                "state": state,
                "previousState": previous,
            }),
        );

        let callbacks: Vec<StateCallback> = self
            .subscribers
            .lock()
            .callbacks
            .iter()
            .map(|(_, cb)| cb.clone())
            .collect();
        for callback in callbacks {
            if std::panic::catch_unwind(AssertUnwindSafe(|| callback(&state))).is_err() {
                warn!(container = %self.id, "State subscriber panicked");
            }
        }
    }

    /// Registers a callback invoked with the new state after every update.
    pub fn subscribe<F>(&self, callback: F) -> StateSubscription
    where
        F: Fn(&State) + Send + Sync + 'static,
    {
        let mut subscribers = self.subscribers.lock();
        subscribers.next_id += 1;
        let id = subscribers.next_id;
        subscribers.callbacks.push((id, Arc::new(callback)));
        StateSubscription {
            id,
            subscribers: Arc::downgrade(&self.subscribers),
        }
    }

    /// Number of registered state subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().callbacks.len()
    }

    // -------------------------------------------------------------------------
    // Resources
    // -------------------------------------------------------------------------

    /// Reads the guest's linear memory size and updates the peak.
    ///
    /// Emits `memory:warning` once each time usage crosses the warning
    /// ratio of the limit. Fails when no guest is instantiated.
    pub fn get_memory_usage(&self) -> Result<MemoryUsage> {
        let guest = self.current_guest()?;
        let used = guest.memory_size();
        let limit = self.config.max_memory;

        let peak = {
            let mut counters = self.counters.lock();
            counters.peak = counters.peak.max(used);
            counters.peak
        };

        let usage = MemoryUsage {
            used,
            allocated: self.config.max_memory_pages() * WASM_PAGE_SIZE,
            peak,
            limit,
        };

        if used as f64 >= limit as f64 * MEMORY_WARNING_RATIO {
            if !self.memory_warned.swap(true, Ordering::Relaxed) {
                warn!(container = %self.id, used, limit, "Memory usage above warning threshold");
                self.emit(
                    names::MEMORY_WARNING,
                    json!({
                        "containerId": self.id,
                        "used": used,
                        "limit": limit,
                        "ratio": MEMORY_WARNING_RATIO,
                    }),
                );
            }
        } else {
            self.memory_warned.store(false, Ordering::Relaxed);
        }

        Ok(usage)
    }

    /// Metrics snapshot. Memory figures are refreshed when a guest exists.
    pub fn metrics(&self) -> ContainerMetrics {
        let memory_usage = self.get_memory_usage().unwrap_or_else(|_| {
            let counters = self.counters.lock();
            MemoryUsage {
                used: 0,
                allocated: 0,
                peak: counters.peak,
                limit: self.config.max_memory,
            }
        });
        let counters = self.counters.lock();
        ContainerMetrics {
            cpu_usage: counters.cpu_usage,
            memory_usage,
            uptime_ms: u64::try_from(self.uptime().as_millis()).unwrap_or(u64::MAX),
            call_count: counters.call_count,
            error_count: counters.error_count,
            last_activity: counters.last_activity,
        }
    }

    /// Takes a metrics snapshot and publishes it as `container:metrics`.
    pub fn collect_metrics(&self) -> ContainerMetrics {
        let metrics = self.metrics();
        let payload = serde_json::to_value(&metrics).unwrap_or(Value::Null);
        self.emit(
            names::CONTAINER_METRICS,
            json!({ "containerId": self.id, "metrics": payload }),
        );
        metrics
    }

    /// Starts the periodic metrics task, replacing any previous one.
    ///
    /// The task ends when the status watch reports `Stopped` or the
    /// instance is dropped.
    pub fn spawn_metrics_task(self: &Arc<Self>, interval: Duration) {
        let weak = Arc::downgrade(self);
        let mut status = self.status_watch();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let Some(instance) = weak.upgrade() else { break };
                        instance.collect_metrics();
                    }
                    changed = status.changed() => {
                        if changed.is_err() || *status.borrow_and_update() == ContainerStatus::Stopped {
                            break;
                        }
                    }
                }
            }
        });

        if let Some(previous) = self.metrics_task.lock().replace(handle) {
            previous.abort();
        }
    }

    /// Health summary. Never fails; internal errors yield `healthy: false`.
    pub fn health_check(&self) -> HealthStatus {
        let status = self.status();
        let details = match self.get_memory_usage() {
            Ok(memory) => {
                let counters = self.counters.lock();
                let healthy = status == ContainerStatus::Running && memory.used < memory.limit;
                return HealthStatus {
                    healthy,
                    last_check: Utc::now(),
                    details: HealthDetails {
                        status: Some(status),
                        uptime_ms: Some(u64::try_from(self.uptime().as_millis()).unwrap_or(u64::MAX)),
                        memory_usage: Some(memory.used),
                        memory_limit: Some(memory.limit),
                        call_count: Some(counters.call_count),
                        error_count: Some(counters.error_count),
                        error: None,
                    },
                };
            }
            Err(e) => HealthDetails {
                status: Some(status),
                error: Some(e.to_string()),
                ..HealthDetails::default()
            },
        };
        HealthStatus {
            healthy: false,
            last_check: Utc::now(),
            details,
        }
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Stops the container. A no-op when already stopped.
    pub async fn stop(&self) -> Result<()> {
        let _guard = self.lifecycle.lock().await;
        self.stop_locked()
    }

    fn stop_locked(&self) -> Result<()> {
        if self.status() == ContainerStatus::Stopped {
            return Ok(());
        }

        self.set_status(ContainerStatus::Stopping);
        self.subscribers.lock().callbacks.clear();
        if let Some(task) = self.metrics_task.lock().take() {
            task.abort();
        }
        self.guest.write().take();
        self.emit(names::CONTAINER_STOP, json!({ "containerId": self.id }));
        self.set_status(ContainerStatus::Stopped);

        info!(container = %self.id, "Container stopped");
        Ok(())
    }

    /// Stops, re-initializes and restores the pre-restart state.
    pub async fn restart(&self) -> Result<()> {
        let _guard = self.lifecycle.lock().await;
        let snapshot = self.state();

        let outcome = async {
            self.stop_locked()?;
            tokio::time::sleep(RESTART_GRACE_PERIOD).await;
            self.set_status(ContainerStatus::Starting);
            self.initialize().await?;
            self.update_state(snapshot.clone());
            Ok::<_, Error>(())
        }
        .await;

        match outcome {
            Ok(()) => {
                self.emit(
                    names::CONTAINER_RESTART,
                    json!({ "containerId": self.id, "restoredState": snapshot }),
                );
                info!(container = %self.id, "Container restarted");
                Ok(())
            }
            Err(e) => {
                self.set_status(ContainerStatus::Error);
                Err(Error::RestartFailed {
                    id: self.id.clone(),
                    source: Box::new(e),
                })
            }
        }
    }

    /// Compiles module bytes with this container's engine, ready for
    /// [`ContainerInstance::hot_reload`].
    pub async fn compile(&self, bytes: Vec<u8>) -> Result<Module> {
        self.runtime.compile(&self.name, bytes).await
    }

    /// Swaps in a new module while preserving state.
    ///
    /// The module must come from this container's engine (see
    /// [`ContainerInstance::compile`]). The previous guest stays active if
    /// the new one fails to instantiate.
    pub async fn hot_reload(&self, module: Module, module_digest: Option<String>) -> Result<()> {
        let _guard = self.lifecycle.lock().await;
        let was_running = self.status() == ContainerStatus::Running;
        let snapshot = self.state();

        let guest = self
            .runtime
            .instantiate(&module, &self.id)
            .await
            .map_err(|e| Error::HotReloadFailed {
                id: self.id.clone(),
                source: Box::new(e),
            })?;

        *self.guest.write() = Some(Arc::new(guest));
        *self.module.write() = module;
        *self.module_digest.write() = module_digest;
        self.memory_warned.store(false, Ordering::Relaxed);

        if was_running {
            self.update_state(snapshot.clone());
            self.set_status(ContainerStatus::Running);
        }

        self.emit(
            names::CONTAINER_HOTRELOAD,
            json!({ "containerId": self.id, "preservedState": snapshot }),
        );
        info!(container = %self.id, "Container hot reloaded");
        Ok(())
    }

    /// Creates `replicas` sibling containers sharing module and config.
    ///
    /// Each replica gets a fresh guest and a copy of the current state. The
    /// replicas are not registered anywhere. If one fails, the replicas
    /// created so far are stopped and the error is returned.
    pub async fn scale(&self, replicas: usize) -> Result<Vec<Arc<ContainerInstance>>> {
        let state = self.state();
        let module = self.module.read().clone();
        let digest = self.module_digest();
        let mut created: Vec<Arc<ContainerInstance>> = Vec::with_capacity(replicas);

        for _ in 0..replicas {
            let options = InstanceOptions {
                id: None,
                name: self.name.clone(),
                runtime: self.runtime.clone(),
                module: module.clone(),
                module_digest: digest.clone(),
                events: self.events.clone(),
            };
            match ContainerInstance::create(options).await {
                Ok(replica) => {
                    replica.update_state(state.clone());
                    debug!(container = %self.id, replica = %replica.id, "Created replica");
                    created.push(replica);
                }
                Err(e) => {
                    for replica in &created {
                        let _ = replica.stop().await;
                    }
                    return Err(e);
                }
            }
        }

        Ok(created)
    }
}

impl std::fmt::Debug for ContainerInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerInstance")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("backend", &self.backend())
            .field("status", &self.status())
            .finish()
    }
}

impl Drop for ContainerInstance {
    fn drop(&mut self) {
        if let Some(task) = self.metrics_task.get_mut().take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_id_format() {
        let id = generate_container_id("counter");
        let parts: Vec<&str> = id.rsplitn(3, '-').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].len(), 8);
        assert!(parts[0].chars().all(|c| c.is_ascii_hexdigit()));
        assert!(parts[1].parse::<i64>().is_ok());
        assert_eq!(parts[2], "counter");
        assert!(validate_container_id(&id).is_ok());
    }

    #[test]
    fn test_cpu_usage_heuristic() {
        assert_eq!(cpu_usage_percent(Duration::ZERO), 0.0);
        assert!((cpu_usage_percent(Duration::from_millis(250)) - 25.0).abs() < 1e-9);
        assert!(cpu_usage_percent(Duration::from_millis(790)) < CPU_THRESHOLD_PERCENT);
        assert!(cpu_usage_percent(Duration::from_millis(900)) > CPU_THRESHOLD_PERCENT);
        assert_eq!(cpu_usage_percent(Duration::from_secs(3)), 100.0);
    }

    #[test]
    fn test_status_display() {
        assert_eq!(ContainerStatus::Running.to_string(), "running");
        assert_eq!(
            serde_json::to_string(&ContainerStatus::Stopped).unwrap(),
            "\"stopped\""
        );
    }
}
