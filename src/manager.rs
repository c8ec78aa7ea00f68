//! # Container Manager
//!
//! Owns the container registry, the module cache and the collaborators
//! (module source, deployment client) and orchestrates container
//! lifecycles.
//!
//! ## Run Pipeline
//!
//! ```text
//! run(name, config)
//!   ├─ reserve slot          CapacityExceeded if registered + pending ≥ max
//!   ├─ resolve module        cache hit, or fetch → compile → cache if it fits
//!   ├─ create runtime        config.runtime_backend ?? default_runtime
//!   ├─ create instance       Starting → Running
//!   ├─ register + metrics    commit reserved slot, start metrics task
//!   └─ emit container:created
//! ```
//!
//! Any failure after the capacity check is wrapped as `StartupFailed` and
//! the container is never registered.
//!
//! ## Capacity
//!
//! Slots are reserved under the registry lock before the first await and
//! committed or released afterwards, so concurrent `run()` and `scale()`
//! calls can never push the registry past `max_containers`.
//!
//! ## Bulk Operations
//!
//! `restart_all`, `cleanup` and `health_check` never fail fast: every
//! container's outcome is isolated and the batch reports counts.

use crate::config::{ContainerConfig, ManagerConfig};
use crate::container::{
    ContainerInstance, ContainerMetrics, ContainerStatus, HealthStatus, InstanceOptions,
};
use crate::docker::{DeploymentRequest, DockerClient, HttpDockerClient, generate_compose};
use crate::error::{Error, Result};
use crate::events::{Event, EventBus, Subscription, names};
use crate::registry::{ModuleSource, RegistryClient};
use crate::runtime::RuntimeBackend;
use crate::runtimes::RuntimeFactory;
use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};
use wasmtime::Module;

// =============================================================================
// Summaries
// =============================================================================

/// One registry entry as reported by [`ContainerManager::list`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerSummary {
    pub id: String,
    pub name: String,
    pub version: String,
    pub status: ContainerStatus,
    pub backend: RuntimeBackend,
}

/// Outcome counts of a bulk operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BulkSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
}

impl BulkSummary {
    fn from_results<T>(results: &[Result<T>]) -> Self {
        let succeeded = results.iter().filter(|r| r.is_ok()).count();
        Self {
            total: results.len(),
            succeeded,
            failed: results.len() - succeeded,
        }
    }
}

/// Module cache statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub entries: usize,
    /// Sum of cached module sizes in bytes.
    pub bytes: u64,
    pub capacity: u64,
    pub hits: u64,
    pub misses: u64,
}

// =============================================================================
// Module Cache
// =============================================================================

#[derive(Clone)]
struct CachedModule {
    module: Module,
    digest: String,
    size: u64,
}

/// Compiled modules keyed by `name + JSON(config)`.
///
/// Entries are only admitted while the accounted size stays within
/// capacity; nothing is evicted.
struct ModuleCache {
    entries: HashMap<String, CachedModule>,
    current_size: u64,
    capacity: u64,
    hits: u64,
    misses: u64,
}

impl ModuleCache {
    fn new(capacity: u64) -> Self {
        Self {
            entries: HashMap::new(),
            current_size: 0,
            capacity,
            hits: 0,
            misses: 0,
        }
    }

    fn get(&mut self, key: &str) -> Option<CachedModule> {
        match self.entries.get(key) {
            Some(entry) => {
                self.hits += 1;
                Some(entry.clone())
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    /// Inserts or replaces an entry. Returns false if it does not fit.
    fn insert(&mut self, key: String, entry: CachedModule) -> bool {
        let replaced = self.entries.get(&key).map_or(0, |e| e.size);
        let projected = self.current_size - replaced + entry.size;
        if projected > self.capacity {
            return false;
        }
        self.current_size = projected;
        self.entries.insert(key, entry);
        true
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.current_size = 0;
    }

    fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.len(),
            bytes: self.current_size,
            capacity: self.capacity,
            hits: self.hits,
            misses: self.misses,
        }
    }
}

fn cache_key(name: &str, config: &ContainerConfig) -> Result<String> {
    Ok(format!("{}{}", name, config.cache_fragment()?))
}

fn digest_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

// =============================================================================
// Registry
// =============================================================================

#[derive(Default)]
struct Registry {
    containers: HashMap<String, Arc<ContainerInstance>>,
    /// Slots reserved by in-flight `run()`/`scale()` calls.
    pending: usize,
}

/// Reserved registry slots; released on drop unless committed.
struct SlotReservation<'a> {
    registry: &'a Mutex<Registry>,
    slots: usize,
}

impl SlotReservation<'_> {
    fn commit(mut self, instances: Vec<Arc<ContainerInstance>>) {
        let mut registry = self.registry.lock();
        registry.pending -= self.slots;
        self.slots = 0;
        for instance in instances {
            registry.containers.insert(instance.id().to_string(), instance);
        }
    }
}

impl Drop for SlotReservation<'_> {
    fn drop(&mut self) {
        if self.slots > 0 {
            self.registry.lock().pending -= self.slots;
        }
    }
}

// =============================================================================
// Container Manager
// =============================================================================

/// Registry and orchestrator of containers.
pub struct ContainerManager {
    config: ManagerConfig,
    factory: RuntimeFactory,
    source: Arc<dyn ModuleSource>,
    docker: Arc<dyn DockerClient>,
    events: EventBus,
    registry: Mutex<Registry>,
    cache: Mutex<ModuleCache>,
}

impl ContainerManager {
    /// Creates a manager fetching modules from the configured registry.
    pub fn new(config: ManagerConfig) -> Result<Self> {
        config.validate()?;
        let source = Arc::new(RegistryClient::new(
            config.registry_url.clone(),
            config.network_timeout,
        )?);
        let docker = Arc::new(HttpDockerClient::new(
            config.docker_endpoint(),
            config.network_timeout,
        )?);
        Self::with_collaborators(config, source, docker)
    }

    /// Creates a manager with an explicit module source.
    pub fn with_source(config: ManagerConfig, source: Arc<dyn ModuleSource>) -> Result<Self> {
        config.validate()?;
        let docker = Arc::new(HttpDockerClient::new(
            config.docker_endpoint(),
            config.network_timeout,
        )?);
        Self::with_collaborators(config, source, docker)
    }

    /// Creates a manager with explicit collaborators.
    pub fn with_collaborators(
        config: ManagerConfig,
        source: Arc<dyn ModuleSource>,
        docker: Arc<dyn DockerClient>,
    ) -> Result<Self> {
        config.validate()?;
        let factory = RuntimeFactory::new();
        info!(
            source = %source.describe(),
            max_containers = config.max_containers,
            default_runtime = %config.default_runtime,
            "Created container manager"
        );
        Ok(Self {
            cache: Mutex::new(ModuleCache::new(config.cache_size)),
            config,
            factory,
            source,
            docker,
            events: EventBus::new(),
            registry: Mutex::new(Registry::default()),
        })
    }

    /// Manager configuration.
    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Runtime factory shared by all containers.
    pub fn factory(&self) -> &RuntimeFactory {
        &self.factory
    }

    /// Event bus every container and the manager publish on.
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Registers a listener on the manager's event bus.
    pub fn subscribe<F>(&self, event: &str, callback: F) -> Subscription
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.events.on(event, callback)
    }

    fn emit(&self, event: &str, payload: Value) {
        self.events.emit(event, Event::new(event, payload));
    }

    fn emit_for(&self, event: &str, container_id: &str, payload: Value) {
        self.events
            .emit(event, Event::for_container(event, container_id, payload));
    }

    fn reserve(&self, slots: usize) -> Result<SlotReservation<'_>> {
        let mut registry = self.registry.lock();
        let occupied = registry.containers.len() + registry.pending;
        if occupied + slots > self.config.max_containers {
            return Err(Error::CapacityExceeded {
                limit: self.config.max_containers,
            });
        }
        registry.pending += slots;
        Ok(SlotReservation {
            registry: &self.registry,
            slots,
        })
    }

    fn instance(&self, id: &str) -> Result<Arc<ContainerInstance>> {
        self.get(id)
            .ok_or_else(|| Error::ContainerNotFound(id.to_string()))
    }

    fn register(&self, reservation: SlotReservation<'_>, instances: Vec<Arc<ContainerInstance>>) {
        if self.config.enable_metrics {
            for instance in &instances {
                instance.spawn_metrics_task(self.config.metrics_interval);
            }
        }
        reservation.commit(instances);
    }

    // -------------------------------------------------------------------------
    // Run
    // -------------------------------------------------------------------------

    /// Creates, starts and registers a container for module `name`.
    pub async fn run(&self, name: &str, config: ContainerConfig) -> Result<Arc<ContainerInstance>> {
        let reservation = self.reserve(1)?;

        let instance = self
            .start_container(name, config)
            .await
            .map_err(|e| Error::StartupFailed {
                name: name.to_string(),
                source: Box::new(e),
            })?;

        self.register(reservation, vec![instance.clone()]);
        self.emit_for(
            names::CONTAINER_CREATED,
            instance.id(),
            json!({
                "containerId": instance.id(),
                "name": instance.name(),
                "version": instance.version(),
                "backend": instance.backend(),
            }),
        );
        Ok(instance)
    }

    async fn start_container(
        &self,
        name: &str,
        config: ContainerConfig,
    ) -> Result<Arc<ContainerInstance>> {
        crate::constants::validate_container_name(name).map_err(|reason| {
            Error::InvalidContainerId {
                id: name.to_string(),
                reason: reason.to_string(),
            }
        })?;

        let (module, digest) = self.resolve_module(name, &config).await?;
        let backend = config.runtime_backend.unwrap_or(self.config.default_runtime);
        let runtime = self.factory.create(backend, config)?;

        ContainerInstance::create(InstanceOptions {
            id: None,
            name: name.to_string(),
            runtime,
            module,
            module_digest: Some(digest),
            events: self.events.clone(),
        })
        .await
    }

    async fn resolve_module(&self, name: &str, config: &ContainerConfig) -> Result<(Module, String)> {
        let key = cache_key(name, config)?;
        let cached = self.cache.lock().get(&key);
        if let Some(entry) = cached {
            debug!(module = %name, "Module cache hit");
            return Ok((entry.module, entry.digest));
        }
        let entry = self.fetch_and_compile(name).await?;
        self.admit(key, entry.clone());
        Ok((entry.module, entry.digest))
    }

    async fn fetch_and_compile(&self, name: &str) -> Result<CachedModule> {
        let bytes = self.source.fetch(name).await?;
        let digest = digest_hex(&bytes);
        let size = bytes.len() as u64;
        let module = self.factory.compile(name, bytes).await?;
        Ok(CachedModule {
            module,
            digest,
            size,
        })
    }

    fn admit(&self, key: String, entry: CachedModule) {
        let size = entry.size;
        if !self.cache.lock().insert(key, entry) {
            debug!(size, capacity = self.config.cache_size, "Module too large for cache");
        }
    }

    // -------------------------------------------------------------------------
    // Single-container Operations
    // -------------------------------------------------------------------------

    /// Stops a container and removes it from the registry.
    pub async fn stop(&self, id: &str) -> Result<()> {
        let instance = self.instance(id)?;
        instance.stop().await?;
        self.registry.lock().containers.remove(id);
        self.emit_for(
            names::MANAGER_CONTAINER_REMOVED,
            id,
            json!({ "containerId": id }),
        );
        Ok(())
    }

    /// Restarts a container in place.
    pub async fn restart(&self, id: &str) -> Result<()> {
        let instance = self.instance(id)?;
        instance.restart().await?;
        if self.config.enable_metrics {
            instance.spawn_metrics_task(self.config.metrics_interval);
        }
        self.emit_for(
            names::MANAGER_CONTAINER_RESTARTED,
            id,
            json!({ "containerId": id }),
        );
        Ok(())
    }

    /// Re-fetches the container's module from the source and swaps it in.
    pub async fn hot_reload(&self, id: &str) -> Result<()> {
        let instance = self.instance(id)?;
        let wrap = |e: Error| match e {
            Error::HotReloadFailed { .. } => e,
            other => Error::HotReloadFailed {
                id: id.to_string(),
                source: Box::new(other),
            },
        };

        let entry = self.fetch_and_compile(instance.name()).await.map_err(wrap)?;
        instance
            .hot_reload(entry.module.clone(), Some(entry.digest.clone()))
            .await
            .map_err(wrap)?;

        if let Ok(key) = cache_key(instance.name(), instance.config()) {
            self.admit(key, entry.clone());
        }

        self.emit_for(
            names::MANAGER_CONTAINER_HOTRELOADED,
            id,
            json!({ "containerId": id, "moduleDigest": entry.digest }),
        );
        Ok(())
    }

    /// Deploys a container through the docker collaborator. Returns the
    /// deployment id.
    pub async fn deploy_to_docker(&self, id: &str) -> Result<String> {
        let instance = self.instance(id)?;
        let request = deployment_request(&instance);

        let created = self.docker.create(&request).await?;
        let docker_id = self.docker.start(&created).await?;

        info!(container = %id, docker_id = %docker_id, "Deployed container to docker");
        self.emit_for(
            names::MANAGER_DOCKER_DEPLOYED,
            id,
            json!({ "containerId": id, "dockerId": docker_id }),
        );
        Ok(docker_id)
    }

    /// Creates and registers `replicas` siblings of a container. Returns the
    /// replica ids.
    pub async fn scale(&self, id: &str, replicas: usize) -> Result<Vec<String>> {
        let instance = self.instance(id)?;
        let reservation = self.reserve(replicas)?;

        let created = instance.scale(replicas).await?;
        let ids: Vec<String> = created.iter().map(|r| r.id().to_string()).collect();
        self.register(reservation, created);

        for replica_id in &ids {
            self.emit_for(
                names::MANAGER_REPLICA_CREATED,
                id,
                json!({ "containerId": id, "replicaId": replica_id }),
            );
        }
        self.emit_for(
            names::MANAGER_SCALED,
            id,
            json!({ "containerId": id, "replicas": replicas, "replicaIds": ids }),
        );
        Ok(ids)
    }

    // -------------------------------------------------------------------------
    // Bulk Operations
    // -------------------------------------------------------------------------

    fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.registry.lock().containers.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Restarts every container concurrently. Failures are counted, not
    /// propagated.
    pub async fn restart_all(&self) -> BulkSummary {
        let ids = self.ids();
        let results = join_all(ids.iter().map(|id| async move {
            let result = self.restart(id).await;
            if let Err(e) = &result {
                warn!(container = %id, error = %e, "Restart failed");
            }
            result
        }))
        .await;

        let summary = BulkSummary::from_results(&results);
        info!(
            total = summary.total,
            succeeded = summary.succeeded,
            failed = summary.failed,
            "Restarted all containers"
        );
        self.emit(
            names::MANAGER_RESTART_ALL,
            json!({
                "total": summary.total,
                "succeeded": summary.succeeded,
                "failed": summary.failed,
            }),
        );
        summary
    }

    /// Stops every container, clears the cache and removes all listeners.
    pub async fn cleanup(&self) -> BulkSummary {
        let instances: Vec<Arc<ContainerInstance>> = {
            let mut registry = self.registry.lock();
            registry.containers.drain().map(|(_, i)| i).collect()
        };

        let results = join_all(instances.iter().map(|instance| async move {
            let result = instance.stop().await;
            if let Err(e) = &result {
                warn!(container = %instance.id(), error = %e, "Stop failed during cleanup");
            }
            result
        }))
        .await;

        self.cache.lock().clear();
        let summary = BulkSummary::from_results(&results);
        self.emit(
            names::MANAGER_CLEANUP,
            json!({
                "total": summary.total,
                "succeeded": summary.succeeded,
                "failed": summary.failed,
            }),
        );
        self.events.remove_all_listeners(None);
        info!(stopped = summary.succeeded, failed = summary.failed, "Manager cleaned up");
        summary
    }

    // -------------------------------------------------------------------------
    // Read Side
    // -------------------------------------------------------------------------

    /// Looks up a container.
    pub fn get(&self, id: &str) -> Option<Arc<ContainerInstance>> {
        self.registry.lock().containers.get(id).cloned()
    }

    /// Number of registered containers.
    pub fn len(&self) -> usize {
        self.registry.lock().containers.len()
    }

    /// Returns true if no container is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn instances(&self) -> Vec<Arc<ContainerInstance>> {
        let mut instances: Vec<Arc<ContainerInstance>> =
            self.registry.lock().containers.values().cloned().collect();
        instances.sort_by(|a, b| a.id().cmp(b.id()));
        instances
    }

    /// Registered containers, sorted by id.
    pub fn list(&self) -> Vec<ContainerSummary> {
        self.instances()
            .iter()
            .map(|i| ContainerSummary {
                id: i.id().to_string(),
                name: i.name().to_string(),
                version: i.version().to_string(),
                status: i.status(),
                backend: i.backend(),
            })
            .collect()
    }

    /// Metrics of every container, keyed by id.
    pub fn get_metrics(&self) -> BTreeMap<String, ContainerMetrics> {
        self.instances()
            .into_iter()
            .map(|i| (i.id().to_string(), i.metrics()))
            .collect()
    }

    /// Health of every container, keyed by id.
    pub async fn health_check(&self) -> BTreeMap<String, HealthStatus> {
        let checks = self.instances().into_iter().map(|instance| async move {
            (instance.id().to_string(), instance.health_check())
        });
        join_all(checks).await.into_iter().collect()
    }

    /// Module cache statistics.
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.lock().stats()
    }

    /// Renders a compose document for every registered container.
    pub fn generate_docker_compose(&self) -> Result<String> {
        let requests: Vec<DeploymentRequest> =
            self.instances().iter().map(|i| deployment_request(i)).collect();
        generate_compose(&requests)
    }
}

impl std::fmt::Debug for ContainerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerManager")
            .field("containers", &self.len())
            .field("max_containers", &self.config.max_containers)
            .field("source", &self.source.describe())
            .finish()
    }
}

fn deployment_request(instance: &ContainerInstance) -> DeploymentRequest {
    let config = instance.config();
    DeploymentRequest {
        container_id: instance.id().to_string(),
        name: instance.name().to_string(),
        version: config.version.clone(),
        image: DeploymentRequest::image_for(instance.name(), &config.version),
        backend: instance.backend(),
        environment: config.environment.clone(),
        memory_limit: config.max_memory,
        module_digest: instance.module_digest().unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bulk_summary_counts() {
        let results: Vec<Result<()>> = vec![Ok(()), Err(Error::Internal("x".into())), Ok(())];
        let summary = BulkSummary::from_results(&results);
        assert_eq!(
            summary,
            BulkSummary {
                total: 3,
                succeeded: 2,
                failed: 1
            }
        );
    }

    #[test]
    fn test_digest_hex() {
        assert_eq!(
            digest_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
