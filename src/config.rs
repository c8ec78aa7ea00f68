//! Container and manager configuration.
//!
//! Both configuration types are plain serde structs. On the wire they use
//! camelCase keys and express durations in milliseconds:
//!
//! ```yaml
//! maxContainers: 4
//! defaultRuntime: host
//! registryUrl: https://modules.example.com
//! networkTimeout: 10000
//! cacheSize: 52428800
//! ```
//!
//! [`ManagerConfig::from_file`] accepts YAML or JSON, and
//! [`ManagerConfig::apply_env_overrides`] layers `WASMHIVE_*` variables on top.

use crate::constants::{
    DEFAULT_CACHE_SIZE, DEFAULT_CALL_TIMEOUT, DEFAULT_CONTAINER_VERSION, DEFAULT_MAX_CONTAINERS,
    DEFAULT_MAX_MEMORY, DEFAULT_METRICS_INTERVAL, DEFAULT_NETWORK_TIMEOUT, DEFAULT_REGISTRY_URL,
    ENV_PREFIX, pages_for_bytes,
};
use crate::error::{Error, Result};
use crate::runtime::RuntimeBackend;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

// =============================================================================
// Container Configuration
// =============================================================================

/// Isolation flags for a container.
///
/// Every flag defaults to `false`: a container only gets filesystem,
/// network or cross-container access when explicitly granted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IsolationConfig {
    /// Allow filesystem-flavoured calls and imports.
    pub file_system_access: bool,
    /// Allow network-flavoured calls and imports.
    pub network_access: bool,
    /// Allow the container to address other containers.
    pub cross_container_comm: bool,
    /// Host directory preopened for WASI when filesystem access is granted
    /// on a backend that supports it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preopen_dir: Option<PathBuf>,
}

/// Per-container resource and security configuration.
///
/// Drives every check performed by [`ContainerInstance::call`].
///
/// [`ContainerInstance::call`]: crate::container::ContainerInstance::call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ContainerConfig {
    /// Linear memory limit in bytes.
    pub max_memory: u64,
    /// CPU-time budget. Bounds both the container lifetime budget and the
    /// per-call timeout. `None` means no lifetime budget and the default
    /// call timeout.
    #[serde(with = "millis_opt", skip_serializing_if = "Option::is_none")]
    pub max_cpu_time: Option<Duration>,
    /// Whitelist of `module.name` import pairs and callable export names.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allowed_imports: Option<Vec<String>>,
    /// Isolation flags. Absent means everything denied.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub isolation: Option<IsolationConfig>,
    /// Backend override. Falls back to the manager default.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime_backend: Option<RuntimeBackend>,
    /// Environment passed to the guest through WASI.
    pub environment: BTreeMap<String, String>,
    /// Version label reported in the container identity.
    pub version: String,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            max_memory: DEFAULT_MAX_MEMORY,
            max_cpu_time: None,
            allowed_imports: None,
            isolation: None,
            runtime_backend: None,
            environment: BTreeMap::new(),
            version: DEFAULT_CONTAINER_VERSION.to_string(),
        }
    }
}

impl ContainerConfig {
    /// Sets the memory limit in bytes.
    #[must_use]
    pub fn with_max_memory(mut self, bytes: u64) -> Self {
        self.max_memory = bytes;
        self
    }

    /// Sets the CPU-time budget.
    #[must_use]
    pub fn with_max_cpu_time(mut self, limit: Duration) -> Self {
        self.max_cpu_time = Some(limit);
        self
    }

    /// Sets the import/export whitelist.
    #[must_use]
    pub fn with_allowed_imports<I, S>(mut self, allowed: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_imports = Some(allowed.into_iter().map(Into::into).collect());
        self
    }

    /// Sets the isolation flags.
    #[must_use]
    pub fn with_isolation(mut self, isolation: IsolationConfig) -> Self {
        self.isolation = Some(isolation);
        self
    }

    /// Pins the runtime backend.
    #[must_use]
    pub fn with_backend(mut self, backend: RuntimeBackend) -> Self {
        self.runtime_backend = Some(backend);
        self
    }

    /// Adds a guest environment variable.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    /// Sets the version label.
    #[must_use]
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Effective isolation flags (all denied when unset).
    pub fn isolation(&self) -> IsolationConfig {
        self.isolation.clone().unwrap_or_default()
    }

    /// Timeout applied to each guest call.
    pub fn call_timeout(&self) -> Duration {
        self.max_cpu_time.unwrap_or(DEFAULT_CALL_TIMEOUT)
    }

    /// Maximum linear memory pages derived from `max_memory`.
    pub fn max_memory_pages(&self) -> u64 {
        pages_for_bytes(self.max_memory)
    }

    /// Returns true when `name` is on the whitelist, or no whitelist is set.
    pub fn is_allowed(&self, name: &str) -> bool {
        self.allowed_imports
            .as_ref()
            .is_none_or(|allowed| allowed.iter().any(|a| a == name))
    }

    /// Stable cache key fragment for this configuration.
    pub fn cache_fragment(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

// =============================================================================
// Manager Configuration
// =============================================================================

/// Configuration of a [`ContainerManager`].
///
/// [`ContainerManager`]: crate::manager::ContainerManager
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ManagerConfig {
    /// Maximum number of registered containers.
    pub max_containers: usize,
    /// Backend used when a container does not pin one.
    pub default_runtime: RuntimeBackend,
    /// Base URL of the module registry.
    pub registry_url: String,
    /// Timeout for module downloads.
    #[serde(with = "millis")]
    pub network_timeout: Duration,
    /// Module cache capacity in bytes.
    pub cache_size: u64,
    /// Interval of the per-container metrics task.
    #[serde(with = "millis")]
    pub metrics_interval: Duration,
    /// Whether per-container metrics tasks are started.
    pub enable_metrics: bool,
    /// Deployment endpoint. Defaults to the registry URL.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub docker_endpoint: Option<String>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_containers: DEFAULT_MAX_CONTAINERS,
            default_runtime: RuntimeBackend::Host,
            registry_url: DEFAULT_REGISTRY_URL.to_string(),
            network_timeout: DEFAULT_NETWORK_TIMEOUT,
            cache_size: DEFAULT_CACHE_SIZE,
            metrics_interval: DEFAULT_METRICS_INTERVAL,
            enable_metrics: true,
            docker_endpoint: None,
        }
    }
}

impl ManagerConfig {
    /// Loads configuration from a YAML or JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        let config = Self::from_str(&content)?;
        debug!(path = %path.display(), "Loaded manager configuration");
        Ok(config)
    }

    /// Parses configuration from a YAML or JSON document.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Applies `WASMHIVE_*` overrides from the process environment.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(std::env::vars())
    }

    /// Applies `WASMHIVE_*` overrides from an arbitrary key/value source.
    pub fn apply_overrides<I>(&mut self, vars: I) -> Result<()>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            let Some(name) = key.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            match name {
                "MAX_CONTAINERS" => self.max_containers = parse_env(&key, &value)?,
                "DEFAULT_RUNTIME" => self.default_runtime = value.parse()?,
                "REGISTRY_URL" => self.registry_url = value,
                "NETWORK_TIMEOUT_MS" => {
                    self.network_timeout = Duration::from_millis(parse_env(&key, &value)?)
                }
                "CACHE_SIZE" => self.cache_size = parse_env(&key, &value)?,
                "METRICS_INTERVAL_MS" => {
                    self.metrics_interval = Duration::from_millis(parse_env(&key, &value)?)
                }
                "ENABLE_METRICS" => self.enable_metrics = parse_env(&key, &value)?,
                "DOCKER_ENDPOINT" => self.docker_endpoint = Some(value),
                _ => debug!(key = %key, "Ignoring unknown configuration override"),
            }
        }
        self.validate()
    }

    /// Checks that the configuration is usable.
    pub fn validate(&self) -> Result<()> {
        if self.max_containers == 0 {
            return Err(Error::Config("maxContainers must be at least 1".to_string()));
        }
        if self.cache_size == 0 {
            return Err(Error::Config("cacheSize must be greater than 0".to_string()));
        }
        if self.metrics_interval.is_zero() {
            return Err(Error::Config(
                "metricsInterval must be greater than 0".to_string(),
            ));
        }
        if self.registry_url.is_empty() {
            return Err(Error::Config("registryUrl cannot be empty".to_string()));
        }
        Ok(())
    }

    /// Endpoint used for deployments.
    pub fn docker_endpoint(&self) -> &str {
        self.docker_endpoint
            .as_deref()
            .unwrap_or(self.registry_url.as_str())
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::Config(format!("invalid value for {key}: '{value}'")))
}

// =============================================================================
// Serde helpers
// =============================================================================

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

mod millis_opt {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(d).map(|ms| ms.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_timeout_defaults() {
        let config = ContainerConfig::default();
        assert_eq!(config.call_timeout(), DEFAULT_CALL_TIMEOUT);

        let config = config.with_max_cpu_time(Duration::from_millis(250));
        assert_eq!(config.call_timeout(), Duration::from_millis(250));
    }

    #[test]
    fn test_memory_pages_round_up() {
        let config = ContainerConfig::default().with_max_memory(1024);
        assert_eq!(config.max_memory_pages(), 1);

        let config = ContainerConfig::default().with_max_memory(64 * 1024 + 1);
        assert_eq!(config.max_memory_pages(), 2);
    }

    #[test]
    fn test_cache_fragment_is_stable() {
        let a = ContainerConfig::default().with_env("B", "2").with_env("A", "1");
        let b = ContainerConfig::default().with_env("A", "1").with_env("B", "2");
        assert_eq!(a.cache_fragment().unwrap(), b.cache_fragment().unwrap());
    }
}
