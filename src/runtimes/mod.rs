//! Runtime backend implementations.
//!
//! Each backend implements [`Runtime`] on top of the shared base imports and
//! differs only in its import namespace, fuel metering and availability:
//!
//! | Backend    | Namespace  | Metered | Available when              |
//! |------------|------------|---------|-----------------------------|
//! | `browser`  | `browser`  | no      | compiled for a browser host |
//! | `host`     | `host`     | no      | always                      |
//! | `wasmtime` | `wasmtime` | fuel    | engine initialised          |
//! | `wasmer`   | `wasmer`   | fuel    | `wasmer` CLI on `PATH`      |
//! | `wasm3`    | `wasm3`    | fuel    | `wasm3` CLI on `PATH`       |
//!
//! The [`RuntimeFactory`] owns the single `wasmtime::Engine` every backend
//! compiles and instantiates through, so a compiled module is usable by any
//! backend.

pub mod browser;
pub mod engine;
pub mod host;

pub use self::browser::BrowserRuntime;
pub use self::engine::EngineRuntime;
pub use self::host::HostRuntime;

use crate::config::ContainerConfig;
use crate::error::{Error, Result};
use crate::guest::{HostState, write_bytes};
use crate::platform::Platform;
use crate::runtime::{Runtime, RuntimeBackend, RuntimeCapabilities, compile_module};
use std::sync::Arc;
use tracing::{debug, info, warn};
use wasmtime::{Caller, Config, Engine, Module};

/// Creates runtimes and compiles modules against the shared engine.
pub struct RuntimeFactory {
    engine: Option<Engine>,
    /// Error message if engine creation failed.
    engine_error: Option<String>,
    platform: Platform,
}

impl RuntimeFactory {
    /// Creates a factory for the detected platform.
    pub fn new() -> Self {
        Self::with_platform(Platform::detect())
    }

    /// Creates a factory for an explicit platform description.
    pub fn with_platform(platform: Platform) -> Self {
        let mut config = Config::new();
        config.consume_fuel(true); // Enable fuel for metered backends
        config.epoch_interruption(true); // Lets timed-out calls be interrupted
        config.wasm_memory64(false);

        match Engine::new(&config) {
            Ok(engine) => {
                debug!(platform = %platform.platform_string(), "Created runtime factory");
                Self {
                    engine: Some(engine),
                    engine_error: None,
                    platform,
                }
            }
            Err(e) => {
                warn!("Failed to create wasmtime engine: {}", e);
                Self {
                    engine: None,
                    engine_error: Some(format!("engine creation failed: {}", e)),
                    platform,
                }
            }
        }
    }

    /// Platform the factory detected.
    pub fn platform(&self) -> &Platform {
        &self.platform
    }

    /// Shared engine.
    pub fn engine(&self) -> Result<&Engine> {
        self.engine.as_ref().ok_or_else(|| Error::RuntimeUnavailable {
            runtime: "wasmtime".to_string(),
            reason: self
                .engine_error
                .clone()
                .unwrap_or_else(|| "engine not initialized".to_string()),
        })
    }

    /// Static capability lookup.
    pub fn get_runtime_capabilities(backend: RuntimeBackend) -> RuntimeCapabilities {
        backend.capabilities()
    }

    /// Returns why `backend` cannot run on this host, or `None` if it can.
    pub fn unavailable_reason(&self, backend: RuntimeBackend) -> Option<String> {
        if let Some(reason) = &self.engine_error {
            return Some(reason.clone());
        }
        match backend {
            RuntimeBackend::Browser if !self.platform.is_browser() => {
                Some("not running inside a browser host".to_string())
            }
            RuntimeBackend::Wasmer | RuntimeBackend::Wasm3
                if !self.platform.has_engine_cli(backend.as_str()) =>
            {
                Some(format!("'{}' executable not found on PATH", backend))
            }
            _ => None,
        }
    }

    /// Backends usable on this host, in priority order.
    pub fn available_backends(&self) -> Vec<RuntimeBackend> {
        RuntimeBackend::PRIORITY
            .into_iter()
            .filter(|b| self.unavailable_reason(*b).is_none())
            .collect()
    }

    /// Creates a runtime for `backend`.
    ///
    /// The runtime is returned even when the backend is unavailable here;
    /// [`Runtime::is_available`] reports that and instantiation refuses.
    pub fn create(&self, backend: RuntimeBackend, config: ContainerConfig) -> Result<Arc<dyn Runtime>> {
        let engine = self.engine()?.clone();
        let unavailable = self.unavailable_reason(backend);
        let runtime: Arc<dyn Runtime> = match backend {
            RuntimeBackend::Browser => Arc::new(BrowserRuntime::new(engine, config, unavailable)),
            RuntimeBackend::Host => Arc::new(HostRuntime::new(engine, config, unavailable)),
            RuntimeBackend::Wasmtime | RuntimeBackend::Wasmer | RuntimeBackend::Wasm3 => {
                Arc::new(EngineRuntime::new(backend, engine, config, unavailable))
            }
        };
        Ok(runtime)
    }

    /// Creates a runtime from a backend identifier string.
    pub fn create_by_name(&self, backend: &str, config: ContainerConfig) -> Result<Arc<dyn Runtime>> {
        self.create(backend.parse()?, config)
    }

    /// Returns the first available runtime in priority order.
    pub fn get_best_available_runtime(&self, config: ContainerConfig) -> Result<Arc<dyn Runtime>> {
        let backend = self
            .available_backends()
            .into_iter()
            .next()
            .ok_or(Error::NoRuntimeAvailable)?;
        info!(backend = %backend, "Selected best available runtime");
        self.create(backend, config)
    }

    /// Returns the first available runtime whose capabilities cover `required`.
    pub fn find_runtime_for(
        &self,
        required: &RuntimeCapabilities,
        config: ContainerConfig,
    ) -> Result<Arc<dyn Runtime>> {
        let backend = self
            .available_backends()
            .into_iter()
            .find(|b| b.capabilities().satisfies(required))
            .ok_or(Error::NoRuntimeAvailable)?;
        self.create(backend, config)
    }

    /// Compiles module bytes on a blocking thread.
    pub async fn compile(&self, name: &str, bytes: Vec<u8>) -> Result<Module> {
        compile_module(self.engine()?, name, bytes).await
    }
}

impl Default for RuntimeFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RuntimeFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeFactory")
            .field("engine", &self.engine.is_some())
            .field("engine_error", &self.engine_error)
            .field("platform", &self.platform.platform_string())
            .finish()
    }
}

/// Copies `value` into a guest buffer of `cap` bytes at `out`.
///
/// Writes at most `cap` bytes and returns the full value length so the guest
/// can retry with a larger buffer.
pub(crate) fn copy_out(
    caller: &mut Caller<'_, HostState>,
    value: &[u8],
    out: i32,
    cap: i32,
) -> wasmtime::Result<i32> {
    let n = value.len().min(usize::try_from(cap).unwrap_or(0));
    write_bytes(caller, out, &value[..n])?;
    Ok(i32::try_from(value.len()).unwrap_or(i32::MAX))
}
