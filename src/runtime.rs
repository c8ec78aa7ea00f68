//! Runtime trait - the backend strategy interface.
//!
//! A [`Runtime`] knows how to build the import surface a guest module needs
//! in one particular host environment and how to instantiate the module
//! against it:
//! - `is_available`: Whether the backend can be used on this host
//! - `instantiate`: Validate, link, and instantiate a compiled module
//! - `optimization_hints`: Static tuning hints derived from capabilities
//!
//! All backends share [`validate_module`] and [`create_base_imports`] and
//! only layer their own namespace on top via
//! [`Runtime::add_backend_imports`]. Callers never need to distinguish
//! concrete backend types.
//!
//! # Import Surface
//!
//! ```text
//! env.memory                 bounded linear memory
//! env.abort / env.trace      diagnostics hooks
//! env.seed, env."Math.*"     math intrinsics
//! wasi_snapshot_preview1.*   exit, fd_write/fd_read, clock, random
//! <backend>.*                backend namespace (browser / host / engine)
//! ```

use crate::config::ContainerConfig;
use crate::constants::{DEFAULT_WASM_FUEL, FUEL_PER_MILLISECOND, MAX_WASM_MODULE_SIZE};
use crate::error::{Error, Result};
use crate::guest::{GuestInstance, HostState, read_prefixed_utf16};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use tracing::{debug, error, warn};
use wasmtime::{
    Caller, Engine, ExternType, Linker, Memory, MemoryType, Module, Store, Trap, UpdateDeadline,
};
use wasmtime_wasi::preview1 as p1;

// =============================================================================
// Backends
// =============================================================================

/// Runtime backend identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeBackend {
    /// In-browser host (crate compiled to wasm).
    Browser,
    /// In-process host with filesystem, crypto and buffer helpers.
    Host,
    /// Wasmtime engine profile.
    Wasmtime,
    /// Wasmer engine profile.
    Wasmer,
    /// Wasm3 interpreter profile.
    Wasm3,
}

impl RuntimeBackend {
    /// All backends in auto-selection priority order.
    pub const PRIORITY: [RuntimeBackend; 5] = [
        Self::Browser,
        Self::Host,
        Self::Wasmtime,
        Self::Wasmer,
        Self::Wasm3,
    ];

    /// Backend identifier string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Browser => "browser",
            Self::Host => "host",
            Self::Wasmtime => "wasmtime",
            Self::Wasmer => "wasmer",
            Self::Wasm3 => "wasm3",
        }
    }

    /// Returns true for engine profiles that meter guest execution with fuel.
    pub fn is_metered(&self) -> bool {
        matches!(self, Self::Wasmtime | Self::Wasmer | Self::Wasm3)
    }

    /// Static capability matrix.
    pub fn capabilities(&self) -> RuntimeCapabilities {
        let (fs, net, threads, simd, debug) = match self {
            Self::Browser => (false, true, true, true, true),
            Self::Host => (true, true, true, true, true),
            Self::Wasmtime => (true, false, true, true, true),
            Self::Wasmer => (true, false, true, true, false),
            Self::Wasm3 => (false, false, false, false, false),
        };
        RuntimeCapabilities {
            memory_isolation: true,
            file_system_access: fs,
            network_access: net,
            thread_support: threads,
            simd_support: simd,
            debug_support: debug,
        }
    }
}

impl std::fmt::Display for RuntimeBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RuntimeBackend {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::PRIORITY
            .into_iter()
            .find(|b| b.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| Error::UnsupportedBackend(s.to_string()))
    }
}

/// Static capabilities of a backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeCapabilities {
    pub memory_isolation: bool,
    pub file_system_access: bool,
    pub network_access: bool,
    pub thread_support: bool,
    pub simd_support: bool,
    pub debug_support: bool,
}

impl RuntimeCapabilities {
    /// Returns true if every capability set in `required` is set here.
    pub fn satisfies(&self, required: &RuntimeCapabilities) -> bool {
        let pairs = [
            (self.memory_isolation, required.memory_isolation),
            (self.file_system_access, required.file_system_access),
            (self.network_access, required.network_access),
            (self.thread_support, required.thread_support),
            (self.simd_support, required.simd_support),
            (self.debug_support, required.debug_support),
        ];
        pairs.iter().all(|(have, need)| *have || !*need)
    }
}

/// Tuning hints a backend exposes to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OptimizationHints {
    pub backend: RuntimeBackend,
    pub enable_simd: bool,
    pub enable_threads: bool,
    pub debug_info: bool,
    /// Fuel granted per call, `None` when unmetered.
    pub fuel_budget: Option<u64>,
    pub initial_memory_pages: u64,
    pub max_memory_pages: u64,
    /// Whether compiled modules are worth caching on this backend.
    pub cache_compiled_modules: bool,
}

impl OptimizationHints {
    /// Derives hints from a backend's capabilities and a container config.
    pub fn for_backend(backend: RuntimeBackend, config: &ContainerConfig) -> Self {
        let caps = backend.capabilities();
        let max_pages = config.max_memory_pages();
        Self {
            backend,
            enable_simd: caps.simd_support,
            enable_threads: caps.thread_support,
            debug_info: caps.debug_support,
            fuel_budget: backend.is_metered().then(|| fuel_budget_for(config)),
            initial_memory_pages: initial_pages(max_pages),
            max_memory_pages: max_pages,
            cache_compiled_modules: backend != RuntimeBackend::Wasm3,
        }
    }
}

/// Fuel budget per call for metered backends.
///
/// Derived from `max_cpu_time` at `FUEL_PER_MILLISECOND`, or
/// `DEFAULT_WASM_FUEL` when no CPU budget is configured.
pub fn fuel_budget_for(config: &ContainerConfig) -> u64 {
    config
        .max_cpu_time
        .map(|limit| (limit.as_millis() as u64).saturating_mul(FUEL_PER_MILLISECOND))
        .unwrap_or(DEFAULT_WASM_FUEL)
}

fn initial_pages(max_pages: u64) -> u64 {
    max_pages.min(1)
}

// =============================================================================
// Runtime Trait
// =============================================================================

/// Backend strategy for instantiating guest modules.
///
/// # Implementations
///
/// - `BrowserRuntime`: in-browser host (DOM/storage-like imports)
/// - `HostRuntime`: in-process host (buffer/crypto/env imports, WASI preopens)
/// - `EngineRuntime`: wasmtime, wasmer and wasm3 profiles (fuel accounting)
#[async_trait]
pub trait Runtime: Send + Sync {
    /// Backend this runtime implements.
    fn backend(&self) -> RuntimeBackend;

    /// Returns the runtime name.
    fn name(&self) -> &str {
        self.backend().as_str()
    }

    /// Shared engine modules are compiled with.
    fn engine(&self) -> &Engine;

    /// Container configuration this runtime was created for.
    fn config(&self) -> &ContainerConfig;

    /// Checks if this runtime is available on the current host.
    fn is_available(&self) -> bool;

    /// Returns the reason why this runtime is unavailable (if any).
    fn unavailable_reason(&self) -> Option<String> {
        None
    }

    /// Static capabilities of this backend.
    fn capabilities(&self) -> RuntimeCapabilities {
        self.backend().capabilities()
    }

    /// Tuning hints for this backend and configuration.
    fn optimization_hints(&self) -> OptimizationHints {
        OptimizationHints::for_backend(self.backend(), self.config())
    }

    /// Fuel granted per call, `None` when unmetered.
    fn fuel_budget(&self) -> Option<u64> {
        None
    }

    /// Directory preopened for WASI, if the backend grants filesystem access.
    fn preopen_dir(&self) -> Option<PathBuf> {
        None
    }

    /// Adds this backend's imports on top of the base imports.
    fn add_backend_imports(&self, linker: &mut Linker<HostState>) -> Result<()>;

    /// Compiles module bytes against this runtime's engine.
    async fn compile(&self, name: &str, bytes: Vec<u8>) -> Result<Module> {
        compile_module(self.engine(), name, bytes).await
    }

    /// Validates, links and instantiates `module` for `container_id`.
    async fn instantiate(&self, module: &Module, container_id: &str) -> Result<GuestInstance> {
        instantiate_module(self, module, container_id)
    }
}

/// Shared instantiation path used by every backend.
pub fn instantiate_module<R: Runtime + ?Sized>(
    runtime: &R,
    module: &Module,
    container_id: &str,
) -> Result<GuestInstance> {
    if !runtime.is_available() {
        return Err(Error::RuntimeUnavailable {
            runtime: runtime.name().to_string(),
            reason: runtime
                .unavailable_reason()
                .unwrap_or_else(|| "not available on this host".to_string()),
        });
    }

    if !Engine::same(module.engine(), runtime.engine()) {
        return Err(Error::EngineMismatch {
            container: container_id.to_string(),
        });
    }

    let config = runtime.config();
    validate_module(config, module, container_id)?;

    let fuel = runtime.fuel_budget();
    let preopen = runtime.preopen_dir();
    let state = HostState::new(container_id, config, preopen.as_deref(), fuel)?;

    let mut store = Store::new(runtime.engine(), state);
    store.limiter(|state| &mut state.limits);
    store
        .set_fuel(fuel.unwrap_or(u64::MAX))
        .map_err(link_error(container_id))?;

    // Epoch ticks only trap the guest once its current call was interrupted
    store.epoch_deadline_callback(|ctx| {
        if ctx.data().is_interrupted() {
            Err(Trap::Interrupt.into())
        } else {
            Ok(UpdateDeadline::Continue(1))
        }
    });
    store.set_epoch_deadline(1);

    let mut linker = create_base_imports(&mut store, config)?;
    runtime.add_backend_imports(&mut linker)?;

    let instance = linker
        .instantiate(&mut store, module)
        .map_err(link_error(container_id))?;

    debug!(
        container = %container_id,
        backend = %runtime.name(),
        "Instantiated guest module"
    );
    Ok(GuestInstance::new(store, instance, module))
}

/// Compiles module bytes for `engine` on a blocking thread.
///
/// Module size is bounded by [`MAX_WASM_MODULE_SIZE`] before compilation.
pub(crate) async fn compile_module(engine: &Engine, name: &str, bytes: Vec<u8>) -> Result<Module> {
    // SECURITY: Bound module size before handing it to the compiler
    if bytes.len() > MAX_WASM_MODULE_SIZE {
        return Err(Error::ModuleTooLarge {
            size: bytes.len(),
            limit: MAX_WASM_MODULE_SIZE,
        });
    }

    let engine = engine.clone();
    let task_name = name.to_string();
    let module = tokio::task::spawn_blocking(move || Module::new(&engine, &bytes))
        .await
        .map_err(|e| Error::Internal(format!("compile task failed: {}", e)))?
        .map_err(|e| Error::CompilationFailed {
            name: task_name,
            reason: format!("{:#}", e),
        })?;

    debug!(module = %name, "Compiled module");
    Ok(module)
}

/// Maps a wasmtime linking/instantiation error to [`Error::InstantiationFailed`].
pub(crate) fn link_error(container_id: &str) -> impl Fn(wasmtime::Error) -> Error + '_ {
    move |e| Error::InstantiationFailed {
        container: container_id.to_string(),
        reason: format!("{:#}", e),
    }
}

// =============================================================================
// Module Validation
// =============================================================================

/// Checks a compiled module against the container's security policy.
///
/// When `allowed_imports` is set, every `module.name` import pair must be on
/// it; the first violation fails before any instantiation attempt. A missing
/// `memory` export is only a warning.
pub fn validate_module(config: &ContainerConfig, module: &Module, container_id: &str) -> Result<()> {
    if let Some(allowed) = &config.allowed_imports {
        for import in module.imports() {
            let pair = format!("{}.{}", import.module(), import.name());
            if !allowed.iter().any(|a| *a == pair) {
                return Err(Error::SecurityViolation {
                    container: container_id.to_string(),
                    detail: format!("import '{}' is not in the allowed list", pair),
                });
            }
        }
    }

    let exports_memory = module
        .exports()
        .any(|e| e.name() == "memory" && matches!(e.ty(), ExternType::Memory(_)));
    if !exports_memory {
        warn!(container = %container_id, "Module does not export 'memory'");
    }

    Ok(())
}

// =============================================================================
// Base Imports
// =============================================================================

type MathFn = fn(f64) -> f64;
type MathFn2 = fn(f64, f64) -> f64;

const MATH_UNARY: [(&str, MathFn); 13] = [
    ("Math.abs", f64::abs),
    ("Math.acos", f64::acos),
    ("Math.asin", f64::asin),
    ("Math.atan", f64::atan),
    ("Math.ceil", f64::ceil),
    ("Math.cos", f64::cos),
    ("Math.exp", f64::exp),
    ("Math.floor", f64::floor),
    ("Math.log", f64::ln),
    ("Math.round", f64::round),
    ("Math.sin", f64::sin),
    ("Math.sqrt", f64::sqrt),
    ("Math.tan", f64::tan),
];

const MATH_BINARY: [(&str, MathFn2); 4] = [
    ("Math.atan2", f64::atan2),
    ("Math.max", f64::max),
    ("Math.min", f64::min),
    ("Math.pow", f64::powf),
];

/// Builds the linker every backend starts from.
///
/// Defines a bounded `env.memory` (`min(1, pages)` initial, `pages`
/// maximum), the `abort`/`trace` hooks, the math table and WASI preview1.
/// Shadowing is allowed so backends may override any base definition.
pub fn create_base_imports(
    store: &mut Store<HostState>,
    config: &ContainerConfig,
) -> Result<Linker<HostState>> {
    let container_id = store.data().container_id.clone();
    let err = link_error(&container_id);

    let mut linker: Linker<HostState> = Linker::new(store.engine());
    linker.allow_shadowing(true);

    let max_pages = u32::try_from(config.max_memory_pages()).unwrap_or(u32::MAX);
    let initial = u32::try_from(initial_pages(u64::from(max_pages))).unwrap_or(0);
    let memory = Memory::new(&mut *store, MemoryType::new(initial, Some(max_pages))).map_err(&err)?;
    store.data_mut().memory = Some(memory);
    linker
        .define(&*store, "env", "memory", memory)
        .map_err(&err)?;

    linker
        .func_wrap(
            "env",
            "abort",
            |mut caller: Caller<'_, HostState>,
             msg: i32,
             file: i32,
             line: i32,
             col: i32|
             -> wasmtime::Result<()> {
                let msg = read_prefixed_utf16(&mut caller, msg).unwrap_or_default();
                let file = read_prefixed_utf16(&mut caller, file).unwrap_or_default();
                let container = caller.data().container_id.clone();
                error!(container = %container, "Guest abort: {} at {}:{}:{}", msg, file, line, col);
                Err(wasmtime::Error::msg(format!(
                    "abort: {} at {}:{}:{}",
                    msg, file, line, col
                )))
            },
        )
        .map_err(&err)?;

    linker
        .func_wrap(
            "env",
            "trace",
            |mut caller: Caller<'_, HostState>,
             msg: i32,
             n: i32,
             a0: f64,
             a1: f64,
             a2: f64,
             a3: f64,
             a4: f64| {
                let msg = read_prefixed_utf16(&mut caller, msg).unwrap_or_default();
                let args = [a0, a1, a2, a3, a4];
                let shown = &args[..usize::try_from(n).unwrap_or(0).min(args.len())];
                debug!(container = %caller.data().container_id, "trace: {} {:?}", msg, shown);
            },
        )
        .map_err(&err)?;

    linker
        .func_wrap("env", "seed", || chrono::Utc::now().timestamp_millis() as f64)
        .map_err(&err)?;

    for (name, f) in MATH_UNARY {
        linker
            .func_wrap("env", name, move |x: f64| f(x))
            .map_err(&err)?;
    }
    for (name, f) in MATH_BINARY {
        linker
            .func_wrap("env", name, move |x: f64, y: f64| f(x, y))
            .map_err(&err)?;
    }
    linker
        .func_wrap("env", "Math.random", || rand::random::<f64>())
        .map_err(&err)?;

    p1::add_to_linker_sync(&mut linker, |state: &mut HostState| &mut state.wasi).map_err(&err)?;

    Ok(linker)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_backend_parsing() {
        assert_eq!("host".parse::<RuntimeBackend>().unwrap(), RuntimeBackend::Host);
        assert_eq!("WASM3".parse::<RuntimeBackend>().unwrap(), RuntimeBackend::Wasm3);
        assert!(matches!(
            "jvm".parse::<RuntimeBackend>(),
            Err(Error::UnsupportedBackend(_))
        ));
    }

    #[test]
    fn test_fuel_budget_scales_with_cpu_time() {
        let config = ContainerConfig::default();
        assert_eq!(fuel_budget_for(&config), DEFAULT_WASM_FUEL);

        let config = config.with_max_cpu_time(Duration::from_millis(10));
        assert_eq!(fuel_budget_for(&config), 10 * FUEL_PER_MILLISECOND);
    }

    #[test]
    fn test_capabilities_satisfies() {
        let wasm3 = RuntimeBackend::Wasm3.capabilities();
        let host = RuntimeBackend::Host.capabilities();
        assert!(host.satisfies(&wasm3));
        assert!(!wasm3.satisfies(&host));
    }

    #[test]
    fn test_hints_for_unmetered_backend() {
        let hints = OptimizationHints::for_backend(RuntimeBackend::Host, &ContainerConfig::default());
        assert_eq!(hints.fuel_budget, None);
        assert_eq!(hints.initial_memory_pages, 1);
    }
}
