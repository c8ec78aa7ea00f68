//! Guest instance wrapper around a wasmtime store.
//!
//! A [`GuestInstance`] owns one `Store<HostState>` and the instantiated
//! module inside it. Calls are synchronous and serialized through the store
//! lock; the container layer moves them onto blocking threads and races them
//! against a timeout.
//!
//! ## Memory Observation
//!
//! The current linear memory size is mirrored into an atomic after every
//! instantiation and call. Readers that cannot take the store lock (a call is
//! in flight) see the size as of the last completed call, which is exact
//! because memory only changes while the guest runs.
//!
//! ## Interruption
//!
//! Stores run with an epoch deadline one tick ahead. Each call carries an
//! interrupt flag; [`GuestInstance::interrupt`] raises it and ticks the
//! engine epoch, which traps that call and releases the store. Calls whose
//! flag is not raised simply renew their deadline.

use crate::config::ContainerConfig;
use crate::error::{Error, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};
use wasmtime::{
    Caller, Engine, Extern, ExternType, Instance, Memory, Module, Store, StoreLimits,
    StoreLimitsBuilder, Trap, Val,
};
use wasmtime_wasi::preview1::WasiP1Ctx;
use wasmtime_wasi::{DirPerms, FilePerms, I32Exit, WasiCtxBuilder};

/// Upper bound on strings decoded from guest memory for logging.
const MAX_GUEST_STRING_BYTES: usize = 4096;

// =============================================================================
// Values
// =============================================================================

/// A WebAssembly number passed to or returned from a guest function.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum WasmValue {
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
}

impl WasmValue {
    /// Returns the value as `i32` if it is one.
    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Self::I32(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns the value as `i64` if it is one.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::I64(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns the value as `f64` if it is a float.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::F32(v) => Some(f64::from(*v)),
            Self::F64(v) => Some(*v),
            _ => None,
        }
    }

    fn to_val(self) -> Val {
        match self {
            Self::I32(v) => Val::I32(v),
            Self::I64(v) => Val::I64(v),
            Self::F32(v) => Val::F32(v.to_bits()),
            Self::F64(v) => Val::F64(v.to_bits()),
        }
    }

    fn from_val(val: &Val) -> Option<Self> {
        match val {
            Val::I32(v) => Some(Self::I32(*v)),
            Val::I64(v) => Some(Self::I64(*v)),
            Val::F32(bits) => Some(Self::F32(f32::from_bits(*bits))),
            Val::F64(bits) => Some(Self::F64(f64::from_bits(*bits))),
            _ => None,
        }
    }
}

impl From<i32> for WasmValue {
    fn from(v: i32) -> Self {
        Self::I32(v)
    }
}

impl From<i64> for WasmValue {
    fn from(v: i64) -> Self {
        Self::I64(v)
    }
}

impl From<f32> for WasmValue {
    fn from(v: f32) -> Self {
        Self::F32(v)
    }
}

impl From<f64> for WasmValue {
    fn from(v: f64) -> Self {
        Self::F64(v)
    }
}

// =============================================================================
// Host State
// =============================================================================

/// Per-store data available to host imports.
pub struct HostState {
    pub(crate) wasi: WasiP1Ctx,
    pub(crate) limits: StoreLimits,
    /// Memory supplied as `env.memory`, used when the guest exports none.
    pub(crate) memory: Option<Memory>,
    /// Key-value storage backing the browser-style `storage_*` imports.
    pub(crate) storage: HashMap<String, Vec<u8>>,
    pub(crate) environment: BTreeMap<String, String>,
    pub(crate) container_id: String,
    pub(crate) fuel_budget: Option<u64>,
    pub(crate) cpu_limit: Duration,
    /// Interrupt flag of the call currently running in this store.
    pub(crate) interrupt: Arc<AtomicBool>,
}

impl HostState {
    /// Builds host state for a container.
    ///
    /// The WASI context inherits stdout/stderr, receives the configured
    /// environment, and gets no filesystem access unless `preopen` is given.
    pub(crate) fn new(
        container_id: &str,
        config: &ContainerConfig,
        preopen: Option<&Path>,
        fuel_budget: Option<u64>,
    ) -> Result<Self> {
        let mut builder = WasiCtxBuilder::new();
        builder.inherit_stdout().inherit_stderr();

        for (key, value) in &config.environment {
            builder.env(key, value);
        }

        // SECURITY: Only the explicitly configured directory is reachable
        if let Some(dir) = preopen {
            builder
                .preopened_dir(dir, "/", DirPerms::all(), FilePerms::all())
                .map_err(|e| Error::InstantiationFailed {
                    container: container_id.to_string(),
                    reason: format!("failed to preopen {}: {}", dir.display(), e),
                })?;
            debug!(container = %container_id, dir = %dir.display(), "Preopened WASI directory");
        }

        let memory_limit = config.max_memory_pages() * crate::constants::WASM_PAGE_SIZE;
        let limits = StoreLimitsBuilder::new()
            .memory_size(usize::try_from(memory_limit).unwrap_or(usize::MAX))
            .build();

        Ok(Self {
            wasi: builder.build_p1(),
            limits,
            memory: None,
            storage: HashMap::new(),
            environment: config.environment.clone(),
            container_id: container_id.to_string(),
            fuel_budget,
            cpu_limit: config.call_timeout(),
            interrupt: Arc::new(AtomicBool::new(false)),
        })
    }

    pub(crate) fn is_interrupted(&self) -> bool {
        self.interrupt.load(Ordering::Acquire)
    }
}

/// Resolves the guest's linear memory from inside a host call.
pub(crate) fn guest_memory(caller: &mut Caller<'_, HostState>) -> Option<Memory> {
    match caller.get_export("memory") {
        Some(Extern::Memory(memory)) => Some(memory),
        _ => caller.data().memory,
    }
}

/// Reads `len` bytes at `ptr` from guest memory.
pub(crate) fn read_bytes(
    caller: &mut Caller<'_, HostState>,
    ptr: i32,
    len: i32,
) -> wasmtime::Result<Vec<u8>> {
    let memory = guest_memory(caller).ok_or_else(|| wasmtime::Error::msg("no linear memory"))?;
    let len = usize::try_from(len).map_err(|_| wasmtime::Error::msg("negative length"))?;
    let offset = usize::try_from(ptr).map_err(|_| wasmtime::Error::msg("negative pointer"))?;
    let mut buf = vec![0u8; len];
    memory.read(&*caller, offset, &mut buf)?;
    Ok(buf)
}

/// Writes `data` at `ptr` into guest memory.
pub(crate) fn write_bytes(
    caller: &mut Caller<'_, HostState>,
    ptr: i32,
    data: &[u8],
) -> wasmtime::Result<()> {
    let memory = guest_memory(caller).ok_or_else(|| wasmtime::Error::msg("no linear memory"))?;
    let offset = usize::try_from(ptr).map_err(|_| wasmtime::Error::msg("negative pointer"))?;
    memory.write(&mut *caller, offset, data)?;
    Ok(())
}

/// Reads a UTF-8 string of `len` bytes at `ptr`.
pub(crate) fn read_utf8(
    caller: &mut Caller<'_, HostState>,
    ptr: i32,
    len: i32,
) -> wasmtime::Result<String> {
    let bytes = read_bytes(caller, ptr, len.min(MAX_GUEST_STRING_BYTES as i32))?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Decodes a length-prefixed UTF-16 string (byte length stored at `ptr - 4`).
///
/// Returns `None` when the pointer does not look like such a string.
pub(crate) fn read_prefixed_utf16(caller: &mut Caller<'_, HostState>, ptr: i32) -> Option<String> {
    if ptr < 4 {
        return None;
    }
    let header = read_bytes(caller, ptr - 4, 4).ok()?;
    let len = u32::from_le_bytes(header.try_into().ok()?) as usize;
    let len = len.min(MAX_GUEST_STRING_BYTES) & !1;
    let bytes = read_bytes(caller, ptr, len as i32).ok()?;
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    Some(String::from_utf16_lossy(&units))
}

// =============================================================================
// Guest Instance
// =============================================================================

/// An instantiated guest module and the store that owns it.
pub struct GuestInstance {
    container_id: String,
    engine: Engine,
    store: Mutex<Store<HostState>>,
    instance: Instance,
    memory: Option<Memory>,
    functions: Vec<String>,
    memory_bytes: AtomicU64,
    fuel_budget: Option<u64>,
    cpu_limit: Duration,
}

impl GuestInstance {
    pub(crate) fn new(mut store: Store<HostState>, instance: Instance, module: &Module) -> Self {
        let imports_env_memory = module
            .imports()
            .any(|import| import.module() == "env" && import.name() == "memory");
        let memory = instance
            .get_memory(&mut store, "memory")
            .or_else(|| store.data().memory.filter(|_| imports_env_memory));
        let functions = module
            .exports()
            .filter(|export| matches!(export.ty(), ExternType::Func(_)))
            .map(|export| export.name().to_string())
            .collect();
        let memory_bytes = memory.map_or(0, |m| m.data_size(&store) as u64);
        let data = store.data();
        let container_id = data.container_id.clone();
        let fuel_budget = data.fuel_budget;
        let cpu_limit = data.cpu_limit;

        if memory.is_none() {
            warn!(container = %container_id, "Guest has no linear memory; memory accounting disabled");
        }

        Self {
            container_id,
            engine: store.engine().clone(),
            store: Mutex::new(store),
            instance,
            memory,
            functions,
            memory_bytes: AtomicU64::new(memory_bytes),
            fuel_budget,
            cpu_limit,
        }
    }

    /// Container this instance belongs to.
    pub fn container_id(&self) -> &str {
        &self.container_id
    }

    /// Names of exported functions.
    pub fn functions(&self) -> &[String] {
        &self.functions
    }

    /// Returns true if the module exports a function named `name`.
    pub fn has_function(&self, name: &str) -> bool {
        self.functions.iter().any(|f| f == name)
    }

    /// Current linear memory size in bytes.
    pub fn memory_size(&self) -> u64 {
        if let (Some(memory), Some(store)) = (self.memory, self.store.try_lock()) {
            let size = memory.data_size(&*store) as u64;
            self.memory_bytes.store(size, Ordering::Relaxed);
            return size;
        }
        self.memory_bytes.load(Ordering::Relaxed)
    }

    /// Calls an exported function. Blocks until the guest returns.
    pub fn call(&self, function: &str, args: &[WasmValue]) -> Result<Vec<WasmValue>> {
        self.call_interruptible(function, args, Arc::new(AtomicBool::new(false)))
    }

    /// Calls an exported function that traps once `interrupt` is raised
    /// through [`GuestInstance::interrupt`].
    ///
    /// A flag raised before the call acquires the store fails it without
    /// entering the guest.
    pub fn call_interruptible(
        &self,
        function: &str,
        args: &[WasmValue],
        interrupt: Arc<AtomicBool>,
    ) -> Result<Vec<WasmValue>> {
        let mut store = self.store.lock();

        store.data_mut().interrupt = Arc::clone(&interrupt);
        store.set_epoch_deadline(1);
        if interrupt.load(Ordering::Acquire) {
            return Err(self.interrupted(function));
        }

        if let Some(budget) = self.fuel_budget {
            store.set_fuel(budget).map_err(|e| self.exec_error(function, e))?;
        }

        let func = self
            .instance
            .get_func(&mut *store, function)
            .ok_or_else(|| Error::FunctionNotFound {
                container: self.container_id.clone(),
                function: function.to_string(),
            })?;

        let ty = func.ty(&*store);
        if ty.params().len() != args.len() {
            return Err(Error::ExecutionFailed {
                container: self.container_id.clone(),
                function: function.to_string(),
                reason: format!(
                    "expected {} arguments, got {}",
                    ty.params().len(),
                    args.len()
                ),
            });
        }

        let params: Vec<Val> = args.iter().map(|a| a.to_val()).collect();
        let mut results = vec![Val::I32(0); ty.results().len()];
        let outcome = func.call(&mut *store, &params, &mut results);

        if let Some(memory) = self.memory {
            self.memory_bytes
                .store(memory.data_size(&*store) as u64, Ordering::Relaxed);
        }

        match outcome {
            Ok(()) => results
                .iter()
                .map(|val| {
                    WasmValue::from_val(val).ok_or_else(|| Error::ExecutionFailed {
                        container: self.container_id.clone(),
                        function: function.to_string(),
                        reason: "unsupported result type".to_string(),
                    })
                })
                .collect(),
            Err(e) => {
                if matches!(e.downcast_ref::<I32Exit>(), Some(I32Exit(0))) {
                    debug!(container = %self.container_id, function, "Guest exited cleanly");
                    return Ok(Vec::new());
                }
                if matches!(e.downcast_ref::<Trap>(), Some(Trap::OutOfFuel)) {
                    return Err(Error::Timeout {
                        operation: format!(
                            "fuel budget exhausted calling '{}' in container '{}'",
                            function, self.container_id
                        ),
                        limit: self.cpu_limit,
                    });
                }
                if matches!(e.downcast_ref::<Trap>(), Some(Trap::Interrupt)) {
                    return Err(self.interrupted(function));
                }
                Err(self.exec_error(function, e))
            }
        }
    }

    /// Raises `flag` and ticks the engine epoch so the call carrying it traps.
    ///
    /// Other calls on the same engine observe the tick and keep running.
    pub fn interrupt(&self, flag: &AtomicBool) {
        flag.store(true, Ordering::Release);
        self.engine.increment_epoch();
        debug!(container = %self.container_id, "Interrupted guest call");
    }

    fn interrupted(&self, function: &str) -> Error {
        Error::Timeout {
            operation: format!(
                "call '{}' in container '{}' interrupted",
                function, self.container_id
            ),
            limit: self.cpu_limit,
        }
    }

    fn exec_error(&self, function: &str, e: wasmtime::Error) -> Error {
        Error::ExecutionFailed {
            container: self.container_id.clone(),
            function: function.to_string(),
            reason: format!("{:#}", e),
        }
    }
}

impl std::fmt::Debug for GuestInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuestInstance")
            .field("container_id", &self.container_id)
            .field("functions", &self.functions)
            .field("memory_bytes", &self.memory_bytes.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_round_trip_through_val() {
        for value in [
            WasmValue::I32(-7),
            WasmValue::I64(1 << 40),
            WasmValue::F32(1.5),
            WasmValue::F64(-2.25),
        ] {
            assert_eq!(WasmValue::from_val(&value.to_val()), Some(value));
        }
    }

    #[test]
    fn test_value_serialization() {
        let json = serde_json::to_string(&WasmValue::I32(3)).unwrap();
        assert_eq!(json, r#"{"type":"i32","value":3}"#);
    }
}
