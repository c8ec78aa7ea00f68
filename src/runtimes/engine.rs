//! Engine profile backends: wasmtime, wasmer and wasm3.
//!
//! All three run on the embedded engine with fuel metering. Each store is
//! granted a per-call fuel budget derived from the container's CPU budget;
//! exhausting it traps the guest and surfaces as a timeout. Guests can
//! inspect and spend their budget through the profile's namespace:
//!
//! ```text
//! <profile>.fuel_remaining() -> i64
//! <profile>.fuel_consume(n: i64) -> i32   1 if charged, 0 if insufficient
//! <profile>.budget_ms() -> i64
//! ```
//!
//! Filesystem preopens follow the profile's capability row: wasm3 never
//! receives one.

use crate::config::ContainerConfig;
use crate::error::Result;
use crate::guest::HostState;
use crate::runtime::{Runtime, RuntimeBackend, fuel_budget_for, link_error};
use async_trait::async_trait;
use std::path::PathBuf;
use wasmtime::{Caller, Engine, Linker};

/// Fuel-metered backend for one engine profile.
pub struct EngineRuntime {
    backend: RuntimeBackend,
    engine: Engine,
    config: ContainerConfig,
    unavailable: Option<String>,
}

impl EngineRuntime {
    pub(crate) fn new(
        backend: RuntimeBackend,
        engine: Engine,
        config: ContainerConfig,
        unavailable: Option<String>,
    ) -> Self {
        debug_assert!(backend.is_metered());
        Self {
            backend,
            engine,
            config,
            unavailable,
        }
    }
}

#[async_trait]
impl Runtime for EngineRuntime {
    fn backend(&self) -> RuntimeBackend {
        self.backend
    }

    fn engine(&self) -> &Engine {
        &self.engine
    }

    fn config(&self) -> &ContainerConfig {
        &self.config
    }

    fn is_available(&self) -> bool {
        self.unavailable.is_none()
    }

    fn unavailable_reason(&self) -> Option<String> {
        self.unavailable.clone()
    }

    fn fuel_budget(&self) -> Option<u64> {
        Some(fuel_budget_for(&self.config))
    }

    fn preopen_dir(&self) -> Option<PathBuf> {
        let isolation = self.config.isolation();
        if isolation.file_system_access && self.capabilities().file_system_access {
            isolation.preopen_dir
        } else {
            None
        }
    }

    fn add_backend_imports(&self, linker: &mut Linker<HostState>) -> Result<()> {
        let namespace = self.backend.as_str();
        let err = link_error(namespace);

        linker
            .func_wrap(
                namespace,
                "fuel_remaining",
                |caller: Caller<'_, HostState>| -> wasmtime::Result<i64> {
                    Ok(i64::try_from(caller.get_fuel()?).unwrap_or(i64::MAX))
                },
            )
            .map_err(&err)?;

        linker
            .func_wrap(
                namespace,
                "fuel_consume",
                |mut caller: Caller<'_, HostState>, amount: i64| -> wasmtime::Result<i32> {
                    let Ok(amount) = u64::try_from(amount) else {
                        return Ok(0);
                    };
                    let remaining = caller.get_fuel()?;
                    if remaining < amount {
                        return Ok(0);
                    }
                    caller.set_fuel(remaining - amount)?;
                    Ok(1)
                },
            )
            .map_err(&err)?;

        linker
            .func_wrap(namespace, "budget_ms", |caller: Caller<'_, HostState>| {
                i64::try_from(caller.data().cpu_limit.as_millis()).unwrap_or(i64::MAX)
            })
            .map_err(&err)?;

        Ok(())
    }
}
