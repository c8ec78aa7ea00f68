//! In-browser backend.
//!
//! Exposes a small DOM-flavoured surface in the `browser` namespace:
//! console logging, a monotonic clock, and a per-instance key-value store
//! standing in for web storage. Storage is only linked when the container
//! has filesystem access; `fetch_allowed` reports the network flag.

use crate::config::ContainerConfig;
use crate::error::Result;
use crate::guest::{HostState, read_utf8};
use crate::runtime::{Runtime, RuntimeBackend, link_error};
use crate::runtimes::copy_out;
use async_trait::async_trait;
use std::time::Instant;
use tracing::info;
use wasmtime::{Caller, Engine, Linker};

const NAMESPACE: &str = "browser";

/// Backend for guests running inside a browser host.
pub struct BrowserRuntime {
    engine: Engine,
    config: ContainerConfig,
    unavailable: Option<String>,
}

impl BrowserRuntime {
    pub(crate) fn new(engine: Engine, config: ContainerConfig, unavailable: Option<String>) -> Self {
        Self {
            engine,
            config,
            unavailable,
        }
    }
}

#[async_trait]
impl Runtime for BrowserRuntime {
    fn backend(&self) -> RuntimeBackend {
        RuntimeBackend::Browser
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

    fn add_backend_imports(&self, linker: &mut Linker<HostState>) -> Result<()> {
        let err = link_error(NAMESPACE);
        let isolation = self.config.isolation();

        linker
            .func_wrap(
                NAMESPACE,
                "console_log",
                |mut caller: Caller<'_, HostState>, ptr: i32, len: i32| -> wasmtime::Result<()> {
                    let msg = read_utf8(&mut caller, ptr, len)?;
                    info!(container = %caller.data().container_id, "console: {}", msg);
                    Ok(())
                },
            )
            .map_err(&err)?;

        let origin = Instant::now();
        linker
            .func_wrap(NAMESPACE, "performance_now", move || {
                origin.elapsed().as_secs_f64() * 1000.0
            })
            .map_err(&err)?;

        let network = i32::from(isolation.network_access);
        linker
            .func_wrap(NAMESPACE, "fetch_allowed", move || network)
            .map_err(&err)?;

        if !isolation.file_system_access {
            return Ok(());
        }

        linker
            .func_wrap(
                NAMESPACE,
                "storage_get",
                |mut caller: Caller<'_, HostState>,
                 kptr: i32,
                 klen: i32,
                 out: i32,
                 cap: i32|
                 -> wasmtime::Result<i32> {
                    let key = read_utf8(&mut caller, kptr, klen)?;
                    match caller.data().storage.get(&key).cloned() {
                        Some(value) => copy_out(&mut caller, &value, out, cap),
                        None => Ok(-1),
                    }
                },
            )
            .map_err(&err)?;

        linker
            .func_wrap(
                NAMESPACE,
                "storage_set",
                |mut caller: Caller<'_, HostState>,
                 kptr: i32,
                 klen: i32,
                 vptr: i32,
                 vlen: i32|
                 -> wasmtime::Result<()> {
                    let key = read_utf8(&mut caller, kptr, klen)?;
                    let value = crate::guest::read_bytes(&mut caller, vptr, vlen)?;
                    caller.data_mut().storage.insert(key, value);
                    Ok(())
                },
            )
            .map_err(&err)?;

        linker
            .func_wrap(
                NAMESPACE,
                "storage_remove",
                |mut caller: Caller<'_, HostState>, kptr: i32, klen: i32| -> wasmtime::Result<i32> {
                    let key = read_utf8(&mut caller, kptr, klen)?;
                    Ok(i32::from(caller.data_mut().storage.remove(&key).is_some()))
                },
            )
            .map_err(&err)?;

        Ok(())
    }
}
