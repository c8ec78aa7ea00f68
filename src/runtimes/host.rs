//! In-process host backend.
//!
//! The default backend. Links the `host` namespace (clocks, randomness,
//! SHA-256, environment lookup and buffer helpers) and, when the container
//! is granted filesystem access with a `preopen_dir`, preopens that
//! directory for WASI.

use crate::config::ContainerConfig;
use crate::error::Result;
use crate::guest::{HostState, read_bytes, read_utf8, write_bytes};
use crate::runtime::{Runtime, RuntimeBackend, link_error};
use crate::runtimes::copy_out;
use async_trait::async_trait;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::time::Instant;
use wasmtime::{Caller, Engine, Linker};

const NAMESPACE: &str = "host";

/// Upper bound on a single `random_fill`/`buffer_*` request.
const MAX_HOST_BUFFER: i32 = 16 * 1024 * 1024;

/// Backend for guests running in-process on the host.
pub struct HostRuntime {
    engine: Engine,
    config: ContainerConfig,
    unavailable: Option<String>,
}

impl HostRuntime {
    pub(crate) fn new(engine: Engine, config: ContainerConfig, unavailable: Option<String>) -> Self {
        Self {
            engine,
            config,
            unavailable,
        }
    }
}

fn bounded_len(len: i32) -> wasmtime::Result<i32> {
    if !(0..=MAX_HOST_BUFFER).contains(&len) {
        return Err(wasmtime::Error::msg(format!(
            "buffer length {} outside 0..={}",
            len, MAX_HOST_BUFFER
        )));
    }
    Ok(len)
}

#[async_trait]
impl Runtime for HostRuntime {
    fn backend(&self) -> RuntimeBackend {
        RuntimeBackend::Host
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

    fn preopen_dir(&self) -> Option<PathBuf> {
        let isolation = self.config.isolation();
        if isolation.file_system_access {
            isolation.preopen_dir
        } else {
            None
        }
    }

    fn add_backend_imports(&self, linker: &mut Linker<HostState>) -> Result<()> {
        let err = link_error(NAMESPACE);

        linker
            .func_wrap(NAMESPACE, "now_ms", || {
                chrono::Utc::now().timestamp_millis() as f64
            })
            .map_err(&err)?;

        let origin = Instant::now();
        linker
            .func_wrap(NAMESPACE, "hrtime", move || {
                i64::try_from(origin.elapsed().as_nanos()).unwrap_or(i64::MAX)
            })
            .map_err(&err)?;

        linker
            .func_wrap(
                NAMESPACE,
                "random_fill",
                |mut caller: Caller<'_, HostState>, ptr: i32, len: i32| -> wasmtime::Result<()> {
                    let len = bounded_len(len)?;
                    let mut buf = vec![0u8; len as usize];
                    rand::thread_rng().fill_bytes(&mut buf);
                    write_bytes(&mut caller, ptr, &buf)
                },
            )
            .map_err(&err)?;

        linker
            .func_wrap(
                NAMESPACE,
                "sha256",
                |mut caller: Caller<'_, HostState>,
                 ptr: i32,
                 len: i32,
                 out: i32|
                 -> wasmtime::Result<()> {
                    let data = read_bytes(&mut caller, ptr, bounded_len(len)?)?;
                    let digest = Sha256::digest(&data);
                    write_bytes(&mut caller, out, digest.as_slice())
                },
            )
            .map_err(&err)?;

        linker
            .func_wrap(
                NAMESPACE,
                "env_get",
                |mut caller: Caller<'_, HostState>,
                 kptr: i32,
                 klen: i32,
                 out: i32,
                 cap: i32|
                 -> wasmtime::Result<i32> {
                    let key = read_utf8(&mut caller, kptr, klen)?;
                    match caller.data().environment.get(&key).cloned() {
                        Some(value) => copy_out(&mut caller, value.as_bytes(), out, cap),
                        None => Ok(-1),
                    }
                },
            )
            .map_err(&err)?;

        linker
            .func_wrap(
                NAMESPACE,
                "buffer_copy",
                |mut caller: Caller<'_, HostState>,
                 dst: i32,
                 src: i32,
                 len: i32|
                 -> wasmtime::Result<()> {
                    let data = read_bytes(&mut caller, src, bounded_len(len)?)?;
                    write_bytes(&mut caller, dst, &data)
                },
            )
            .map_err(&err)?;

        linker
            .func_wrap(
                NAMESPACE,
                "buffer_fill",
                |mut caller: Caller<'_, HostState>,
                 dst: i32,
                 byte: i32,
                 len: i32|
                 -> wasmtime::Result<()> {
                    let len = bounded_len(len)?;
                    write_bytes(&mut caller, dst, &vec![byte as u8; len as usize])
                },
            )
            .map_err(&err)?;

        Ok(())
    }
}
