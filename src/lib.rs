//! # wasmhive
//!
//! **Host-side manager for sandboxed WebAssembly containers**
//!
//! This crate loads and compiles WebAssembly modules, instantiates them
//! against a chosen execution backend, invokes exported functions under
//! enforced resource limits, tracks per-container metrics and publishes
//! lifecycle events to observers. Bytecode execution itself is delegated to
//! the embedded `wasmtime` engine; this crate governs everything around it.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                        ContainerManager                             │
//! │   run · stop · restart · hot_reload · scale · restart_all · cleanup │
//! │   ┌──────────────┐  ┌──────────────┐  ┌──────────────────────────┐  │
//! │   │ ModuleSource │  │ Module cache │  │ Registry (capacity-bound)│  │
//! │   └──────────────┘  └──────────────┘  └──────────────────────────┘  │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │                       ContainerInstance                             │
//! │   call (status → cpu → memory → security → export → timeout)        │
//! │   update_state · subscribe · restart · hot_reload · scale           │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │                    Runtime trait / RuntimeFactory                   │
//! │  ┌─────────┐ ┌────────┐ ┌──────────┐ ┌────────┐ ┌───────┐           │
//! │  │ browser │ │  host  │ │ wasmtime │ │ wasmer │ │ wasm3 │           │
//! │  └─────────┘ └────────┘ └──────────┘ └────────┘ └───────┘           │
//! │         shared wasmtime Engine (fuel enabled) + base imports        │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │                            EventBus                                 │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Backends
//!
//! | Backend    | Filesystem | Network | Metered | Available when           |
//! |------------|------------|---------|---------|--------------------------|
//! | `browser`  | no         | yes     | no      | compiled for the browser |
//! | `host`     | yes        | yes     | no      | always                   |
//! | `wasmtime` | yes        | no      | fuel    | engine initialised       |
//! | `wasmer`   | yes        | no      | fuel    | `wasmer` on `PATH`       |
//! | `wasm3`    | no         | no      | fuel    | `wasm3` on `PATH`        |
//!
//! # Security Model
//!
//! - **Import whitelist**: with `allowed_imports` set, a module importing
//!   anything outside the list is rejected before instantiation.
//! - **Call checks**: CPU budget, memory limit, function whitelist and the
//!   `fs_*`/`net_*` isolation conventions are checked before every call.
//! - **Bounded memory**: linear memory cannot grow past the page-rounded
//!   `max_memory` (`StoreLimits`).
//! - **Bounded execution**: calls race a timeout; metered backends also
//!   trap on fuel exhaustion.
//! - **Size limits**: modules larger than `MAX_WASM_MODULE_SIZE` (256 MiB)
//!   are rejected before compilation.
//!
//! # Example
//!
//! ```rust,ignore
//! use wasmhive::{ContainerConfig, ContainerManager, ManagerConfig, WasmValue};
//!
//! #[tokio::main]
//! async fn main() -> wasmhive::Result<()> {
//!     let manager = ContainerManager::new(ManagerConfig::default())?;
//!
//!     let counter = manager.run("counter", ContainerConfig::default()).await?;
//!     let result = counter.call("increment", &[WasmValue::I32(1)]).await?;
//!     println!("{:?}", result);
//!
//!     manager.cleanup().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod constants;
pub mod container;
pub mod docker;
pub mod error;
pub mod events;
pub mod guest;
pub mod manager;
pub mod platform;
pub mod registry;
pub mod runtime;

pub mod runtimes;

// Re-exports
pub use config::{ContainerConfig, IsolationConfig, ManagerConfig};
pub use constants::*;
pub use container::{
    ContainerInfo, ContainerInstance, ContainerMetrics, ContainerStatus, HealthDetails,
    HealthStatus, InstanceOptions, MemoryUsage, State, StateSubscription,
};
pub use docker::{DeploymentRequest, DockerClient, HttpDockerClient};
pub use error::{Error, Result};
pub use events::{Event, EventBus, EventNamespace, ListenerId, Subscription};
pub use guest::{GuestInstance, WasmValue};
pub use manager::{BulkSummary, CacheStats, ContainerManager, ContainerSummary};
pub use platform::{Arch, Capability, Os, Platform};
pub use registry::{DirectoryModuleSource, ModuleSource, RegistryClient, StaticModuleSource};
pub use runtime::{OptimizationHints, Runtime, RuntimeBackend, RuntimeCapabilities};
pub use runtimes::{BrowserRuntime, EngineRuntime, HostRuntime, RuntimeFactory};
