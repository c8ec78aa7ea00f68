//! # Container Host Constants
//!
//! Defines the resource limits, timeouts and default configuration values
//! used across the container host. These constants are the **single source
//! of truth** for governance bounds throughout the codebase.
//!
//! ## Security Rationale
//!
//! All limits are chosen to prevent resource exhaustion from malicious or
//! buggy guest modules while allowing legitimate workloads. Each constant
//! documents:
//! - The bounded value and units
//! - The rationale for the limit
//! - The failure mode it guards against
//!
//! ## Cross-References
//!
//! - [`crate::config`]: Uses defaults for container and manager configuration
//! - [`crate::container`]: Uses call timeouts and warning thresholds
//! - [`crate::manager`]: Uses capacity, cache and metrics defaults
//! - [`crate::runtimes`]: Uses fuel and module size limits

use std::time::Duration;

// =============================================================================
// Capacity Limits
// =============================================================================

/// Default maximum number of concurrently registered containers.
///
/// **Rationale**: Each container owns a wasmtime store and linear memory.
/// Ten units keeps a default host comfortably within a few hundred MiB.
pub const DEFAULT_MAX_CONTAINERS: usize = 10;

/// Default module cache capacity in bytes (100 MiB).
///
/// **Rationale**: Cache accounting uses the raw module size. Modules that
/// would push the cache past this bound are compiled but not cached.
pub const DEFAULT_CACHE_SIZE: u64 = 100 * 1024 * 1024;

// =============================================================================
// Memory Limits
// =============================================================================

/// Size of one WebAssembly linear memory page (64 KiB).
pub const WASM_PAGE_SIZE: u64 = 64 * 1024;

/// Default linear memory limit for a container (16 MiB).
///
/// **Security**: Containers without an explicit limit get this default to
/// prevent unbounded memory consumption.
pub const DEFAULT_MAX_MEMORY: u64 = 16 * 1024 * 1024;

/// Maximum WASM memory pages (64 KiB each, 4 GiB total).
///
/// **Security**: Caps the addressable memory for a WASM instance.
/// 65536 pages × 64 KiB = 4 GiB (the 32-bit address space limit).
pub const MAX_WASM_MEMORY_PAGES: u64 = 65536;

/// Maximum WASM module size (256 MiB).
///
/// **Security**: Prevents memory exhaustion during module compilation.
/// Compilation typically uses 10-20x the module size in memory.
pub const MAX_WASM_MODULE_SIZE: usize = 256 * 1024 * 1024;

/// Fraction of the memory limit at which `memory:warning` fires.
pub const MEMORY_WARNING_RATIO: f64 = 0.8;

// =============================================================================
// CPU Limits
// =============================================================================

/// Default WASM fuel budget per call (1 billion operations).
///
/// **Security**: Bounds CPU time for metered backends. Each WASM
/// instruction consumes roughly one unit of fuel.
///
/// **Recovery**: When fuel is exhausted, the call traps and is reported as a
/// timeout-classed error. The container stays usable.
pub const DEFAULT_WASM_FUEL: u64 = 1_000_000_000;

/// Fuel granted per millisecond of configured CPU time on metered backends.
///
/// **Rationale**: 1B ops corresponds to roughly 1-10 seconds of execution,
/// so 100k ops per millisecond sits at the fast end of that range.
pub const FUEL_PER_MILLISECOND: u64 = 100_000;

/// CPU usage percentage above which `cpu:threshold` fires.
pub const CPU_THRESHOLD_PERCENT: f64 = 80.0;

// =============================================================================
// Timeouts
// =============================================================================

/// Default timeout for a single guest call (5 seconds).
///
/// Overridden by `ContainerConfig::max_cpu_time` when set. The timeout is
/// advisory: the caller is released, the guest call is not interrupted.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_millis(5000);

/// Default timeout for module downloads (30 seconds).
///
/// **Security**: Prevents indefinite hangs from unresponsive registries.
pub const DEFAULT_NETWORK_TIMEOUT: Duration = Duration::from_secs(30);

/// Grace delay between stop and re-initialization during restart.
pub const RESTART_GRACE_PERIOD: Duration = Duration::from_millis(100);

/// Default interval of the per-container metrics collection task.
pub const DEFAULT_METRICS_INTERVAL: Duration = Duration::from_secs(1);

// =============================================================================
// Registry
// =============================================================================

/// Default module registry base URL.
pub const DEFAULT_REGISTRY_URL: &str = "http://localhost:8080";

/// Path segment under which the registry serves module bytes.
///
/// Modules are fetched from `{registry}/containers/{name}`.
pub const REGISTRY_CONTAINERS_PATH: &str = "containers";

/// Default version label for containers.
pub const DEFAULT_CONTAINER_VERSION: &str = "latest";

/// Image prefix used when generating deployment descriptors.
pub const DOCKER_IMAGE_PREFIX: &str = "wasmhive";

/// Prefix for environment variables that override manager configuration.
pub const ENV_PREFIX: &str = "WASMHIVE_";

// =============================================================================
// Validation Patterns
// =============================================================================

/// Valid characters for container names/IDs.
///
/// Includes: `a-z`, `A-Z`, `0-9`, `-`, `_`
///
/// **Security**: Excludes `/`, `.`, and other characters that could be used
/// for path traversal when names are used in registry URLs or file paths.
pub const CONTAINER_NAME_VALID_CHARS: &str =
    "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789-_";

/// Maximum container ID length.
///
/// **Rationale**: 128 characters accommodates a descriptive name plus the
/// generated timestamp and random suffix.
pub const MAX_CONTAINER_ID_LEN: usize = 128;

/// Maximum container name length.
///
/// Leaves room within `MAX_CONTAINER_ID_LEN` for the generated suffix.
pub const MAX_CONTAINER_NAME_LEN: usize = 96;

// =============================================================================
// Name Validation Helpers
// =============================================================================

/// Validates a container name for safety.
///
/// # Security
///
/// This function ensures container names:
/// - Are non-empty
/// - Don't exceed `MAX_CONTAINER_NAME_LEN`
/// - Only contain characters from `CONTAINER_NAME_VALID_CHARS`
///
/// # Returns
///
/// `Ok(())` if valid, `Err(reason)` with a description of the failure.
#[inline]
#[must_use = "validation result must be checked to ensure the name is safe"]
pub fn validate_container_name(name: &str) -> std::result::Result<(), &'static str> {
    if name.is_empty() {
        return Err("container name cannot be empty");
    }
    if name.len() > MAX_CONTAINER_NAME_LEN {
        return Err("container name exceeds maximum length");
    }
    if !name.chars().all(|c| CONTAINER_NAME_VALID_CHARS.contains(c)) {
        return Err("container name contains invalid characters");
    }
    Ok(())
}

/// Validates a container ID for safety.
#[inline]
#[must_use = "validation result must be checked to ensure container ID is safe"]
pub fn validate_container_id(id: &str) -> std::result::Result<(), &'static str> {
    if id.is_empty() {
        return Err("container ID cannot be empty");
    }
    if id.len() > MAX_CONTAINER_ID_LEN {
        return Err("container ID exceeds maximum length");
    }
    if !id.chars().all(|c| CONTAINER_NAME_VALID_CHARS.contains(c)) {
        return Err("container ID contains invalid characters");
    }
    Ok(())
}

/// Number of 64 KiB pages needed to hold `bytes`, rounded up and clamped to
/// `MAX_WASM_MEMORY_PAGES`.
#[inline]
pub fn pages_for_bytes(bytes: u64) -> u64 {
    bytes.div_ceil(WASM_PAGE_SIZE).min(MAX_WASM_MEMORY_PAGES)
}
