//! Error types for the container host.

use std::time::Duration;

/// Result type alias for container host operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while managing containers.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Lookup Errors
    // =========================================================================
    /// Container not found.
    #[error("container not found: {0}")]
    ContainerNotFound(String),

    /// Exported function not found in the guest module.
    #[error("function '{function}' not found in container '{container}'")]
    FunctionNotFound { container: String, function: String },

    // =========================================================================
    // Lifecycle Errors
    // =========================================================================
    /// Container could not be started. Wraps the underlying cause.
    #[error("failed to start container '{name}': {source}")]
    StartupFailed {
        name: String,
        #[source]
        source: Box<Error>,
    },

    /// Restart failed during stop or re-initialization.
    #[error("failed to restart container '{id}': {source}")]
    RestartFailed {
        id: String,
        #[source]
        source: Box<Error>,
    },

    /// Hot reload failed; the previous guest instance is still active.
    #[error("failed to hot reload container '{id}': {source}")]
    HotReloadFailed {
        id: String,
        #[source]
        source: Box<Error>,
    },

    /// Container is in wrong state for operation.
    #[error("container '{id}' is in state '{state}', expected '{expected}'")]
    InvalidState {
        id: String,
        state: String,
        expected: String,
    },

    /// Invalid container name or ID.
    #[error("invalid container ID '{id}': {reason}")]
    InvalidContainerId { id: String, reason: String },

    /// The manager is at its container limit.
    #[error("maximum container limit reached ({limit})")]
    CapacityExceeded { limit: usize },

    // =========================================================================
    // Resource Governance Errors
    // =========================================================================
    /// Guest linear memory exceeds the configured limit.
    #[error("memory limit exceeded in container '{container}': {used} > {limit} bytes")]
    MemoryLimitExceeded {
        container: String,
        used: u64,
        limit: u64,
    },

    /// Operation timed out or exhausted its CPU budget.
    #[error("operation timed out after {limit:?}: {operation}")]
    Timeout { operation: String, limit: Duration },

    /// Call or module rejected by the security policy.
    #[error("security violation in container '{container}': {detail}")]
    SecurityViolation { container: String, detail: String },

    // =========================================================================
    // Module Errors
    // =========================================================================
    /// Module could not be downloaded from the registry.
    #[error("failed to download module '{name}': {reason}")]
    RegistryDownloadFailed { name: String, reason: String },

    /// Module bytes failed to compile.
    #[error("failed to compile module '{name}': {reason}")]
    CompilationFailed { name: String, reason: String },

    /// Module exceeds the size limit.
    #[error("module exceeds size limit: {size} > {limit} bytes")]
    ModuleTooLarge { size: usize, limit: usize },

    // =========================================================================
    // Runtime Errors
    // =========================================================================
    /// Backend identifier has no runtime implementation.
    #[error("unsupported backend: {0}")]
    UnsupportedBackend(String),

    /// No backend is available on this host.
    #[error("no runtime backend available on this host")]
    NoRuntimeAvailable,

    /// Runtime not available on this platform.
    #[error("runtime '{runtime}' not available: {reason}")]
    RuntimeUnavailable { runtime: String, reason: String },

    /// Module instantiation failed.
    #[error("failed to instantiate module for container '{container}': {reason}")]
    InstantiationFailed { container: String, reason: String },

    /// Module was compiled by a different engine than the container's runtime.
    #[error("module for container '{container}' was compiled by a different engine")]
    EngineMismatch { container: String },

    /// Guest function trapped or failed.
    #[error("call to '{function}' failed in container '{container}': {reason}")]
    ExecutionFailed {
        container: String,
        function: String,
        reason: String,
    },

    // =========================================================================
    // Deployment Errors
    // =========================================================================
    /// Deployment to the external container engine failed.
    #[error("failed to deploy container '{id}': {reason}")]
    DeploymentFailed { id: String, reason: String },

    // =========================================================================
    // Configuration / I/O Errors
    // =========================================================================
    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Internal error (should not happen).
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Returns true for timeout-classed errors (wall-clock or fuel).
    pub fn is_timeout(&self) -> bool {
        matches!(self.root(), Self::Timeout { .. })
    }

    /// Returns true for memory-classed errors.
    pub fn is_memory(&self) -> bool {
        matches!(self.root(), Self::MemoryLimitExceeded { .. })
    }

    /// Returns true for security-classed errors.
    pub fn is_security(&self) -> bool {
        matches!(self.root(), Self::SecurityViolation { .. })
    }

    /// Returns true for not-found-classed errors.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self.root(),
            Self::ContainerNotFound(_) | Self::FunctionNotFound { .. }
        )
    }

    /// Unwraps context-carrying variants down to the original cause.
    pub fn root(&self) -> &Error {
        match self {
            Self::StartupFailed { source, .. }
            | Self::RestartFailed { source, .. }
            | Self::HotReloadFailed { source, .. } => source.root(),
            other => other,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
