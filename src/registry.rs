//! # Module Sources
//!
//! Resolves a container name to raw module bytes. The manager only sees the
//! [`ModuleSource`] trait; three implementations ship with the crate:
//!
//! | Source                    | Backing store                         |
//! |---------------------------|---------------------------------------|
//! | [`RegistryClient`]        | `GET {registry}/containers/{name}`    |
//! | [`StaticModuleSource`]    | In-memory map (embedding, tests)      |
//! | [`DirectoryModuleSource`] | `<dir>/<name>.wasm` on local disk     |
//!
//! ## Security Model
//!
//! - Names are validated against the container-name allowlist before they
//!   are placed into a URL or a path, which rules out path traversal and
//!   URL injection.
//! - Downloads are bounded by `network_timeout` for the whole exchange
//!   (connect, headers and body).
//! - Bodies larger than `MAX_WASM_MODULE_SIZE` are rejected, by declared
//!   `Content-Length` first and by actual length after download.

use crate::constants::{MAX_WASM_MODULE_SIZE, REGISTRY_CONTAINERS_PATH, validate_container_name};
use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Supplies module bytes by container name.
#[async_trait]
pub trait ModuleSource: Send + Sync {
    /// Short description used in logs.
    fn describe(&self) -> String;

    /// Fetches the module bytes for `name`.
    async fn fetch(&self, name: &str) -> Result<Vec<u8>>;
}

fn check_name(name: &str) -> Result<()> {
    validate_container_name(name).map_err(|reason| Error::RegistryDownloadFailed {
        name: name.to_string(),
        reason: reason.to_string(),
    })
}

fn check_size(size: usize) -> Result<()> {
    if size > MAX_WASM_MODULE_SIZE {
        return Err(Error::ModuleTooLarge {
            size,
            limit: MAX_WASM_MODULE_SIZE,
        });
    }
    Ok(())
}

// =============================================================================
// HTTP Registry
// =============================================================================

/// HTTP module registry client.
#[derive(Debug, Clone)]
pub struct RegistryClient {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl RegistryClient {
    /// Creates a client for `base_url` with the given network timeout.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("wasmhive/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout,
        })
    }

    /// Registry base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// URL the module for `name` is downloaded from.
    pub fn module_url(&self, name: &str) -> String {
        format!("{}/{}/{}", self.base_url, REGISTRY_CONTAINERS_PATH, name)
    }

    async fn download(&self, name: &str, url: &str) -> Result<Vec<u8>> {
        let failed = |reason: String| Error::RegistryDownloadFailed {
            name: name.to_string(),
            reason,
        };

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| failed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(failed(format!("registry returned {}", status)));
        }

        if let Some(declared) = response.content_length() {
            check_size(usize::try_from(declared).unwrap_or(usize::MAX))?;
        }

        let body = response.bytes().await.map_err(|e| failed(e.to_string()))?;
        check_size(body.len())?;
        Ok(body.to_vec())
    }
}

#[async_trait]
impl ModuleSource for RegistryClient {
    fn describe(&self) -> String {
        format!("registry {}", self.base_url)
    }

    async fn fetch(&self, name: &str) -> Result<Vec<u8>> {
        check_name(name)?;
        let url = self.module_url(name);
        info!(module = %name, url = %url, "Downloading module");

        let bytes = tokio::time::timeout(self.timeout, self.download(name, &url))
            .await
            .map_err(|_| Error::Timeout {
                operation: format!("download module {}", name),
                limit: self.timeout,
            })??;

        debug!(module = %name, size = bytes.len(), "Downloaded module");
        Ok(bytes)
    }
}

// =============================================================================
// In-memory Source
// =============================================================================

/// Module source backed by an in-memory map.
#[derive(Debug, Default)]
pub struct StaticModuleSource {
    modules: RwLock<HashMap<String, Vec<u8>>>,
}

impl StaticModuleSource {
    /// Creates an empty source.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a module, builder style.
    pub fn with_module(self, name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        self.insert(name, bytes);
        self
    }

    /// Adds or replaces a module.
    pub fn insert(&self, name: impl Into<String>, bytes: impl Into<Vec<u8>>) {
        self.modules.write().insert(name.into(), bytes.into());
    }

    /// Removes a module. Returns true if it was present.
    pub fn remove(&self, name: &str) -> bool {
        self.modules.write().remove(name).is_some()
    }
}

#[async_trait]
impl ModuleSource for StaticModuleSource {
    fn describe(&self) -> String {
        format!("static ({} modules)", self.modules.read().len())
    }

    async fn fetch(&self, name: &str) -> Result<Vec<u8>> {
        let bytes = self
            .modules
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::RegistryDownloadFailed {
                name: name.to_string(),
                reason: "module not found".to_string(),
            })?;
        check_size(bytes.len())?;
        Ok(bytes)
    }
}

// =============================================================================
// Directory Source
// =============================================================================

/// Module source reading `<dir>/<name>.wasm`.
///
/// Files ending in `.wat` are accepted too when no `.wasm` file exists; the
/// engine compiles the text format directly.
#[derive(Debug, Clone)]
pub struct DirectoryModuleSource {
    root: PathBuf,
}

impl DirectoryModuleSource {
    /// Creates a source rooted at `root`.
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// Root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, name: &str) -> Option<PathBuf> {
        ["wasm", "wat"]
            .iter()
            .map(|ext| self.root.join(format!("{}.{}", name, ext)))
            .find(|path| path.is_file())
    }
}

#[async_trait]
impl ModuleSource for DirectoryModuleSource {
    fn describe(&self) -> String {
        format!("directory {}", self.root.display())
    }

    async fn fetch(&self, name: &str) -> Result<Vec<u8>> {
        // SECURITY: Name allowlist forbids '/' and '..' segments
        check_name(name)?;

        let path = self.resolve(name).ok_or_else(|| Error::RegistryDownloadFailed {
            name: name.to_string(),
            reason: format!("no module file for '{}' in {}", name, self.root.display()),
        })?;

        let size = tokio::fs::metadata(&path).await?.len();
        check_size(usize::try_from(size).unwrap_or(usize::MAX))?;

        let bytes = tokio::fs::read(&path).await?;
        debug!(module = %name, path = %path.display(), "Loaded module from disk");
        Ok(bytes)
    }
}
