//! Docker deployment collaborator and compose generation.
//!
//! Deployment mechanics live outside this crate. The manager only needs an
//! identifier back from two calls, expressed by the [`DockerClient`] trait:
//!
//! ```text
//! POST {endpoint}/docker/create   DeploymentRequest  -> { "id": "<docker id>" }
//! POST {endpoint}/docker/start    { "id": "<docker id>" } -> { "id": "<docker id>" }
//! ```
//!
//! Plain-text bodies are accepted as the id as well.
//!
//! [`generate_compose`] is a pure transformation from deployment requests to
//! a compose YAML document.

use crate::constants::{DOCKER_IMAGE_PREFIX, WASM_PAGE_SIZE};
use crate::error::{Error, Result};
use crate::runtime::RuntimeBackend;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info};

/// Path of the module inside generated images.
pub const IMAGE_MODULE_PATH: &str = "/app/module.wasm";

/// Everything needed to deploy one container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentRequest {
    pub container_id: String,
    pub name: String,
    pub version: String,
    pub image: String,
    pub backend: RuntimeBackend,
    pub environment: BTreeMap<String, String>,
    /// Memory limit in bytes.
    pub memory_limit: u64,
    /// Hex SHA-256 of the module bytes.
    pub module_digest: String,
}

impl DeploymentRequest {
    /// Image reference for a container name and version.
    pub fn image_for(name: &str, version: &str) -> String {
        format!("{}/{}:{}", DOCKER_IMAGE_PREFIX, name, version)
    }
}

/// Deployment backend.
#[async_trait]
pub trait DockerClient: Send + Sync {
    /// Creates a deployment and returns its id.
    async fn create(&self, request: &DeploymentRequest) -> Result<String>;

    /// Starts a created deployment and returns its id.
    async fn start(&self, docker_id: &str) -> Result<String>;
}

#[derive(Debug, Serialize, Deserialize)]
struct IdBody {
    id: String,
}

/// [`DockerClient`] speaking JSON over HTTP.
#[derive(Debug, Clone)]
pub struct HttpDockerClient {
    client: reqwest::Client,
    endpoint: String,
    timeout: Duration,
}

impl HttpDockerClient {
    /// Creates a client for `endpoint`.
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            timeout,
        })
    }

    /// Deployment endpoint base URL.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn post<B: Serialize + ?Sized>(&self, action: &str, id: &str, body: &B) -> Result<String> {
        let url = format!("{}/docker/{}", self.endpoint, action);
        let failed = |reason: String| Error::DeploymentFailed {
            id: id.to_string(),
            reason,
        };

        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    Error::Timeout {
                        operation: format!("docker {} for {}", action, id),
                        limit: self.timeout,
                    }
                } else {
                    failed(e.to_string())
                }
            })?;

        let status = response.status();
        let text = response.text().await.map_err(|e| failed(e.to_string()))?;
        if !status.is_success() {
            return Err(failed(format!("{} returned {}: {}", url, status, text.trim())));
        }

        let docker_id = match serde_json::from_str::<IdBody>(&text) {
            Ok(body) => body.id,
            Err(_) => text.trim().trim_matches('"').to_string(),
        };
        if docker_id.is_empty() {
            return Err(failed(format!("{} returned an empty id", url)));
        }

        debug!(container = %id, action, docker_id = %docker_id, "Docker call succeeded");
        Ok(docker_id)
    }
}

#[async_trait]
impl DockerClient for HttpDockerClient {
    async fn create(&self, request: &DeploymentRequest) -> Result<String> {
        info!(container = %request.container_id, image = %request.image, "Creating docker deployment");
        self.post("create", &request.container_id, request).await
    }

    async fn start(&self, docker_id: &str) -> Result<String> {
        let body = IdBody {
            id: docker_id.to_string(),
        };
        self.post("start", docker_id, &body).await
    }
}

// =============================================================================
// Compose Generation
// =============================================================================

#[derive(Debug, Serialize)]
struct ComposeFile {
    version: &'static str,
    services: BTreeMap<String, ComposeService>,
}

#[derive(Debug, Serialize)]
struct ComposeService {
    image: String,
    command: Vec<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    environment: BTreeMap<String, String>,
    deploy: ComposeDeploy,
    labels: BTreeMap<String, String>,
}

#[derive(Debug, Serialize)]
struct ComposeDeploy {
    resources: ComposeResources,
}

#[derive(Debug, Serialize)]
struct ComposeResources {
    limits: ComposeLimits,
}

#[derive(Debug, Serialize)]
struct ComposeLimits {
    memory: String,
}

/// Command line that runs the module for a backend inside the image.
pub fn backend_command(backend: RuntimeBackend) -> Vec<String> {
    let parts: &[&str] = match backend {
        RuntimeBackend::Wasmer => &["wasmer", "run", IMAGE_MODULE_PATH],
        RuntimeBackend::Wasm3 => &["wasm3", IMAGE_MODULE_PATH],
        RuntimeBackend::Browser | RuntimeBackend::Host | RuntimeBackend::Wasmtime => {
            &["wasmtime", "run", IMAGE_MODULE_PATH]
        }
    };
    parts.iter().map(|s| s.to_string()).collect()
}

/// Formats a byte count as a docker memory limit.
fn memory_limit(bytes: u64) -> String {
    const MIB: u64 = 1024 * 1024;
    if bytes >= MIB && bytes % MIB == 0 {
        format!("{}m", bytes / MIB)
    } else if bytes >= WASM_PAGE_SIZE && bytes % 1024 == 0 {
        format!("{}k", bytes / 1024)
    } else {
        format!("{}b", bytes)
    }
}

/// Renders a compose document with one service per request.
///
/// Services are keyed by container id so replicas of the same module do
/// not collide.
pub fn generate_compose(requests: &[DeploymentRequest]) -> Result<String> {
    let services = requests
        .iter()
        .map(|request| {
            let labels = BTreeMap::from([
                ("wasmhive.id".to_string(), request.container_id.clone()),
                ("wasmhive.name".to_string(), request.name.clone()),
                ("wasmhive.backend".to_string(), request.backend.to_string()),
                ("wasmhive.module.digest".to_string(), request.module_digest.clone()),
            ]);
            let service = ComposeService {
                image: request.image.clone(),
                command: backend_command(request.backend),
                environment: request.environment.clone(),
                deploy: ComposeDeploy {
                    resources: ComposeResources {
                        limits: ComposeLimits {
                            memory: memory_limit(request.memory_limit),
                        },
                    },
                },
                labels,
            };
            (request.container_id.clone(), service)
        })
        .collect();

    let compose = ComposeFile {
        version: "3.8",
        services,
    };
    Ok(serde_yaml::to_string(&compose)?)
}
