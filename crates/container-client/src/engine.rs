use async_trait::async_trait;
use paygate_common::{DeployError, ResourceType};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    #[error("No such object: {0}")]
    NotFound(String),

    /// Non-success response, status and body as the engine sent them
    #[error("HTTP {status}: {message}")]
    Api { status: u16, message: String },

    #[error("{message}")]
    Build { message: String, output: String },

    #[error("Engine unreachable: {0}")]
    Transport(String),
}

impl EngineError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, EngineError::NotFound(_))
    }
}

impl From<EngineError> for DeployError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Build { message, output } => DeployError::Build { message, output },
            other => DeployError::Engine(other.to_string()),
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

/// Inputs for an image build
#[derive(Debug, Clone, Default)]
pub struct BuildRequest {
    /// Uncompressed tar stream with a `Dockerfile` at the root
    pub context: Vec<u8>,
    pub build_args: HashMap<String, String>,
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CreateContainerSpec {
    pub resource_id: String,
    pub resource_type: ResourceType,
    pub image: String,
    /// Port the process listens on inside the container
    pub port: u16,
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerStatus {
    pub running: bool,
    /// Engine health check verdict; equals `running` when the image
    /// defines no health check
    pub healthy: bool,
    pub exit_code: Option<i64>,
}

/// A managed container as seen by a label-filtered listing
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceContainer {
    pub id: String,
    pub name: Option<String>,
    /// Taken from the resource-id label; empty when the label is missing
    pub resource_id: String,
    pub image: Option<String>,
    /// Human-readable engine status, e.g. `Up 3 minutes`
    pub status: Option<String>,
}

/// Container engine operations the orchestrator depends on.
///
/// Implementations must not retry. Missing objects are reported as
/// [`EngineError::NotFound`] so callers can tell drift from failure.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Build the resource image, returning its tag
    async fn build_image(&self, resource_id: &str, request: BuildRequest) -> EngineResult<String>;

    /// Create (not start) the resource container, returning its id
    async fn create_container(&self, spec: &CreateContainerSpec) -> EngineResult<String>;

    async fn start_container(&self, container_id: &str) -> EngineResult<()>;

    /// Graceful stop with a bounded grace period. Stopping a stopped
    /// container succeeds.
    async fn stop_container(&self, container_id: &str) -> EngineResult<()>;

    /// Force removal including anonymous volumes
    async fn remove_container(&self, container_id: &str) -> EngineResult<()>;

    async fn container_status(&self, container_id: &str) -> EngineResult<ContainerStatus>;

    async fn container_logs(&self, container_id: &str, tail: usize) -> EngineResult<String>;

    /// Containers carrying the managed label, running or not
    async fn list_resource_containers(&self) -> EngineResult<Vec<ResourceContainer>>;

    async fn image_exists(&self, image: &str) -> EngineResult<bool>;

    async fn image_label(&self, image: &str, label: &str) -> EngineResult<Option<String>>;

    async fn remove_image(&self, image: &str) -> EngineResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use paygate_common::ErrorKind;

    #[test]
    fn test_build_error_keeps_output() {
        let err: DeployError = EngineError::Build {
            message: "npm ERR! missing script".to_string(),
            output: "Step 1/9\nnpm ERR! missing script".to_string(),
        }
        .into();

        assert_eq!(err.kind(), ErrorKind::Build);
        assert!(err.detail().contains("Step 1/9"));
    }

    #[test]
    fn test_api_error_is_verbatim() {
        let err = EngineError::Api {
            status: 409,
            message: "Conflict. The container name \"/paygate-abc\" is already in use".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "HTTP 409: Conflict. The container name \"/paygate-abc\" is already in use"
        );

        let deploy: DeployError = err.into();
        assert_eq!(deploy.kind(), ErrorKind::Infrastructure);
    }
}
