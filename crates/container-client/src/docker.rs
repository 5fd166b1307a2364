use crate::engine::{
    BuildRequest, ContainerEngine, ContainerStatus, CreateContainerSpec, EngineError,
    EngineResult, ResourceContainer,
};
use crate::labels::{container_name, image_tag, routing_labels, MANAGED_LABEL, RESOURCE_ID_LABEL};
use async_trait::async_trait;
use bollard::errors::Error as BollardError;
use bollard::models::{
    BuildInfo, ContainerCreateBody, HealthConfig, HealthStatusEnum, HostConfig, RestartPolicy,
    RestartPolicyNameEnum,
};
use bollard::query_parameters::{
    BuildImageOptions, CreateContainerOptions, InspectContainerOptions, ListContainersOptions,
    LogsOptions, RemoveContainerOptions, RemoveImageOptions, StartContainerOptions,
    StopContainerOptions,
};
use bollard::{body_full, Docker};
use bytes::Bytes;
use futures_util::StreamExt;
use std::collections::HashMap;
use tracing::{debug, info, warn};

const NANOS_PER_SEC: i64 = 1_000_000_000;

#[derive(Debug, Clone)]
pub struct DockerEngineConfig {
    /// `unix:///var/run/docker.sock`, a bare socket path, or `http://`/`tcp://`
    pub address: String,
    /// Used for routing labels
    pub base_domain: String,
    /// Network the containers join so the reverse proxy can reach them
    pub network: Option<String>,
    pub memory_bytes: i64,
    pub nano_cpus: i64,
    pub stop_grace_secs: u16,
}

impl Default for DockerEngineConfig {
    fn default() -> Self {
        Self {
            address: "unix:///var/run/docker.sock".to_string(),
            base_domain: "localhost".to_string(),
            network: None,
            memory_bytes: 512 * 1024 * 1024,
            nano_cpus: NANOS_PER_SEC / 2,
            stop_grace_secs: 10,
        }
    }
}

/// [`ContainerEngine`] over the Docker Engine API
pub struct DockerEngine {
    docker: Docker,
    config: DockerEngineConfig,
}

impl DockerEngine {
    pub fn connect(config: DockerEngineConfig) -> EngineResult<Self> {
        let address = config.address.as_str();
        let docker = if address.starts_with("http://") || address.starts_with("tcp://") {
            let addr = address
                .trim_start_matches("http://")
                .trim_start_matches("tcp://");
            Docker::connect_with_http(&format!("http://{}", addr), 120, bollard::API_DEFAULT_VERSION)
        } else {
            let socket_path = address.trim_start_matches("unix://");
            Docker::connect_with_socket(socket_path, 120, bollard::API_DEFAULT_VERSION)
        }
        .map_err(|e| EngineError::Transport(format!("{}: {}", config.address, e)))?;

        info!(address = %config.address, "Connected to container engine");
        Ok(Self { docker, config })
    }

    pub fn config(&self) -> &DockerEngineConfig {
        &self.config
    }
}

/// 404 becomes `NotFound`; every other server response keeps its status
/// and message.
fn map_err(err: BollardError, object: &str) -> EngineError {
    match err {
        BollardError::DockerResponseServerError {
            status_code: 404,
            message,
        } => EngineError::NotFound(format!("{}: {}", object, message)),
        BollardError::DockerResponseServerError {
            status_code,
            message,
        } => EngineError::Api {
            status: status_code,
            message,
        },
        other => EngineError::Transport(other.to_string()),
    }
}

/// One item of the image build stream
#[derive(Debug, PartialEq)]
enum BuildLine {
    Output(String),
    Failed(String),
    Skipped,
}

/// Any line reporting an error fails the build; lines the engine sent as
/// broken JSON are skipped. Transport errors are returned as-is.
fn classify_build_item(item: Result<BuildInfo, BollardError>) -> Result<BuildLine, BollardError> {
    match item {
        Ok(info) => match info.error_detail.and_then(|detail| detail.message) {
            Some(message) => Ok(BuildLine::Failed(message)),
            None => Ok(BuildLine::Output(info.stream.unwrap_or_default())),
        },
        Err(BollardError::JsonDataError { .. }) => Ok(BuildLine::Skipped),
        Err(BollardError::DockerStreamError { error }) => Ok(BuildLine::Failed(error)),
        Err(e) => Err(e),
    }
}

fn is_not_modified(err: &BollardError) -> bool {
    matches!(
        err,
        BollardError::DockerResponseServerError {
            status_code: 304,
            ..
        }
    )
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn build_image(&self, resource_id: &str, request: BuildRequest) -> EngineResult<String> {
        let tag = image_tag(resource_id);
        info!(resource_id = %resource_id, tag = %tag, bytes = request.context.len(), "Building image");

        let options = BuildImageOptions {
            dockerfile: "Dockerfile".to_string(),
            t: Some(tag.clone()),
            rm: true,
            forcerm: true,
            buildargs: Some(request.build_args),
            labels: Some(request.labels),
            ..Default::default()
        };

        let mut stream =
            self.docker
                .build_image(options, None, Some(body_full(Bytes::from(request.context))));

        let mut output = String::new();
        while let Some(item) = stream.next().await {
            match classify_build_item(item).map_err(|e| map_err(e, &tag))? {
                BuildLine::Output(line) => output.push_str(&line),
                BuildLine::Skipped => {
                    debug!(resource_id = %resource_id, "Skipping malformed build output line");
                }
                BuildLine::Failed(message) => {
                    output.push_str(&message);
                    output.push('\n');
                    warn!(resource_id = %resource_id, error = %message, "Image build failed");
                    return Err(EngineError::Build { message, output });
                }
            }
        }

        info!(resource_id = %resource_id, tag = %tag, "Image built");
        Ok(tag)
    }

    async fn create_container(&self, spec: &CreateContainerSpec) -> EngineResult<String> {
        let name = container_name(&spec.resource_id);
        let labels = routing_labels(
            &spec.resource_id,
            spec.resource_type,
            spec.port,
            &self.config.base_domain,
        );

        let mut env: Vec<String> = spec
            .env
            .iter()
            .map(|(key, value)| format!("{}={}", key, value))
            .collect();
        env.push(format!("PORT={}", spec.port));
        env.push(format!("RESOURCE_ID={}", spec.resource_id));

        let host_config = HostConfig {
            memory: Some(self.config.memory_bytes),
            nano_cpus: Some(self.config.nano_cpus),
            network_mode: self.config.network.clone(),
            restart_policy: Some(RestartPolicy {
                name: Some(RestartPolicyNameEnum::UNLESS_STOPPED),
                maximum_retry_count: None,
            }),
            ..Default::default()
        };

        let healthcheck = HealthConfig {
            test: Some(vec![
                "CMD-SHELL".to_string(),
                format!("wget -qO- http://127.0.0.1:{}/health || exit 1", spec.port),
            ]),
            interval: Some(10 * NANOS_PER_SEC),
            timeout: Some(5 * NANOS_PER_SEC),
            retries: Some(3),
            start_period: Some(10 * NANOS_PER_SEC),
            ..Default::default()
        };

        let body = ContainerCreateBody {
            image: Some(spec.image.clone()),
            env: Some(env),
            labels: Some(labels),
            host_config: Some(host_config),
            healthcheck: Some(healthcheck),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: Some(name.clone()),
            ..Default::default()
        };

        let response = self
            .docker
            .create_container(Some(options), body)
            .await
            .map_err(|e| map_err(e, &name))?;

        for warning in &response.warnings {
            warn!(container = %name, warning = %warning, "Engine warning on create");
        }
        info!(container = %name, container_id = %response.id, "Container created");
        Ok(response.id)
    }

    async fn start_container(&self, container_id: &str) -> EngineResult<()> {
        match self
            .docker
            .start_container(container_id, None::<StartContainerOptions>)
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if is_not_modified(&e) => Ok(()),
            Err(e) => Err(map_err(e, container_id)),
        }
    }

    async fn stop_container(&self, container_id: &str) -> EngineResult<()> {
        let options = StopContainerOptions {
            t: Some(self.config.stop_grace_secs.into()),
            ..Default::default()
        };
        match self.docker.stop_container(container_id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(e) if is_not_modified(&e) => Ok(()),
            Err(e) => Err(map_err(e, container_id)),
        }
    }

    async fn remove_container(&self, container_id: &str) -> EngineResult<()> {
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };
        self.docker
            .remove_container(container_id, Some(options))
            .await
            .map_err(|e| map_err(e, container_id))
    }

    async fn container_status(&self, container_id: &str) -> EngineResult<ContainerStatus> {
        let inspect = self
            .docker
            .inspect_container(container_id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| map_err(e, container_id))?;

        let state = inspect.state.unwrap_or_default();
        let running = state.running.unwrap_or(false);
        let healthy = match state.health.and_then(|health| health.status) {
            Some(HealthStatusEnum::HEALTHY) => running,
            Some(HealthStatusEnum::NONE) | Some(HealthStatusEnum::EMPTY) | None => running,
            Some(_) => false,
        };
        let exit_code = if running { None } else { state.exit_code };

        Ok(ContainerStatus {
            running,
            healthy,
            exit_code,
        })
    }

    async fn container_logs(&self, container_id: &str, tail: usize) -> EngineResult<String> {
        let options = LogsOptions {
            stdout: true,
            stderr: true,
            tail: tail.to_string(),
            ..Default::default()
        };

        let mut stream = self.docker.logs(container_id, Some(options));
        let mut logs = String::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| map_err(e, container_id))?;
            logs.push_str(&chunk.to_string());
        }
        Ok(logs)
    }

    async fn list_resource_containers(&self) -> EngineResult<Vec<ResourceContainer>> {
        let mut filters: HashMap<String, Vec<String>> = HashMap::new();
        filters.insert("label".to_string(), vec![format!("{}=true", MANAGED_LABEL)]);

        let options = ListContainersOptions {
            all: true,
            filters: Some(filters),
            ..Default::default()
        };

        let containers = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(|e| map_err(e, "containers"))?;

        Ok(containers
            .into_iter()
            .filter_map(|c| {
                let id = c.id?;
                let resource_id = c
                    .labels
                    .as_ref()
                    .and_then(|labels| labels.get(RESOURCE_ID_LABEL).cloned())
                    .unwrap_or_default();
                Some(ResourceContainer {
                    id,
                    name: c
                        .names
                        .and_then(|names| names.first().cloned())
                        .map(|name| name.trim_start_matches('/').to_string()),
                    resource_id,
                    image: c.image,
                    status: c.status,
                })
            })
            .collect())
    }

    async fn image_exists(&self, image: &str) -> EngineResult<bool> {
        match self.docker.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(e) => Err(map_err(e, image)),
        }
    }

    async fn image_label(&self, image: &str, label: &str) -> EngineResult<Option<String>> {
        let inspect = self
            .docker
            .inspect_image(image)
            .await
            .map_err(|e| map_err(e, image))?;
        Ok(inspect
            .config
            .and_then(|config| config.labels)
            .and_then(|labels| labels.get(label).cloned()))
    }

    async fn remove_image(&self, image: &str) -> EngineResult<()> {
        let options = RemoveImageOptions {
            force: true,
            ..Default::default()
        };
        self.docker
            .remove_image(image, Some(options), None)
            .await
            .map(|_| ())
            .map_err(|e| map_err(e, image))
    }
}
