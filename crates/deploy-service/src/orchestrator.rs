//! Deployment orchestrator
//!
//! Drives each resource through its lifecycle:
//! `pending → building → deploying → running`, with `updating` for
//! redeploys and `failed`/`stopped`/`lost` as resting states.
//!
//! Every status change is written to the registry before the step it
//! announces is attempted, so a crash leaves a record the reconciler can
//! act on. All mutating operations on one id run under that id's lock.

use crate::locks::ResourceLocks;
use crate::notifier::{Notifier, StatusQueue, StatusUpdate};
use crate::tester::{PostDeployTester, TestSuiteReport, TesterConfig};
use build_context::{BuildContext, BuildContextAssembler};
use container_client::{
    container_name, image_labels, image_tag, BuildRequest, ContainerEngine, CreateContainerSpec,
};
use paygate_common::{
    generate_resource_id, DeployError, DeployedResource, OperationResult, ResourceConfig,
    ResourceStatus, Result, SourceFiles,
};
use resource_registry::{ProgressEvent, Registry};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Lines of container output attached to a failed health wait
const FAILURE_LOG_TAIL: usize = 20;

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub base_domain: String,
    pub health_poll_attempts: u32,
    pub health_poll_interval: Duration,
    /// Spawn the post-deploy test suite after every successful rollout
    pub run_post_deploy_tests: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            base_domain: "localhost".to_string(),
            health_poll_attempts: 30,
            health_poll_interval: Duration::from_secs(2),
            run_post_deploy_tests: true,
        }
    }
}

pub struct Orchestrator {
    registry: Arc<Registry>,
    engine: Arc<dyn ContainerEngine>,
    assembler: BuildContextAssembler,
    notifier: Arc<dyn Notifier>,
    status_queue: StatusQueue,
    tester: Arc<PostDeployTester>,
    locks: ResourceLocks,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(
        registry: Arc<Registry>,
        engine: Arc<dyn ContainerEngine>,
        assembler: BuildContextAssembler,
        notifier: Arc<dyn Notifier>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            registry,
            engine,
            assembler,
            status_queue: StatusQueue::spawn(notifier.clone()),
            notifier,
            tester: Arc::new(PostDeployTester::new(TesterConfig::default())),
            locks: ResourceLocks::new(),
            config,
        }
    }

    pub fn with_tester(mut self, tester: PostDeployTester) -> Self {
        self.tester = Arc::new(tester);
        self
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn engine(&self) -> &Arc<dyn ContainerEngine> {
        &self.engine
    }

    pub fn locks(&self) -> &ResourceLocks {
        &self.locks
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Deploy a new resource from generated source files
    pub async fn deploy(&self, files: SourceFiles, mut config: ResourceConfig) -> OperationResult {
        let id = generate_resource_id();
        config.id = id.clone();

        if let Err(message) = config.validate() {
            warn!(resource_id = %id, "Rejected deploy request: {}", message);
            return OperationResult::failed(&id, None, &DeployError::InvalidRequest(message));
        }

        let _guard = self.locks.acquire(&id).await;
        info!(resource_id = %id, files = files.len(), name = %config.name, "Deploying resource");

        let mut resource = DeployedResource::new(config, &self.config.base_domain);
        if let Err(err) = self.persist(&resource, "Deployment requested").await {
            error!(resource_id = %id, "Failed to write initial record: {}", err);
            return OperationResult::failed(&id, None, &err);
        }

        match self.run_deploy(&mut resource, &files).await {
            Ok(()) => {
                info!(resource_id = %id, url = %resource.public_url, "Resource deployed");
                self.spawn_post_deploy_tests(&resource);
                OperationResult::ok(&resource)
            }
            Err(err) => {
                self.discard_container(&mut resource).await;
                self.mark_failed(&mut resource, &err).await;
                OperationResult::failed(&id, Some(&resource), &err)
            }
        }
    }

    async fn run_deploy(&self, resource: &mut DeployedResource, files: &SourceFiles) -> Result<()> {
        self.preflight(files).await?;

        resource.transition(ResourceStatus::Building);
        self.persist(resource, "Assembling build context").await?;
        let context = self.assembler.assemble(files, &resource.config)?;

        resource.transition(ResourceStatus::Deploying);
        self.persist(resource, "Building image and starting container").await?;
        let container_id = self.build_and_start(resource, context).await?;

        resource.mark_running(container_id);
        resource.source_files = Some(files.clone());
        self.persist(resource, "Resource is running").await
    }

    /// Replace the code (and optionally pricing/endpoints) of an existing
    /// resource. The id and public URL never change.
    pub async fn redeploy(
        &self,
        id: &str,
        files: SourceFiles,
        update: Option<ResourceConfig>,
    ) -> OperationResult {
        let _guard = self.locks.acquire(id).await;

        let mut resource = match self.load(id).await {
            Ok(resource) => resource,
            Err(err) => {
                warn!(resource_id = %id, "Redeploy rejected: {}", err);
                return OperationResult::failed(id, None, &err);
            }
        };

        if let Some(update) = update {
            let mut config = resource.config.clone();
            config.apply_update(&update);
            if let Err(message) = config.validate() {
                return OperationResult::failed(id, Some(&resource), &DeployError::InvalidRequest(message));
            }
            resource.config = config;
        }

        if let Err(err) = self.preflight(&files).await {
            warn!(resource_id = %id, "Redeploy preflight failed: {}", err);
            return OperationResult::failed(id, Some(&resource), &err);
        }

        info!(resource_id = %id, files = files.len(), "Redeploying resource");
        match self.run_redeploy(&mut resource, &files).await {
            Ok(()) => {
                info!(resource_id = %id, "Resource redeployed");
                self.spawn_post_deploy_tests(&resource);
                OperationResult::ok(&resource)
            }
            Err(err) => {
                // No rollback: the previous container and image are already gone
                self.discard_container(&mut resource).await;
                self.mark_failed(&mut resource, &err).await;
                OperationResult::failed(id, Some(&resource), &err)
            }
        }
    }

    async fn run_redeploy(&self, resource: &mut DeployedResource, files: &SourceFiles) -> Result<()> {
        let id = resource.id().to_string();

        resource.transition(ResourceStatus::Updating);
        self.persist(resource, "Redeploy requested").await?;

        if let Some(container_id) = resource.container_id.take() {
            self.teardown(&id, &container_id).await;
        }
        self.remove_image_quietly(&id).await;
        resource.healthy = false;
        self.persist(resource, "Previous deployment removed").await?;

        let context = self.assembler.assemble(files, &resource.config)?;
        let container_id = self.build_and_start(resource, context).await?;

        resource.mark_running(container_id);
        resource.source_files = Some(files.clone());
        self.persist(resource, "Resource is running").await
    }

    /// Stop the container, keeping it and the image around. Stopping a
    /// stopped resource succeeds.
    pub async fn stop(&self, id: &str) -> OperationResult {
        let _guard = self.locks.acquire(id).await;

        let mut resource = match self.load(id).await {
            Ok(resource) => resource,
            Err(err) => return OperationResult::failed(id, None, &err),
        };

        match self.stop_locked(&mut resource).await {
            Ok(()) => {
                info!(resource_id = %id, "Resource stopped");
                OperationResult::ok(&resource)
            }
            Err(err) => {
                warn!(resource_id = %id, "Failed to stop resource: {}", err);
                OperationResult::failed(id, Some(&resource), &err)
            }
        }
    }

    async fn stop_locked(&self, resource: &mut DeployedResource) -> Result<()> {
        if let Some(container_id) = resource.container_id.clone() {
            match self.engine.stop_container(&container_id).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {
                    debug!(resource_id = %resource.id(), "Container already gone");
                    resource.container_id = None;
                }
                Err(e) => return Err(e.into()),
            }
        }

        resource.transition(ResourceStatus::Stopped);
        resource.healthy = false;
        self.persist(resource, "Resource stopped").await
    }

    /// Restart the container in place, or rebuild it from the source
    /// snapshot when the container no longer exists
    pub async fn restart(&self, id: &str) -> OperationResult {
        let _guard = self.locks.acquire(id).await;

        let mut resource = match self.load(id).await {
            Ok(resource) => resource,
            Err(err) => return OperationResult::failed(id, None, &err),
        };

        info!(resource_id = %id, "Restarting resource");
        match self.restart_locked(&mut resource).await {
            Ok(()) => OperationResult::ok(&resource),
            Err(err) => {
                self.mark_failed(&mut resource, &err).await;
                OperationResult::failed(id, Some(&resource), &err)
            }
        }
    }

    /// Caller must hold the id lock
    pub(crate) async fn restart_locked(&self, resource: &mut DeployedResource) -> Result<()> {
        if let Some(container_id) = resource.container_id.clone() {
            match self.engine.stop_container(&container_id).await {
                Ok(()) => {
                    self.start_and_wait(&container_id).await?;
                    resource.mark_running(container_id);
                    return self.persist(resource, "Resource restarted").await;
                }
                Err(e) if e.is_not_found() => {
                    info!(resource_id = %resource.id(), "Container is gone, rebuilding");
                    resource.container_id = None;
                }
                Err(e) => return Err(e.into()),
            }
        }

        self.rebuild_locked(resource).await
    }

    /// Rebuild from the stored source snapshot. Caller must hold the id lock.
    pub(crate) async fn rebuild_locked(&self, resource: &mut DeployedResource) -> Result<()> {
        let files = resource.source_files.clone().ok_or_else(|| {
            DeployError::Runtime("No container and no source snapshot to rebuild from".to_string())
        })?;

        self.preflight(&files).await?;

        resource.container_id = None;
        resource.healthy = false;
        resource.transition(ResourceStatus::Building);
        self.persist(resource, "Rebuilding from source snapshot").await?;
        let context = self.assembler.assemble(&files, &resource.config)?;

        resource.transition(ResourceStatus::Deploying);
        self.persist(resource, "Building image and starting container").await?;
        let container_id = self.build_and_start(resource, context).await?;

        resource.mark_running(container_id);
        self.persist(resource, "Resource rebuilt").await
    }

    /// Remove container, image and record. Each step is attempted on its
    /// own; removing an unknown id succeeds.
    pub async fn remove(&self, id: &str) -> OperationResult {
        let _guard = self.locks.acquire(id).await;
        info!(resource_id = %id, "Removing resource");

        let record = match self.registry.get(id).await {
            Ok(record) => record,
            Err(err) => {
                warn!(resource_id = %id, "Could not read record before removal: {}", err);
                None
            }
        };

        if let Some(container_id) = record.as_ref().and_then(|r| r.container_id.clone()) {
            self.remove_container_quietly(id, &container_id).await;
        }
        self.remove_container_quietly(id, &container_name(id)).await;
        self.remove_image_quietly(id).await;

        match self.registry.delete(id).await {
            Ok(()) => {
                info!(resource_id = %id, "Resource removed");
                OperationResult::removed(id)
            }
            Err(err) => {
                error!(resource_id = %id, "Failed to delete record: {}", err);
                OperationResult::failed(id, record.as_ref(), &err)
            }
        }
    }

    /// Current record, reconciled against the engine first
    pub async fn get_status(&self, id: &str) -> OperationResult {
        match self.refresh(id).await {
            Ok(resource) => OperationResult::ok(&resource),
            Err(err) => OperationResult::failed(id, None, &err),
        }
    }

    /// Re-query the engine and fold what it reports into the record. While
    /// another operation holds the id the record is returned as stored.
    pub async fn refresh(&self, id: &str) -> Result<DeployedResource> {
        let Some(_guard) = self.locks.try_acquire(id) else {
            debug!(resource_id = %id, "Operation in flight, returning stored record");
            return self.load(id).await;
        };

        let mut resource = self.load(id).await?;
        let Some(container_id) = resource.container_id.clone() else {
            return Ok(resource);
        };

        let before = resource.clone();
        match self.engine.container_status(&container_id).await {
            Ok(status) if status.running => {
                if resource.status != ResourceStatus::Running {
                    resource.transition(ResourceStatus::Running);
                    resource.error = None;
                }
                resource.healthy = status.healthy;
            }
            Ok(status) => {
                resource.healthy = false;
                if resource.status.expects_container() {
                    // Status is kept so the reconciler makes its restart attempt
                    let exit = status
                        .exit_code
                        .map(|code| format!(" with code {}", code))
                        .unwrap_or_default();
                    resource.error = Some(format!("Container exited{}, awaiting restart", exit));
                }
            }
            Err(e) if e.is_not_found() => {
                resource.healthy = false;
                if !resource.status.expects_container() {
                    resource.container_id = None;
                } else if resource.source_files.is_some() {
                    // Left for the reconciler to rebuild
                    resource.error = Some("Container not found, awaiting rebuild".to_string());
                } else {
                    mark_lost(&mut resource);
                }
            }
            Err(e) => {
                warn!(resource_id = %id, "Could not query container status: {}", e);
                return Ok(resource);
            }
        }

        if resource != before {
            if let Err(err) = self.persist(&resource, "Status synced with container engine").await {
                warn!(resource_id = %id, "Failed to persist refreshed status: {}", err);
            }
        }

        Ok(resource)
    }

    pub async fn list(&self) -> Result<Vec<DeployedResource>> {
        self.registry.list().await
    }

    /// Tail of the container output
    pub async fn logs(&self, id: &str, tail: usize) -> Result<String> {
        let resource = self.load(id).await?;
        let target = resource
            .container_id
            .unwrap_or_else(|| container_name(id));

        match self.engine.container_logs(&target, tail).await {
            Ok(logs) => Ok(logs),
            Err(e) if e.is_not_found() => Err(DeployError::NotFound(format!("container for {}", id))),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn events(&self, id: &str) -> Vec<ProgressEvent> {
        self.registry.events(id).await
    }

    /// Cache the ledger's request and revenue counters. They never go down.
    pub async fn update_counters(
        &self,
        id: &str,
        request_count: u64,
        revenue_usdc: f64,
    ) -> Result<DeployedResource> {
        let _guard = self.locks.acquire(id).await;
        let mut resource = self.load(id).await?;

        let before = (resource.request_count, resource.revenue_usdc);
        resource.merge_counters(request_count, revenue_usdc);
        if (resource.request_count, resource.revenue_usdc) != before {
            self.registry.set(&resource).await?;
            debug!(
                resource_id = %id,
                request_count = resource.request_count,
                revenue_usdc = resource.revenue_usdc,
                "Counters updated"
            );
        }
        Ok(resource)
    }

    /// Run the post-deploy suite now and wait for the report. Refused while
    /// another operation is changing the resource.
    pub async fn test(&self, id: &str) -> Result<TestSuiteReport> {
        if self.locks.is_locked(id) {
            return Err(DeployError::Busy(format!(
                "Resource {} has an operation in progress",
                id
            )));
        }
        let resource = self.load(id).await?;
        let report = self.tester.run(&resource).await;
        record_test_report(&self.registry, self.notifier.clone(), &report).await;
        Ok(report)
    }

    async fn load(&self, id: &str) -> Result<DeployedResource> {
        self.registry
            .get(id)
            .await?
            .ok_or_else(|| DeployError::NotFound(id.to_string()))
    }

    /// Checks that need no side effect: context size and base image
    async fn preflight(&self, files: &SourceFiles) -> Result<()> {
        self.assembler.check_size(files)?;

        let base_image = &self.assembler.config().base_image;
        if !self.engine.image_exists(base_image).await? {
            return Err(DeployError::BaseImageMissing(base_image.clone()));
        }

        Ok(())
    }

    /// Build the image and run a fresh container until it reports healthy.
    /// On failure nothing this call created is left running.
    async fn build_and_start(&self, resource: &DeployedResource, context: BuildContext) -> Result<String> {
        let id = resource.id();
        let resource_type = resource.config.resource_type;

        let request = BuildRequest {
            context: context.to_tar()?,
            build_args: context.build_args.clone(),
            labels: image_labels(id, resource_type),
        };
        if !context.injected.is_empty() {
            debug!(resource_id = %id, injected = ?context.injected, "Injected runtime routes");
        }

        let image = self.engine.build_image(id, request).await?;
        self.registry
            .push_event(id, ProgressEvent::info(Some(resource.status), format!("Built image {}", image)))
            .await;

        // A container left over from an earlier attempt holds the name
        self.remove_container_quietly(id, &container_name(id)).await;

        let spec = CreateContainerSpec {
            resource_id: id.to_string(),
            resource_type,
            image,
            port: resource.internal_port,
            env: resource.config.sanitized_env(),
        };
        let container_id = self.engine.create_container(&spec).await?;
        debug!(resource_id = %id, container_id = %container_id, "Container created");

        if let Err(err) = self.start_and_wait(&container_id).await {
            self.teardown(id, &container_id).await;
            return Err(err);
        }

        Ok(container_id)
    }

    async fn start_and_wait(&self, container_id: &str) -> Result<()> {
        self.engine.start_container(container_id).await?;
        self.wait_healthy(container_id).await
    }

    async fn wait_healthy(&self, container_id: &str) -> Result<()> {
        let attempts = self.config.health_poll_attempts.max(1);
        let mut last_state = String::from("no status received");

        for attempt in 1..=attempts {
            match self.engine.container_status(container_id).await {
                Ok(status) if status.running && status.healthy => {
                    debug!(container_id = %container_id, attempt, "Container healthy");
                    return Ok(());
                }
                Ok(status) => {
                    last_state = match (status.running, status.exit_code) {
                        (true, _) => "running but not healthy".to_string(),
                        (false, Some(code)) => format!("exited with code {}", code),
                        (false, None) => "not running".to_string(),
                    };
                }
                Err(e) if e.is_not_found() => {
                    return Err(DeployError::Runtime(format!(
                        "Container {} disappeared while starting",
                        container_id
                    )));
                }
                Err(e) => last_state = e.to_string(),
            }

            if attempt < attempts {
                tokio::time::sleep(self.config.health_poll_interval).await;
            }
        }

        let waited = self.config.health_poll_interval * (attempts - 1);
        let mut message = format!(
            "Container did not become healthy after {} checks over {}s (last: {})",
            attempts,
            waited.as_secs(),
            last_state
        );
        if let Ok(logs) = self.engine.container_logs(container_id, FAILURE_LOG_TAIL).await {
            if !logs.trim().is_empty() {
                message.push('\n');
                message.push_str(logs.trim_end());
            }
        }

        Err(DeployError::Runtime(message))
    }

    /// Stop and remove, tolerating a container that is already gone
    async fn teardown(&self, resource_id: &str, container_id: &str) {
        match self.engine.stop_container(container_id).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => return,
            Err(e) => warn!(resource_id = %resource_id, "Failed to stop container {}: {}", container_id, e),
        }
        self.remove_container_quietly(resource_id, container_id).await;
    }

    async fn discard_container(&self, resource: &mut DeployedResource) {
        if let Some(container_id) = resource.container_id.take() {
            self.teardown(&resource.config.id, &container_id).await;
        }
    }

    pub(crate) async fn remove_container_quietly(&self, resource_id: &str, container: &str) {
        match self.engine.remove_container(container).await {
            Ok(()) => debug!(resource_id = %resource_id, "Removed container {}", container),
            Err(e) if e.is_not_found() => {}
            Err(e) => warn!(resource_id = %resource_id, "Failed to remove container {}: {}", container, e),
        }
    }

    pub(crate) async fn remove_image_quietly(&self, resource_id: &str) {
        let image = image_tag(resource_id);
        match self.engine.remove_image(&image).await {
            Ok(()) => debug!(resource_id = %resource_id, "Removed image {}", image),
            Err(e) if e.is_not_found() => {}
            Err(e) => warn!(resource_id = %resource_id, "Failed to remove image {}: {}", image, e),
        }
    }

    /// Write the record, log the step and tell the ledger
    pub(crate) async fn persist(&self, resource: &DeployedResource, message: &str) -> Result<()> {
        self.registry.set(resource).await?;
        self.registry
            .push_event(resource.id(), ProgressEvent::info(Some(resource.status), message))
            .await;
        self.notify_status(resource);
        Ok(())
    }

    /// Record a failure. The container id is left to the caller.
    pub(crate) async fn mark_failed(&self, resource: &mut DeployedResource, err: &DeployError) {
        let id = resource.id().to_string();
        error!(resource_id = %id, kind = ?err.kind(), "Operation failed: {}", err);

        resource.mark_failed(err.detail());
        if let Err(e) = self.registry.set(resource).await {
            error!(resource_id = %id, "Failed to record failure: {}", e);
        }
        self.registry
            .push_event(&id, ProgressEvent::error(Some(ResourceStatus::Failed), err.detail()))
            .await;
        self.notify_status(resource);
    }

    pub(crate) fn notify_status(&self, resource: &DeployedResource) {
        self.status_queue.push(StatusUpdate::from_resource(resource));
    }

    fn spawn_post_deploy_tests(&self, resource: &DeployedResource) {
        if !self.config.run_post_deploy_tests {
            return;
        }

        let tester = self.tester.clone();
        let registry = self.registry.clone();
        let notifier = self.notifier.clone();
        let resource = resource.clone();
        tokio::spawn(async move {
            let report = tester.run(&resource).await;
            record_test_report(&registry, notifier, &report).await;
        });
    }
}

/// No container and nothing to rebuild it from
pub(crate) fn mark_lost(resource: &mut DeployedResource) {
    resource.transition(ResourceStatus::Lost);
    resource.container_id = None;
    resource.healthy = false;
    resource.error = Some("Container not found and no source snapshot to rebuild from".to_string());
}

async fn record_test_report(registry: &Registry, notifier: Arc<dyn Notifier>, report: &TestSuiteReport) {
    let passed = report.stages.iter().filter(|s| s.passed).count();
    let summary = format!(
        "Post-deploy tests {}: {}/{} stages passed",
        if report.all_passed { "passed" } else { "failed" },
        passed,
        report.stages.len()
    );

    let event = if report.all_passed {
        ProgressEvent::info(None, summary)
    } else {
        let failures: Vec<String> = report
            .stages
            .iter()
            .filter_map(|s| s.error.as_ref().map(|e| format!("{:?}: {}", s.stage, e)))
            .collect();
        ProgressEvent::warn(None, format!("{} ({})", summary, failures.join("; ")))
    };
    registry.push_event(&report.resource_id, event).await;

    let report = report.clone();
    tokio::spawn(async move {
        let id = report.resource_id.clone();
        if let Err(e) = notifier.test_results(report).await {
            warn!(resource_id = %id, "Failed to push test results to ledger: {:#}", e);
        }
    });
}
