//! Shared fixtures: an in-memory container engine and a recording notifier

#![allow(dead_code)]

use async_trait::async_trait;
use build_context::{AssemblerConfig, BuildContextAssembler};
use container_client::{
    container_name, image_tag, BuildRequest, ContainerEngine, ContainerStatus, CreateContainerSpec,
    EngineError, EngineResult, ResourceContainer,
};
use deploy_service::{
    Notifier, Orchestrator, OrchestratorConfig, Reconciler, ReconcilerConfig, StatusUpdate,
    TestSuiteReport,
};
use paygate_common::{Endpoint, PricingModel, ResourceConfig, ResourceType, SourceFiles};
use resource_registry::Registry;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const BASE_IMAGE: &str = "paygate/resource-base:latest";
pub const BASE_DOMAIN: &str = "paygate.dev";
pub const MAX_CONTEXT_BYTES: usize = 16 * 1024;
pub const WALLET: &str = "0x1111111111111111111111111111111111111111";

#[derive(Debug, Clone)]
pub struct MockContainer {
    pub id: String,
    pub name: String,
    pub resource_id: String,
    pub image: String,
    pub running: bool,
    pub env: BTreeMap<String, String>,
}

#[derive(Default)]
struct MockState {
    calls: Vec<String>,
    containers: Vec<MockContainer>,
    images: HashSet<String>,
    builds: Vec<BuildRequest>,
    next_id: u32,
    healthy: bool,
    fail_build: bool,
}

impl MockState {
    fn find(&mut self, id_or_name: &str) -> Option<&mut MockContainer> {
        self.containers
            .iter_mut()
            .find(|c| c.id == id_or_name || c.name == id_or_name)
    }
}

/// Container engine fake. Containers report healthy while running unless
/// health is switched off.
pub struct MockEngine {
    state: Mutex<MockState>,
}

impl MockEngine {
    pub fn new() -> Self {
        let mut state = MockState {
            healthy: true,
            ..Default::default()
        };
        state.images.insert(BASE_IMAGE.to_string());
        Self {
            state: Mutex::new(state),
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn call_count(&self) -> usize {
        self.state.lock().unwrap().calls.len()
    }

    pub fn calls_to(&self, method: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.split(':').next() == Some(method))
            .count()
    }

    pub fn clear_calls(&self) {
        self.state.lock().unwrap().calls.clear();
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.state.lock().unwrap().healthy = healthy;
    }

    pub fn set_fail_build(&self, fail: bool) {
        self.state.lock().unwrap().fail_build = fail;
    }

    pub fn remove_base_image(&self) {
        self.state.lock().unwrap().images.remove(BASE_IMAGE);
    }

    pub fn has_image(&self, image: &str) -> bool {
        self.state.lock().unwrap().images.contains(image)
    }

    pub fn add_image(&self, image: &str) {
        self.state.lock().unwrap().images.insert(image.to_string());
    }

    pub fn containers(&self) -> Vec<MockContainer> {
        self.state.lock().unwrap().containers.clone()
    }

    pub fn container(&self, id: &str) -> Option<MockContainer> {
        self.state.lock().unwrap().find(id).cloned()
    }

    pub fn running_containers(&self) -> Vec<MockContainer> {
        self.containers().into_iter().filter(|c| c.running).collect()
    }

    pub fn last_build(&self) -> Option<BuildRequest> {
        self.state.lock().unwrap().builds.last().cloned()
    }

    /// Place a managed container directly, bypassing the orchestrator
    pub fn insert_container(&self, resource_id: &str, running: bool) -> String {
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let id = format!("ctr-{}", state.next_id);
        state.containers.push(MockContainer {
            id: id.clone(),
            name: container_name(resource_id),
            resource_id: resource_id.to_string(),
            image: image_tag(resource_id),
            running,
            env: BTreeMap::new(),
        });
        state.images.insert(image_tag(resource_id));
        id
    }

    /// Simulate the process exiting
    pub fn kill(&self, container_id: &str) {
        if let Some(container) = self.state.lock().unwrap().find(container_id) {
            container.running = false;
        }
    }

    /// Simulate the container vanishing behind the orchestrator's back
    pub fn delete_container(&self, container_id: &str) {
        self.state
            .lock()
            .unwrap()
            .containers
            .retain(|c| c.id != container_id);
    }

    fn record(&self, call: String) -> std::sync::MutexGuard<'_, MockState> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(call);
        state
    }
}

#[async_trait]
impl ContainerEngine for MockEngine {
    async fn build_image(&self, resource_id: &str, request: BuildRequest) -> EngineResult<String> {
        let mut state = self.record(format!("build_image:{}", resource_id));
        if state.fail_build {
            return Err(EngineError::Build {
                message: "The command '/bin/sh -c npm install' returned a non-zero code: 1".to_string(),
                output: "Step 6/11 : RUN npm install\nnpm ERR! 404 Not Found - GET https://registry.npmjs.org/hono-nope".to_string(),
            });
        }
        let tag = image_tag(resource_id);
        state.images.insert(tag.clone());
        state.builds.push(request);
        Ok(tag)
    }

    async fn create_container(&self, spec: &CreateContainerSpec) -> EngineResult<String> {
        let mut state = self.record(format!("create_container:{}", spec.resource_id));
        let name = container_name(&spec.resource_id);
        if state.containers.iter().any(|c| c.name == name) {
            return Err(EngineError::Api {
                status: 409,
                message: format!("Conflict. The container name \"/{}\" is already in use", name),
            });
        }
        state.next_id += 1;
        let id = format!("ctr-{}", state.next_id);
        state.containers.push(MockContainer {
            id: id.clone(),
            name,
            resource_id: spec.resource_id.clone(),
            image: spec.image.clone(),
            running: false,
            env: spec.env.clone(),
        });
        Ok(id)
    }

    async fn start_container(&self, container_id: &str) -> EngineResult<()> {
        let mut state = self.record(format!("start_container:{}", container_id));
        match state.find(container_id) {
            Some(container) => {
                container.running = true;
                Ok(())
            }
            None => Err(EngineError::NotFound(container_id.to_string())),
        }
    }

    async fn stop_container(&self, container_id: &str) -> EngineResult<()> {
        let mut state = self.record(format!("stop_container:{}", container_id));
        match state.find(container_id) {
            Some(container) => {
                container.running = false;
                Ok(())
            }
            None => Err(EngineError::NotFound(container_id.to_string())),
        }
    }

    async fn remove_container(&self, container_id: &str) -> EngineResult<()> {
        let mut state = self.record(format!("remove_container:{}", container_id));
        let before = state.containers.len();
        state
            .containers
            .retain(|c| c.id != container_id && c.name != container_id);
        if state.containers.len() == before {
            return Err(EngineError::NotFound(container_id.to_string()));
        }
        Ok(())
    }

    async fn container_status(&self, container_id: &str) -> EngineResult<ContainerStatus> {
        let mut state = self.record(format!("container_status:{}", container_id));
        let healthy = state.healthy;
        match state.find(container_id) {
            Some(container) => Ok(ContainerStatus {
                running: container.running,
                healthy: container.running && healthy,
                exit_code: if container.running { None } else { Some(1) },
            }),
            None => Err(EngineError::NotFound(container_id.to_string())),
        }
    }

    async fn container_logs(&self, container_id: &str, tail: usize) -> EngineResult<String> {
        let mut state = self.record(format!("container_logs:{}", container_id));
        match state.find(container_id) {
            Some(container) => {
                let lines: Vec<String> = (1..=3)
                    .map(|i| format!("{} line {}", container.name, i))
                    .collect();
                let skip = lines.len().saturating_sub(tail);
                Ok(lines[skip..].join("\n"))
            }
            None => Err(EngineError::NotFound(container_id.to_string())),
        }
    }

    async fn list_resource_containers(&self) -> EngineResult<Vec<ResourceContainer>> {
        let state = self.record("list_resource_containers".to_string());
        Ok(state
            .containers
            .iter()
            .map(|c| ResourceContainer {
                id: c.id.clone(),
                name: Some(c.name.clone()),
                resource_id: c.resource_id.clone(),
                image: Some(c.image.clone()),
                status: Some(if c.running { "Up".to_string() } else { "Exited (1)".to_string() }),
            })
            .collect())
    }

    async fn image_exists(&self, image: &str) -> EngineResult<bool> {
        let state = self.record(format!("image_exists:{}", image));
        Ok(state.images.contains(image))
    }

    async fn image_label(&self, image: &str, _label: &str) -> EngineResult<Option<String>> {
        let state = self.record(format!("image_label:{}", image));
        if state.images.contains(image) {
            Ok(None)
        } else {
            Err(EngineError::NotFound(image.to_string()))
        }
    }

    async fn remove_image(&self, image: &str) -> EngineResult<()> {
        let mut state = self.record(format!("remove_image:{}", image));
        if state.images.remove(image) {
            Ok(())
        } else {
            Err(EngineError::NotFound(image.to_string()))
        }
    }
}

/// Keeps every push in memory
#[derive(Default)]
pub struct RecordingNotifier {
    pub statuses: Mutex<Vec<StatusUpdate>>,
    pub reports: Mutex<Vec<TestSuiteReport>>,
}

impl RecordingNotifier {
    pub fn statuses(&self) -> Vec<StatusUpdate> {
        self.statuses.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn resource_status(&self, update: StatusUpdate) -> anyhow::Result<()> {
        self.statuses.lock().unwrap().push(update);
        Ok(())
    }

    async fn test_results(&self, report: TestSuiteReport) -> anyhow::Result<()> {
        self.reports.lock().unwrap().push(report);
        Ok(())
    }
}

pub struct Harness {
    pub orchestrator: Arc<Orchestrator>,
    pub engine: Arc<MockEngine>,
    pub registry: Arc<Registry>,
    pub notifier: Arc<RecordingNotifier>,
}

impl Harness {
    pub fn new() -> Self {
        let engine = Arc::new(MockEngine::new());
        let registry = Arc::new(Registry::in_memory());
        let notifier = Arc::new(RecordingNotifier::default());

        let assembler = BuildContextAssembler::new(AssemblerConfig {
            base_image: BASE_IMAGE.to_string(),
            max_context_bytes: MAX_CONTEXT_BYTES,
        });
        let config = OrchestratorConfig {
            base_domain: BASE_DOMAIN.to_string(),
            health_poll_attempts: 3,
            health_poll_interval: Duration::from_millis(10),
            run_post_deploy_tests: false,
        };

        let orchestrator = Arc::new(Orchestrator::new(
            registry.clone(),
            engine.clone(),
            assembler,
            notifier.clone(),
            config,
        ));

        Self {
            orchestrator,
            engine,
            registry,
            notifier,
        }
    }

    pub fn reconciler(&self, stale_retention: Duration) -> Reconciler {
        Reconciler::new(
            self.orchestrator.clone(),
            ReconcilerConfig {
                interval: Duration::from_secs(60),
                stale_retention,
            },
        )
    }
}

pub fn resource_config() -> ResourceConfig {
    ResourceConfig {
        id: String::new(),
        name: "Weather API".to_string(),
        description: "Current weather by city".to_string(),
        creator_wallet: WALLET.to_string(),
        resource_type: ResourceType::Api,
        base_price_usdc: 0.01,
        pricing_model: PricingModel::PerRequest,
        tags: vec!["weather".to_string()],
        env_vars: HashMap::from([
            ("UNITS".to_string(), "metric".to_string()),
            ("OPENWEATHER_API_KEY".to_string(), "leak-me-not".to_string()),
        ]),
        endpoints: vec![Endpoint {
            method: "GET".to_string(),
            path: "/weather".to_string(),
            description: "Weather for a city".to_string(),
            price_usdc: None,
            example_request: None,
        }],
    }
}

pub fn source_files() -> SourceFiles {
    let main = r#"import { Hono } from 'hono'
import { serve } from '@hono/node-server'

const app = new Hono()

app.get('/weather', (c) => c.json({ city: 'Lisbon', celsius: 21 }))

serve({ fetch: app.fetch, port: Number(process.env.PORT) })
"#;
    SourceFiles::from([("src/index.ts".to_string(), main.to_string())])
}

/// Files whose total content is exactly `size` bytes
pub fn files_of_size(size: usize) -> SourceFiles {
    SourceFiles::from([("src/index.js".to_string(), "x".repeat(size))])
}
