//! Deploy Service
//!
//! REST API for deploying resources + background reconciliation loop

use anyhow::{Context, Result};
use build_context::BuildContextAssembler;
use container_client::DockerEngine;
use deploy_service::{
    create_router, AppState, Config, HttpNotifier, NoopNotifier, Notifier, Orchestrator,
    PostDeployTester, Reconciler,
};
use resource_registry::{Registry, RegistryConfig};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "deploy_service=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Configuration
    let config = Config::from_env().context("Failed to load configuration")?;

    info!("Starting Deploy Service");
    info!("Redis URL: {}", config.redis_url);
    info!("Docker host: {}", config.docker_host);
    info!("Base domain: {}", config.base_domain);
    info!("Base image: {}", config.base_image);

    // Registry falls back to memory when Redis is unreachable
    let registry = Arc::new(Registry::connect(&config.redis_url, RegistryConfig::default()).await);
    if registry.is_degraded() {
        warn!("Registry is running in memory; records will not survive a restart");
    }

    let engine = DockerEngine::connect(config.engine_config())
        .context("Failed to connect to container engine")?;

    let notifier: Arc<dyn Notifier> = match &config.ledger_url {
        Some(url) => {
            info!("Ledger URL: {}", url);
            Arc::new(HttpNotifier::new(url.clone(), config.ledger_api_key.clone())?)
        }
        None => {
            info!("No LEDGER_URL configured, status pushes disabled");
            Arc::new(NoopNotifier)
        }
    };

    let orchestrator = Arc::new(
        Orchestrator::new(
            registry,
            Arc::new(engine),
            BuildContextAssembler::new(config.assembler_config()),
            notifier,
            config.orchestrator_config(),
        )
        .with_tester(PostDeployTester::new(config.tester_config())),
    );

    let reconciler = Arc::new(Reconciler::new(
        orchestrator.clone(),
        config.reconciler_config(),
    ));

    // Spawn reconciliation loop (first pass runs immediately)
    let reconcile_handle = tokio::spawn(reconciler.clone().run());

    // Create router
    let app = create_router(AppState {
        orchestrator,
        reconciler,
    });

    // Start API server
    let addr = config.bind_address();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    info!("Deploy Service API running on http://{}", addr);

    axum::serve(listener, app)
        .await
        .context("Server error")?;

    reconcile_handle.abort();

    Ok(())
}
