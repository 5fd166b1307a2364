//! Configuration management for the Deploy Service
//!
//! Loads configuration from environment variables with sensible defaults.

use crate::orchestrator::OrchestratorConfig;
use crate::reconciler::ReconcilerConfig;
use crate::tester::TesterConfig;
use anyhow::{Context, Result};
use build_context::{AssemblerConfig, DEFAULT_MAX_CONTEXT_BYTES};
use container_client::DockerEngineConfig;
use std::collections::HashMap;
use std::time::Duration;

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Redis connection URL
    pub redis_url: String,

    /// API server host
    pub api_host: String,

    /// API server port
    pub api_port: u16,

    /// Container engine address
    pub docker_host: String,

    /// Domain under which every resource gets `https://{id}.{base_domain}`
    pub base_domain: String,

    /// Shared image every resource is built from
    pub base_image: String,

    /// Engine network shared with the reverse proxy
    pub docker_network: Option<String>,

    /// External ledger for status and test result pushes
    pub ledger_url: Option<String>,
    pub ledger_api_key: Option<String>,

    pub reconcile_interval_secs: u64,

    /// How long failed/stopped/lost records are kept before eviction
    pub stale_retention_secs: u64,

    pub max_context_bytes: usize,

    pub health_poll_attempts: u32,
    pub health_poll_interval_ms: u64,

    /// Run the post-deploy test suite after every successful rollout
    pub run_post_deploy_tests: bool,

    /// Asset every payment option must name, when set
    pub expected_asset: Option<String>,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if it exists (for local development)
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());
        let optional = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let config = Config {
            redis_url: var("REDIS_URL", "redis://127.0.0.1:6379"),
            api_host: var("API_HOST", "0.0.0.0"),
            api_port: var("API_PORT", "8090").parse().context("Invalid API_PORT")?,
            docker_host: var("DOCKER_HOST", "unix:///var/run/docker.sock"),
            base_domain: var("BASE_DOMAIN", "localhost"),
            base_image: var("BASE_IMAGE", "paygate/resource-base:latest"),
            docker_network: optional("DOCKER_NETWORK"),
            ledger_url: optional("LEDGER_URL").map(|url| url.trim_end_matches('/').to_string()),
            ledger_api_key: optional("LEDGER_API_KEY"),
            reconcile_interval_secs: var("RECONCILE_INTERVAL_SECS", "60")
                .parse()
                .context("Invalid RECONCILE_INTERVAL_SECS")?,
            stale_retention_secs: var("STALE_RETENTION_SECS", "86400")
                .parse()
                .context("Invalid STALE_RETENTION_SECS")?,
            max_context_bytes: var("MAX_CONTEXT_BYTES", &DEFAULT_MAX_CONTEXT_BYTES.to_string())
                .parse()
                .context("Invalid MAX_CONTEXT_BYTES")?,
            health_poll_attempts: var("HEALTH_POLL_ATTEMPTS", "30")
                .parse()
                .context("Invalid HEALTH_POLL_ATTEMPTS")?,
            health_poll_interval_ms: var("HEALTH_POLL_INTERVAL_MS", "2000")
                .parse()
                .context("Invalid HEALTH_POLL_INTERVAL_MS")?,
            run_post_deploy_tests: var("RUN_POST_DEPLOY_TESTS", "true")
                .parse()
                .context("Invalid RUN_POST_DEPLOY_TESTS (expected true/false)")?,
            expected_asset: optional("EXPECTED_ASSET"),
        };

        config.validate()?;

        Ok(config)
    }

    /// Load from a map; handy in tests
    pub fn from_map(vars: &HashMap<String, String>) -> Result<Self> {
        Self::from_lookup(|key| vars.get(key).cloned())
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if self.api_port == 0 {
            anyhow::bail!("API_PORT must be greater than 0");
        }

        if self.reconcile_interval_secs == 0 {
            anyhow::bail!("RECONCILE_INTERVAL_SECS must be greater than 0");
        }

        if self.health_poll_attempts == 0 {
            anyhow::bail!("HEALTH_POLL_ATTEMPTS must be greater than 0");
        }

        if self.max_context_bytes == 0 {
            anyhow::bail!("MAX_CONTEXT_BYTES must be greater than 0");
        }

        let domain = self.base_domain.trim_matches('.');
        if domain.is_empty() || domain.contains('/') || domain.contains(':') {
            anyhow::bail!("BASE_DOMAIN must be a bare domain name, got {:?}", self.base_domain);
        }

        if self.base_image.trim().is_empty() {
            anyhow::bail!("BASE_IMAGE must not be empty");
        }

        Ok(())
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.api_host, self.api_port)
    }

    pub fn engine_config(&self) -> DockerEngineConfig {
        DockerEngineConfig {
            address: self.docker_host.clone(),
            base_domain: self.base_domain.clone(),
            network: self.docker_network.clone(),
            ..Default::default()
        }
    }

    pub fn assembler_config(&self) -> AssemblerConfig {
        AssemblerConfig {
            base_image: self.base_image.clone(),
            max_context_bytes: self.max_context_bytes,
        }
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            base_domain: self.base_domain.clone(),
            health_poll_attempts: self.health_poll_attempts,
            health_poll_interval: Duration::from_millis(self.health_poll_interval_ms),
            run_post_deploy_tests: self.run_post_deploy_tests,
        }
    }

    pub fn reconciler_config(&self) -> ReconcilerConfig {
        ReconcilerConfig {
            interval: Duration::from_secs(self.reconcile_interval_secs),
            stale_retention: Duration::from_secs(self.stale_retention_secs),
        }
    }

    pub fn tester_config(&self) -> TesterConfig {
        TesterConfig {
            expected_asset: self.expected_asset.clone(),
            ..Default::default()
        }
    }
}
