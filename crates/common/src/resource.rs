//! Resource descriptors and runtime records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// Relative path -> file content, ordered so serialized snapshots are stable
pub type SourceFiles = BTreeMap<String, String>;

/// Env var keys that can never be set by the resource author
const RESERVED_ENV_KEYS: &[&str] = &["PORT", "RESOURCE_ID", "CREATOR_WALLET"];

/// Substrings that mark an env var as a secret
const SECRET_ENV_MARKERS: &[&str] = &["SECRET", "PASSWORD", "PRIVATE", "TOKEN", "API_KEY", "MNEMONIC"];

/// Kind of resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    #[default]
    Api,
    Webhook,
    Stream,
}

impl ResourceType {
    /// Port the container listens on. Fixed per type so health checks and
    /// routing labels never depend on user code.
    pub fn internal_port(self) -> u16 {
        match self {
            ResourceType::Api => 3000,
            ResourceType::Webhook => 3001,
            ResourceType::Stream => 3002,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ResourceType::Api => "api",
            ResourceType::Webhook => "webhook",
            ResourceType::Stream => "stream",
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How callers are charged
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum PricingModel {
    #[default]
    PerRequest,
    PerToken,
    PerMinute,
    Flat,
}

/// A single HTTP endpoint exposed by a resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
    pub method: String,
    pub path: String,

    #[serde(default)]
    pub description: String,

    /// Overrides the resource base price for this endpoint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price_usdc: Option<f64>,

    /// Example request body, used when probing the endpoint after deploy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub example_request: Option<serde_json::Value>,
}

/// Immutable-once-created resource descriptor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceConfig {
    /// Permanent resource identifier, allocated at deploy time
    #[serde(default)]
    pub id: String,

    pub name: String,

    #[serde(default)]
    pub description: String,

    /// Payout identity
    pub creator_wallet: String,

    #[serde(default, rename = "type")]
    pub resource_type: ResourceType,

    #[serde(default)]
    pub base_price_usdc: f64,

    #[serde(default)]
    pub pricing_model: PricingModel,

    #[serde(default)]
    pub tags: Vec<String>,

    #[serde(default)]
    pub env_vars: HashMap<String, String>,

    #[serde(default)]
    pub endpoints: Vec<Endpoint>,
}

impl ResourceConfig {
    /// Basic shape validation, run before any side effect
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("Resource name must not be empty".to_string());
        }
        if self.creator_wallet.trim().is_empty() {
            return Err("Creator wallet must not be empty".to_string());
        }
        if !self.base_price_usdc.is_finite() || self.base_price_usdc < 0.0 {
            return Err(format!(
                "Base price must be a non-negative number, got {}",
                self.base_price_usdc
            ));
        }
        for endpoint in &self.endpoints {
            if !endpoint.path.starts_with('/') {
                return Err(format!("Endpoint path must start with '/': {}", endpoint.path));
            }
            if let Some(price) = endpoint.price_usdc {
                if !price.is_finite() || price < 0.0 {
                    return Err(format!(
                        "Endpoint price must be a non-negative number: {} {}",
                        endpoint.method, endpoint.path
                    ));
                }
            }
        }
        Ok(())
    }

    /// Env vars safe to hand to the container: valid names only, no
    /// secret-looking keys, no overrides of reserved runtime keys.
    pub fn sanitized_env(&self) -> BTreeMap<String, String> {
        self.env_vars
            .iter()
            .filter(|(key, _)| is_valid_env_key(key))
            .filter(|(key, _)| {
                let upper = key.to_uppercase();
                !RESERVED_ENV_KEYS.contains(&upper.as_str())
                    && !SECRET_ENV_MARKERS.iter().any(|m| upper.contains(m))
            })
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Apply the fields a redeploy is allowed to change. Identity, name,
    /// wallet and type stay as they were.
    pub fn apply_update(&mut self, update: &ResourceConfig) {
        self.endpoints = update.endpoints.clone();
        self.base_price_usdc = update.base_price_usdc;
        self.pricing_model = update.pricing_model;
    }
}

fn is_valid_env_key(key: &str) -> bool {
    let mut chars = key.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Lifecycle state of a deployed resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceStatus {
    Pending,
    Building,
    Deploying,
    Running,
    Updating,
    Stopped,
    Failed,
    /// Container is gone and no snapshot exists to rebuild it
    Lost,
}

impl ResourceStatus {
    /// States that are only ever held while an operation is in flight
    pub fn is_transitional(self) -> bool {
        matches!(
            self,
            ResourceStatus::Pending
                | ResourceStatus::Building
                | ResourceStatus::Deploying
                | ResourceStatus::Updating
        )
    }

    /// States the reconciler may evict after the retention window
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ResourceStatus::Failed | ResourceStatus::Stopped | ResourceStatus::Lost
        )
    }

    /// The record expects a live container behind it
    pub fn expects_container(self) -> bool {
        matches!(
            self,
            ResourceStatus::Running | ResourceStatus::Deploying | ResourceStatus::Updating
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ResourceStatus::Pending => "pending",
            ResourceStatus::Building => "building",
            ResourceStatus::Deploying => "deploying",
            ResourceStatus::Running => "running",
            ResourceStatus::Updating => "updating",
            ResourceStatus::Stopped => "stopped",
            ResourceStatus::Failed => "failed",
            ResourceStatus::Lost => "lost",
        }
    }
}

impl fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mutable runtime record, one per resource id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployedResource {
    #[serde(flatten)]
    pub config: ResourceConfig,

    pub status: ResourceStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,

    pub internal_port: u16,

    pub public_url: String,

    pub deployed_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,

    #[serde(default)]
    pub healthy: bool,

    /// Cached from the external ledger, never decreases
    #[serde(default)]
    pub request_count: u64,

    /// Cached from the external ledger, never decreases
    #[serde(default)]
    pub revenue_usdc: f64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Snapshot of the files last built successfully; the only way back
    /// after the container is lost
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_files: Option<SourceFiles>,
}

impl DeployedResource {
    /// Create a new record in `pending` state
    pub fn new(config: ResourceConfig, base_domain: &str) -> Self {
        let now = Utc::now();
        let public_url = public_url(&config.id, base_domain);
        let internal_port = config.resource_type.internal_port();
        Self {
            config,
            status: ResourceStatus::Pending,
            container_id: None,
            internal_port,
            public_url,
            deployed_at: now,
            updated_at: now,
            healthy: false,
            request_count: 0,
            revenue_usdc: 0.0,
            error: None,
            source_files: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    /// Move to a new status, bumping `updated_at`
    pub fn transition(&mut self, status: ResourceStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }

    /// Mark as failed with a reason. Health is cleared; the container id is
    /// left to the caller, since a failed record may still own a container.
    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.transition(ResourceStatus::Failed);
        self.healthy = false;
        self.error = Some(error.into());
    }

    /// Mark as running on the given container
    pub fn mark_running(&mut self, container_id: String) {
        self.transition(ResourceStatus::Running);
        self.container_id = Some(container_id);
        self.healthy = true;
        self.error = None;
    }

    /// Merge counters reported by the ledger without ever lowering them
    pub fn merge_counters(&mut self, request_count: u64, revenue_usdc: f64) {
        self.request_count = self.request_count.max(request_count);
        if revenue_usdc.is_finite() && revenue_usdc > self.revenue_usdc {
            self.revenue_usdc = revenue_usdc;
        }
    }
}

/// Public URL for a resource. Deterministic, so it survives redeploys.
pub fn public_url(resource_id: &str, base_domain: &str) -> String {
    format!("https://{}.{}", resource_id, base_domain.trim_matches('.'))
}

/// Allocate a new resource id. 32 lowercase hex chars, a valid DNS label.
pub fn generate_resource_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config() -> ResourceConfig {
        ResourceConfig {
            id: "abc123".to_string(),
            name: "Weather API".to_string(),
            description: "Current weather by city".to_string(),
            creator_wallet: "0x1111111111111111111111111111111111111111".to_string(),
            resource_type: ResourceType::Api,
            base_price_usdc: 0.01,
            pricing_model: PricingModel::PerRequest,
            tags: vec!["weather".to_string()],
            env_vars: HashMap::new(),
            endpoints: vec![Endpoint {
                method: "GET".to_string(),
                path: "/weather".to_string(),
                description: "Weather for a city".to_string(),
                price_usdc: None,
                example_request: None,
            }],
        }
    }

    #[test]
    fn test_public_url_is_deterministic() {
        assert_eq!(public_url("abc123", "paygate.dev"), "https://abc123.paygate.dev");
        assert_eq!(public_url("abc123", ".paygate.dev."), "https://abc123.paygate.dev");
    }

    #[test]
    fn test_generated_ids_are_dns_labels() {
        let id = generate_resource_id();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_ne!(id, generate_resource_id());
    }

    #[test]
    fn test_new_record_is_pending() {
        let record = DeployedResource::new(sample_config(), "paygate.dev");
        assert_eq!(record.status, ResourceStatus::Pending);
        assert_eq!(record.internal_port, 3000);
        assert_eq!(record.public_url, "https://abc123.paygate.dev");
        assert!(record.container_id.is_none());
        assert!(record.source_files.is_none());
    }

    #[test]
    fn test_sanitized_env_drops_secrets_and_reserved_keys() {
        let mut config = sample_config();
        config.env_vars.insert("CITY_DEFAULT".to_string(), "Lisbon".to_string());
        config.env_vars.insert("OPENAI_API_KEY".to_string(), "sk-xxx".to_string());
        config.env_vars.insert("db_password".to_string(), "hunter2".to_string());
        config.env_vars.insert("PORT".to_string(), "80".to_string());
        config.env_vars.insert("1BAD".to_string(), "x".to_string());

        let env = config.sanitized_env();
        assert_eq!(env.len(), 1);
        assert_eq!(env.get("CITY_DEFAULT").map(String::as_str), Some("Lisbon"));
    }

    #[test]
    fn test_apply_update_keeps_identity() {
        let mut config = sample_config();
        let mut update = sample_config();
        update.id = "other".to_string();
        update.creator_wallet = "0x2222222222222222222222222222222222222222".to_string();
        update.name = "Renamed".to_string();
        update.base_price_usdc = 0.05;
        update.endpoints.push(Endpoint {
            method: "GET".to_string(),
            path: "/forecast".to_string(),
            description: String::new(),
            price_usdc: Some(0.02),
            example_request: None,
        });

        config.apply_update(&update);

        assert_eq!(config.id, "abc123");
        assert_eq!(config.name, "Weather API");
        assert_eq!(config.creator_wallet, "0x1111111111111111111111111111111111111111");
        assert_eq!(config.base_price_usdc, 0.05);
        assert_eq!(config.endpoints.len(), 2);
    }

    #[test]
    fn test_validate_rejects_bad_shapes() {
        let mut config = sample_config();
        assert!(config.validate().is_ok());

        config.endpoints[0].path = "weather".to_string();
        assert!(config.validate().is_err());

        let mut config = sample_config();
        config.creator_wallet = " ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_counters_never_decrease() {
        let mut record = DeployedResource::new(sample_config(), "paygate.dev");
        record.merge_counters(10, 1.5);
        record.merge_counters(4, 0.5);
        assert_eq!(record.request_count, 10);
        assert_eq!(record.revenue_usdc, 1.5);
    }

    #[test]
    fn test_record_serializes_camel_case() {
        let mut record = DeployedResource::new(sample_config(), "paygate.dev");
        record.mark_running("c0ffee".to_string());

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["id"], "abc123");
        assert_eq!(json["creatorWallet"], "0x1111111111111111111111111111111111111111");
        assert_eq!(json["type"], "api");
        assert_eq!(json["pricingModel"], "per-request");
        assert_eq!(json["containerId"], "c0ffee");
        assert_eq!(json["status"], "running");

        let back: DeployedResource = serde_json::from_value(json).unwrap();
        assert_eq!(back, record);
    }
}
