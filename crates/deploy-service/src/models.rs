//! Request and response bodies for the control API

use paygate_common::{DeployedResource, ResourceConfig, SourceFiles};
use resource_registry::ProgressEvent;
use serde::{Deserialize, Serialize};

/// Default number of log lines returned
pub const DEFAULT_LOG_TAIL: usize = 100;

/// Upper bound on requested log lines
pub const MAX_LOG_TAIL: usize = 5_000;

/// Deploy a new resource
#[derive(Debug, Clone, Deserialize)]
pub struct DeployRequest {
    /// Resource descriptor; any `id` supplied here is ignored
    pub config: ResourceConfig,

    /// Relative path -> file content
    pub files: SourceFiles,
}

/// Replace the code of an existing resource
#[derive(Debug, Clone, Deserialize)]
pub struct RedeployRequest {
    pub files: SourceFiles,

    /// Endpoints and pricing to apply; identity fields are ignored
    #[serde(default)]
    pub config: Option<ResourceConfig>,
}

/// Counters pushed by the external ledger
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CountersUpdate {
    pub request_count: u64,
    pub revenue_usdc: f64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LogsQuery {
    pub tail: Option<usize>,
}

impl LogsQuery {
    pub fn tail(&self) -> usize {
        self.tail.unwrap_or(DEFAULT_LOG_TAIL).clamp(1, MAX_LOG_TAIL)
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceListResponse {
    pub resources: Vec<DeployedResource>,
    pub total: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogsResponse {
    pub resource_id: String,
    pub tail: usize,
    pub logs: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventsResponse {
    pub resource_id: String,
    pub events: Vec<ProgressEvent>,
}
