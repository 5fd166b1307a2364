//! Structured outcome of an orchestrator operation

use crate::error::{DeployError, ErrorKind};
use crate::resource::{DeployedResource, ResourceStatus};
use serde::Serialize;

/// Orchestrator operations never propagate errors past their own boundary;
/// they return one of these instead.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationResult {
    pub success: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<ResourceStatus>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_url: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
}

impl OperationResult {
    /// Successful outcome reflecting the given record
    pub fn ok(resource: &DeployedResource) -> Self {
        Self {
            success: true,
            resource_id: Some(resource.id().to_string()),
            status: Some(resource.status),
            public_url: Some(resource.public_url.clone()),
            error: None,
            error_kind: None,
        }
    }

    /// Successful outcome for a resource that no longer exists
    pub fn removed(resource_id: &str) -> Self {
        Self {
            success: true,
            resource_id: Some(resource_id.to_string()),
            status: None,
            public_url: None,
            error: None,
            error_kind: None,
        }
    }

    /// Failed outcome. `resource` is the record as last written, if any.
    pub fn failed(resource_id: &str, resource: Option<&DeployedResource>, err: &DeployError) -> Self {
        Self {
            success: false,
            resource_id: Some(resource_id.to_string()),
            status: resource.map(|r| r.status),
            public_url: resource.map(|r| r.public_url.clone()),
            error: Some(err.detail()),
            error_kind: Some(err.kind()),
        }
    }
}
