//! Progress events streamed to external observers

use chrono::{DateTime, Utc};
use paygate_common::ResourceStatus;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventLevel {
    Info,
    Warn,
    Error,
}

/// A single entry in a resource's progress log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub timestamp: DateTime<Utc>,

    pub level: EventLevel,

    /// Status the resource was in when the event was emitted
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<ResourceStatus>,

    pub message: String,
}

impl ProgressEvent {
    pub fn info(status: Option<ResourceStatus>, message: impl Into<String>) -> Self {
        Self::with_level(EventLevel::Info, status, message)
    }

    pub fn warn(status: Option<ResourceStatus>, message: impl Into<String>) -> Self {
        Self::with_level(EventLevel::Warn, status, message)
    }

    pub fn error(status: Option<ResourceStatus>, message: impl Into<String>) -> Self {
        Self::with_level(EventLevel::Error, status, message)
    }

    fn with_level(level: EventLevel, status: Option<ResourceStatus>, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            status,
            message: message.into(),
        }
    }
}
