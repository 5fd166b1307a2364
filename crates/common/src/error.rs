use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DeployError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Build context is {size} bytes, limit is {limit} bytes")]
    ContextTooLarge { size: usize, limit: usize },

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Operation already in progress for resource {0}")]
    Busy(String),

    #[error("Base image {0} is not present in the container engine")]
    BaseImageMissing(String),

    #[error("Build failed: {message}")]
    Build { message: String, output: String },

    #[error("Runtime failure: {0}")]
    Runtime(String),

    #[error("Container engine error: {0}")]
    Engine(String),

    #[error("Registry error: {0}")]
    Registry(String),

    #[error("JSON serialization error: {0}")]
    JsonSerialization(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Coarse classification of a failure, used by callers to decide whether a
/// retry or operator action makes sense.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Rejected before any side effect; retrying the same request is pointless
    User,
    NotFound,
    Conflict,
    /// The host is misconfigured (e.g. base image missing)
    Environment,
    Build,
    Runtime,
    Infrastructure,
}

impl DeployError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DeployError::InvalidRequest(_) | DeployError::ContextTooLarge { .. } => ErrorKind::User,
            DeployError::NotFound(_) => ErrorKind::NotFound,
            DeployError::Busy(_) => ErrorKind::Conflict,
            DeployError::BaseImageMissing(_) => ErrorKind::Environment,
            DeployError::Build { .. } => ErrorKind::Build,
            DeployError::Runtime(_) => ErrorKind::Runtime,
            DeployError::Engine(_)
            | DeployError::Registry(_)
            | DeployError::JsonSerialization(_)
            | DeployError::Other(_) => ErrorKind::Infrastructure,
        }
    }

    /// Message stored on the resource record. Build failures carry the tail
    /// of the captured build output so the user can see what broke.
    pub fn detail(&self) -> String {
        match self {
            DeployError::Build { message, output } if !output.is_empty() => {
                let tail: Vec<&str> = output.lines().rev().take(20).collect();
                let tail: Vec<&str> = tail.into_iter().rev().collect();
                format!("Build failed: {}\n{}", message, tail.join("\n"))
            }
            other => other.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, DeployError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            DeployError::ContextTooLarge { size: 11, limit: 10 }.kind(),
            ErrorKind::User
        );
        assert_eq!(
            DeployError::BaseImageMissing("base:latest".to_string()).kind(),
            ErrorKind::Environment
        );
        assert_eq!(DeployError::NotFound("abc".to_string()).kind(), ErrorKind::NotFound);
        assert_eq!(
            DeployError::Engine("HTTP 500: boom".to_string()).kind(),
            ErrorKind::Infrastructure
        );
    }

    #[test]
    fn test_build_detail_includes_output_tail() {
        let output: String = (0..50).map(|i| format!("line {}\n", i)).collect();
        let err = DeployError::Build {
            message: "npm install exited with 1".to_string(),
            output,
        };

        let detail = err.detail();
        assert!(detail.starts_with("Build failed: npm install exited with 1"));
        assert!(detail.contains("line 49"));
        assert!(!detail.contains("line 10\n"));
    }
}
