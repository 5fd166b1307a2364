//! Container Lifecycle Client
//!
//! A typed wrapper over the container engine's control API. Every call maps
//! one-to-one onto an engine operation and surfaces the engine's HTTP status
//! and message on failure. Nothing here retries; retry policy belongs to the
//! caller.

pub mod docker;
pub mod engine;
pub mod labels;

pub use docker::{DockerEngine, DockerEngineConfig};
pub use engine::{
    BuildRequest, ContainerEngine, ContainerStatus, CreateContainerSpec, EngineError,
    EngineResult, ResourceContainer,
};
pub use labels::{container_name, image_labels, image_tag, routing_labels};
