pub mod error;
pub mod operation;
pub mod resource;

pub use error::{DeployError, ErrorKind, Result};
pub use operation::OperationResult;
pub use resource::{
    generate_resource_id, public_url, DeployedResource, Endpoint, PricingModel, ResourceConfig,
    ResourceStatus, ResourceType, SourceFiles,
};
