//! Resource Registry
//!
//! Durable key/value store of deployed resource records. Redis is the
//! backing store; when it is unreachable the registry serves from an
//! in-process map so callers never fail because of the backend.
//!
//! Also carries a bounded, auto-expiring progress event log per resource
//! for live streaming to observers.

pub mod events;
pub mod storage;

pub use events::{EventLevel, ProgressEvent};
pub use storage::{Registry, RegistryConfig};
