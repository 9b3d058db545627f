//! LRE-Topology: scheduler deployment contract
//!
//! Describes how the scheduler, the CAS endpoint and the worker pools fit
//! together, validates that description and renders the scheduler's
//! Deployment, Service and ConfigMap as a multi-document YAML stream.

pub mod error;
pub mod k8s;
pub mod model;
pub mod render;

pub use error::TopologyError;
pub use model::{
    CasEndpointRef, DeploymentTopology, SchedulerConfigRef, SchedulerPorts, SchedulerService,
    WorkerPool, CONFIG_MOUNT_PATH, SCHEDULER_PORT, WORKER_API_PORT,
};
pub use render::{render, Manifests};

/// Result type for lre-topology operations
pub type Result<T> = std::result::Result<T, TopologyError>;
