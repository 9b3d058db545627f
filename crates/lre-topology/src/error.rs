//! Topology errors.

use std::path::PathBuf;

use lre_core::{Digest, ProvisionError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TopologyError {
    #[error("topology has no CAS endpoint")]
    MissingCasEndpoint,

    #[error("topology has no scheduler config reference")]
    MissingSchedulerConfig,

    #[error("{field} must not be empty")]
    EmptyField { field: String },

    #[error("port {port} is declared more than once")]
    DuplicatePort { port: u16 },

    #[error("port {name} is fixed at {expected}, got {actual}")]
    FixedPort {
        name: String,
        expected: u16,
        actual: u16,
    },

    #[error("container port {name} ({port}) is not mirrored on the service")]
    UnmirroredPort { name: String, port: u16 },

    #[error("config is mounted at {mount_path} but the container argument is {args:?}")]
    MountArgMismatch { mount_path: String, args: Vec<String> },

    #[error("worker pool {0} is declared more than once")]
    DuplicatePool(String),

    #[error("worker pool {0} has size 0")]
    EmptyPool(String),

    #[error("worker pool {pool} is set but the scheduler declares no executable digest")]
    MissingExpectedExecutable { pool: String },

    #[error("worker pool {pool} runs executable {actual}, scheduler expects {expected}")]
    ExecutableMismatch {
        pool: String,
        expected: Digest,
        actual: Digest,
    },

    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl From<TopologyError> for ProvisionError {
    fn from(err: TopologyError) -> Self {
        ProvisionError::Topology(err.to_string())
    }
}
