//! The scheduler, CAS and worker-pool contract.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use lre_core::{Digest, WorkerImage};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::TopologyError;
use crate::Result;

pub const SCHEDULER_PORT: u16 = 50052;
pub const SCHEDULER_PORT_NAME: &str = "scheduler";
pub const WORKER_API_PORT: u16 = 50061;
pub const WORKER_API_PORT_NAME: &str = "worker-api";

/// Fixed in-container path of the scheduler config, also its sole argument.
pub const CONFIG_MOUNT_PATH: &str = "/scheduler.json";

fn default_namespace() -> String {
    "default".to_string()
}

fn default_scheduler_name() -> String {
    "nativelink-scheduler".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_config_key() -> String {
    "scheduler.json".to_string()
}

/// Ports the scheduler listens on. Workers and clients are built against
/// 50052 and 50061, so a topology may restate them but never move them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerPorts {
    /// Client-facing scheduling API.
    pub scheduling: u16,
    /// Worker registration API.
    pub worker_registration: u16,
}

impl Default for SchedulerPorts {
    fn default() -> Self {
        Self {
            scheduling: SCHEDULER_PORT,
            worker_registration: WORKER_API_PORT,
        }
    }
}

impl SchedulerPorts {
    /// `(name, port)` pairs in declaration order.
    pub fn named(&self) -> [(&'static str, u16); 2] {
        [
            (SCHEDULER_PORT_NAME, self.scheduling),
            (WORKER_API_PORT_NAME, self.worker_registration),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerService {
    #[serde(default = "default_scheduler_name")]
    pub name: String,
    pub image: String,
    /// Executable every worker pool must run.
    #[serde(default)]
    pub executable_digest: Option<Digest>,
    /// Value of `RUST_LOG` in the container.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub ports: SchedulerPorts,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CasEndpointRef {
    /// e.g. `grpc://cas.default.svc.cluster.local:50051`
    pub address: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerConfigRef {
    /// ConfigMap holding the scheduler config.
    pub config_map: String,
    /// Key inside the ConfigMap, projected with `subPath`.
    #[serde(default = "default_config_key")]
    pub key: String,
    /// Config file to embed when rendering the ConfigMap itself, relative to
    /// the topology file.
    #[serde(default)]
    pub source: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerPool {
    pub name: String,
    pub size: u32,
    pub image: String,
    pub executable_digest: Digest,
}

impl WorkerPool {
    /// A pool running a composed worker image, pinned by digest.
    pub fn from_worker(name: impl Into<String>, size: u32, worker: &WorkerImage) -> Self {
        Self {
            name: name.into(),
            size,
            image: worker.image.pinned(),
            executable_digest: worker.executable_digest,
        }
    }
}

/// Scheduler, CAS endpoint, scheduler config and worker pools.
///
/// The CAS endpoint and the config reference are optional only so that a
/// missing one is reported by [`DeploymentTopology::validate`] instead of
/// being defaulted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentTopology {
    #[serde(default = "default_namespace")]
    pub namespace: String,
    pub scheduler: SchedulerService,
    #[serde(default)]
    pub cas_endpoint: Option<CasEndpointRef>,
    #[serde(default)]
    pub scheduler_config: Option<SchedulerConfigRef>,
    #[serde(default)]
    pub worker_pools: Vec<WorkerPool>,
}

fn non_empty(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(TopologyError::EmptyField {
            field: field.to_string(),
        });
    }
    Ok(())
}

impl DeploymentTopology {
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|source| TopologyError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| TopologyError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn cas_endpoint(&self) -> Result<&CasEndpointRef> {
        self.cas_endpoint
            .as_ref()
            .ok_or(TopologyError::MissingCasEndpoint)
    }

    pub fn scheduler_config(&self) -> Result<&SchedulerConfigRef> {
        self.scheduler_config
            .as_ref()
            .ok_or(TopologyError::MissingSchedulerConfig)
    }

    /// Static checks run before anything is rendered.
    pub fn validate(&self) -> Result<()> {
        non_empty("namespace", &self.namespace)?;
        non_empty("scheduler.name", &self.scheduler.name)?;
        non_empty("scheduler.image", &self.scheduler.image)?;
        non_empty("scheduler.log_level", &self.scheduler.log_level)?;

        let cas = self.cas_endpoint()?;
        non_empty("cas_endpoint.address", &cas.address)?;

        let config = self.scheduler_config()?;
        non_empty("scheduler_config.config_map", &config.config_map)?;
        non_empty("scheduler_config.key", &config.key)?;

        let fixed = SchedulerPorts::default().named();
        let declared = self.scheduler.ports.named();
        for ((name, port), (_, expected)) in declared.into_iter().zip(fixed) {
            if port != expected {
                return Err(TopologyError::FixedPort {
                    name: name.to_string(),
                    expected,
                    actual: port,
                });
            }
        }

        let mut pools = BTreeSet::new();
        for pool in &self.worker_pools {
            non_empty("worker_pools.name", &pool.name)?;
            non_empty("worker_pools.image", &pool.image)?;
            if !pools.insert(pool.name.as_str()) {
                return Err(TopologyError::DuplicatePool(pool.name.clone()));
            }
            if pool.size == 0 {
                return Err(TopologyError::EmptyPool(pool.name.clone()));
            }
            let expected = self.scheduler.executable_digest.ok_or_else(|| {
                TopologyError::MissingExpectedExecutable {
                    pool: pool.name.clone(),
                }
            })?;
            if pool.executable_digest != expected {
                return Err(TopologyError::ExecutableMismatch {
                    pool: pool.name.clone(),
                    expected,
                    actual: pool.executable_digest,
                });
            }
        }

        debug!(
            scheduler = %self.scheduler.name,
            pools = self.worker_pools.len(),
            "topology is valid"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topology() -> DeploymentTopology {
        toml::from_str(
            r#"
            [scheduler]
            image = "ghcr.io/stevedores-org/rbe-server:1.0"
            executable_digest = "sha256:0000000000000000000000000000000000000000000000000000000000000001"

            [cas_endpoint]
            address = "grpc://cas:50051"

            [scheduler_config]
            config_map = "scheduler-config"

            [[worker_pools]]
            name = "cc"
            size = 2
            image = "lre-worker-cc:abc"
            executable_digest = "sha256:0000000000000000000000000000000000000000000000000000000000000001"
            "#,
        )
        .unwrap()
    }

    #[test]
    fn test_defaults_from_toml() {
        let t = topology();
        assert_eq!(t.namespace, "default");
        assert_eq!(t.scheduler.name, "nativelink-scheduler");
        assert_eq!(t.scheduler.log_level, "info");
        assert_eq!(t.scheduler.ports.scheduling, 50052);
        assert_eq!(t.scheduler.ports.worker_registration, 50061);
        assert_eq!(t.scheduler_config.unwrap().key, "scheduler.json");
        assert!(topology().validate().is_ok());
    }

    #[test]
    fn test_missing_cas_is_not_defaulted() {
        let mut t = topology();
        t.cas_endpoint = None;
        assert!(matches!(
            t.validate(),
            Err(TopologyError::MissingCasEndpoint)
        ));
    }

    #[test]
    fn test_missing_config_ref() {
        let mut t = topology();
        t.scheduler_config = None;
        assert!(matches!(
            t.validate(),
            Err(TopologyError::MissingSchedulerConfig)
        ));
    }

    #[test]
    fn test_moved_ports_rejected() {
        let mut t = topology();
        t.scheduler.ports.worker_registration = t.scheduler.ports.scheduling;
        assert!(matches!(
            t.validate(),
            Err(TopologyError::FixedPort { ref name, expected: 50061, actual: 50052 })
                if name == WORKER_API_PORT_NAME
        ));

        let mut t = topology();
        t.scheduler.ports.scheduling = 50053;
        assert!(matches!(
            t.validate(),
            Err(TopologyError::FixedPort { expected: 50052, actual: 50053, .. })
        ));
    }

    #[test]
    fn test_restated_ports_accepted() {
        let mut t = topology();
        t.scheduler.ports = SchedulerPorts {
            scheduling: SCHEDULER_PORT,
            worker_registration: WORKER_API_PORT,
        };
        assert!(t.validate().is_ok());
    }

    #[test]
    fn test_pool_executable_must_match() {
        let mut t = topology();
        t.worker_pools[0].executable_digest = Digest::compute(b"other build");
        let err = t.validate().unwrap_err();
        assert!(matches!(err, TopologyError::ExecutableMismatch { .. }));
        assert!(err.to_string().contains("worker pool cc"));
    }

    #[test]
    fn test_pool_requires_expected_executable() {
        let mut t = topology();
        t.scheduler.executable_digest = None;
        assert!(matches!(
            t.validate(),
            Err(TopologyError::MissingExpectedExecutable { .. })
        ));
    }

    #[test]
    fn test_empty_and_duplicate_pools() {
        let mut t = topology();
        t.worker_pools[0].size = 0;
        assert!(matches!(t.validate(), Err(TopologyError::EmptyPool(_))));

        let mut t = topology();
        let pool = t.worker_pools[0].clone();
        t.worker_pools.push(pool);
        assert!(matches!(t.validate(), Err(TopologyError::DuplicatePool(_))));
    }

    #[test]
    fn test_blank_cas_address() {
        let mut t = topology();
        t.cas_endpoint = Some(CasEndpointRef {
            address: "  ".to_string(),
        });
        assert!(matches!(t.validate(), Err(TopologyError::EmptyField { .. })));
    }
}
