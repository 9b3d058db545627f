//! Rendering the scheduler's Kubernetes manifests.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use tracing::info;

use crate::error::TopologyError;
use crate::k8s::{
    ConfigMap, ConfigMapVolumeSource, Container, ContainerPort, Deployment, DeploymentSpec,
    EnvVar, LabelSelector, ObjectMeta, PodMeta, PodSpec, PodTemplate, Service, ServicePort,
    ServiceSpec, Volume, VolumeMount,
};
use crate::model::{DeploymentTopology, CONFIG_MOUNT_PATH};
use crate::Result;

const CONFIG_VOLUME: &str = "scheduler-config";

/// The scheduler's manifests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifests {
    pub deployment: Deployment,
    pub service: Service,
    /// Present when the topology names a config file to embed.
    pub config_map: Option<ConfigMap>,
}

impl Manifests {
    /// Multi-document YAML stream: ConfigMap (if any), Deployment, Service.
    pub fn to_yaml(&self) -> Result<String> {
        let mut docs = Vec::with_capacity(3);
        if let Some(config_map) = &self.config_map {
            docs.push(serde_yaml::to_string(config_map)?);
        }
        docs.push(serde_yaml::to_string(&self.deployment)?);
        docs.push(serde_yaml::to_string(&self.service)?);
        Ok(docs.join("---\n"))
    }

    fn scheduler_container(&self) -> Result<&Container> {
        self.deployment
            .spec
            .template
            .spec
            .containers
            .first()
            .ok_or_else(|| TopologyError::EmptyField {
                field: "deployment containers".to_string(),
            })
    }

    /// Ports are distinct, every container port is mirrored by name and
    /// number on the service, and the config mount path is the container's
    /// only argument.
    pub fn check_well_formed(&self) -> Result<()> {
        let container = self.scheduler_container()?;

        let mut seen = BTreeSet::new();
        for port in &container.ports {
            if !seen.insert(port.container_port) {
                return Err(TopologyError::DuplicatePort {
                    port: port.container_port,
                });
            }
            let mirrored = self
                .service
                .spec
                .ports
                .iter()
                .any(|sp| sp.name == port.name && sp.port == port.container_port);
            if !mirrored {
                return Err(TopologyError::UnmirroredPort {
                    name: port.name.clone(),
                    port: port.container_port,
                });
            }
        }

        let mount = container
            .volume_mounts
            .iter()
            .find(|m| m.name == CONFIG_VOLUME)
            .ok_or(TopologyError::MissingSchedulerConfig)?;
        if container.args != [mount.mount_path.clone()] {
            return Err(TopologyError::MountArgMismatch {
                mount_path: mount.mount_path.clone(),
                args: container.args.clone(),
            });
        }
        Ok(())
    }
}

fn meta(topology: &DeploymentTopology, name: &str, labels: &BTreeMap<String, String>) -> ObjectMeta {
    ObjectMeta {
        name: name.to_string(),
        namespace: topology.namespace.clone(),
        labels: labels.clone(),
    }
}

/// Validate `topology` and render its manifests. `base_dir` resolves the
/// scheduler config source file.
pub fn render(topology: &DeploymentTopology, base_dir: &Path) -> Result<Manifests> {
    topology.validate()?;
    let scheduler = &topology.scheduler;
    let cas = topology.cas_endpoint()?;
    let config = topology.scheduler_config()?;

    let labels = BTreeMap::from([
        ("app".to_string(), scheduler.name.clone()),
        (
            "app.kubernetes.io/part-of".to_string(),
            "local-remote-execution".to_string(),
        ),
    ]);
    let selector = BTreeMap::from([("app".to_string(), scheduler.name.clone())]);

    let container = Container {
        name: scheduler.name.clone(),
        image: scheduler.image.clone(),
        args: vec![CONFIG_MOUNT_PATH.to_string()],
        ports: scheduler
            .ports
            .named()
            .iter()
            .map(|(name, port)| ContainerPort {
                name: name.to_string(),
                container_port: *port,
                protocol: "TCP".to_string(),
            })
            .collect(),
        env: vec![
            EnvVar {
                name: "RUST_LOG".to_string(),
                value: scheduler.log_level.clone(),
            },
            EnvVar {
                name: "CAS_ENDPOINT".to_string(),
                value: cas.address.clone(),
            },
        ],
        volume_mounts: vec![VolumeMount {
            name: CONFIG_VOLUME.to_string(),
            mount_path: CONFIG_MOUNT_PATH.to_string(),
            sub_path: Some(config.key.clone()),
            read_only: true,
        }],
    };

    let deployment = Deployment {
        api_version: "apps/v1".to_string(),
        kind: "Deployment".to_string(),
        metadata: meta(topology, &scheduler.name, &labels),
        spec: DeploymentSpec {
            replicas: 1,
            selector: LabelSelector {
                match_labels: selector.clone(),
            },
            template: PodTemplate {
                metadata: PodMeta {
                    labels: labels.clone(),
                },
                spec: PodSpec {
                    containers: vec![container],
                    volumes: vec![Volume {
                        name: CONFIG_VOLUME.to_string(),
                        config_map: ConfigMapVolumeSource {
                            name: config.config_map.clone(),
                        },
                    }],
                },
            },
        },
    };

    let service = Service {
        api_version: "v1".to_string(),
        kind: "Service".to_string(),
        metadata: meta(topology, &scheduler.name, &labels),
        spec: ServiceSpec {
            selector,
            ports: scheduler
                .ports
                .named()
                .iter()
                .map(|(name, port)| ServicePort {
                    name: name.to_string(),
                    port: *port,
                    target_port: name.to_string(),
                    protocol: "TCP".to_string(),
                })
                .collect(),
        },
    };

    let config_map = match &config.source {
        Some(source) => {
            let path = base_dir.join(source);
            let body = std::fs::read_to_string(&path)
                .map_err(|source| TopologyError::Read { path, source })?;
            Some(ConfigMap {
                api_version: "v1".to_string(),
                kind: "ConfigMap".to_string(),
                metadata: meta(topology, &config.config_map, &labels),
                data: BTreeMap::from([(config.key.clone(), body)]),
            })
        }
        None => None,
    };

    let manifests = Manifests {
        deployment,
        service,
        config_map,
    };
    manifests.check_well_formed()?;
    info!(
        scheduler = %scheduler.name,
        namespace = %topology.namespace,
        config_map = manifests.config_map.is_some(),
        "rendered topology"
    );
    Ok(manifests)
}
