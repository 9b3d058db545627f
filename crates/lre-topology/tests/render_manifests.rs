use std::fs;
use std::path::Path;

use lre_core::{ContentAddressedImage, Digest, ImageReference, ImageTag, ToolchainFlavor, WorkerImage};
use lre_topology::{
    render, DeploymentTopology, TopologyError, WorkerPool, CONFIG_MOUNT_PATH, SCHEDULER_PORT,
    WORKER_API_PORT,
};

const TOPOLOGY: &str = r#"
namespace = "lre"

[scheduler]
image = "ghcr.io/stevedores-org/rbe-server:1.0"
log_level = "debug"

[cas_endpoint]
address = "grpc://cas.lre.svc.cluster.local:50051"

[scheduler_config]
config_map = "scheduler-config"
source = "scheduler.json"
"#;

fn write_fixture(dir: &Path) -> std::path::PathBuf {
    let path = dir.join("topology.toml");
    fs::write(&path, TOPOLOGY).unwrap();
    fs::write(
        dir.join("scheduler.json"),
        "{\"servers\": [{\"listener\": {\"http\": {\"socket_address\": \"0.0.0.0:50052\"}}}]}\n",
    )
    .unwrap();
    path
}

#[test]
fn scheduler_deployment_contract() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_fixture(dir.path());
    let topology = DeploymentTopology::from_file(&path).unwrap();
    let manifests = render(&topology, dir.path()).unwrap();

    assert_eq!(manifests.deployment.spec.replicas, 1);
    let container = &manifests.deployment.spec.template.spec.containers[0];
    let ports: Vec<_> = container
        .ports
        .iter()
        .map(|p| (p.name.as_str(), p.container_port))
        .collect();
    assert_eq!(
        ports,
        vec![("scheduler", SCHEDULER_PORT), ("worker-api", WORKER_API_PORT)]
    );
    assert_eq!(SCHEDULER_PORT, 50052);
    assert_eq!(WORKER_API_PORT, 50061);

    let env: Vec<_> = container
        .env
        .iter()
        .map(|e| (e.name.as_str(), e.value.as_str()))
        .collect();
    assert_eq!(
        env,
        vec![
            ("RUST_LOG", "debug"),
            ("CAS_ENDPOINT", "grpc://cas.lre.svc.cluster.local:50051"),
        ]
    );

    assert_eq!(container.args, vec![CONFIG_MOUNT_PATH.to_string()]);
    let mount = &container.volume_mounts[0];
    assert_eq!(mount.mount_path, "/scheduler.json");
    assert_eq!(mount.sub_path.as_deref(), Some("scheduler.json"));
    assert_eq!(
        manifests.deployment.spec.template.spec.volumes[0]
            .config_map
            .name,
        "scheduler-config"
    );

    let service_ports: Vec<_> = manifests
        .service
        .spec
        .ports
        .iter()
        .map(|p| (p.name.as_str(), p.port, p.target_port.as_str()))
        .collect();
    assert_eq!(
        service_ports,
        vec![
            ("scheduler", 50052, "scheduler"),
            ("worker-api", 50061, "worker-api"),
        ]
    );

    let config_map = manifests.config_map.as_ref().unwrap();
    assert!(config_map.data["scheduler.json"].contains("50052"));
}

#[test]
fn yaml_stream_has_three_documents() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_fixture(dir.path());
    let topology = DeploymentTopology::from_file(&path).unwrap();
    let yaml = render(&topology, dir.path()).unwrap().to_yaml().unwrap();

    let kinds: Vec<String> = yaml
        .split("---\n")
        .map(|doc| {
            let value: serde_yaml::Value = serde_yaml::from_str(doc).unwrap();
            value["kind"].as_str().unwrap().to_string()
        })
        .collect();
    assert_eq!(kinds, vec!["ConfigMap", "Deployment", "Service"]);
    assert!(yaml.contains("containerPort: 50061"));
    assert!(yaml.contains("subPath: scheduler.json"));
}

#[test]
fn config_map_is_optional() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_fixture(dir.path());
    let mut topology = DeploymentTopology::from_file(&path).unwrap();
    topology.scheduler_config.as_mut().unwrap().source = None;
    let manifests = render(&topology, dir.path()).unwrap();
    assert!(manifests.config_map.is_none());
    assert_eq!(manifests.to_yaml().unwrap().matches("---\n").count(), 1);
}

#[test]
fn missing_config_source_fails() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_fixture(dir.path());
    fs::remove_file(dir.path().join("scheduler.json")).unwrap();
    let topology = DeploymentTopology::from_file(&path).unwrap();
    assert!(matches!(
        render(&topology, dir.path()),
        Err(TopologyError::Read { .. })
    ));
}

#[test]
fn render_refuses_invalid_topology() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_fixture(dir.path());
    let mut topology = DeploymentTopology::from_file(&path).unwrap();
    topology.cas_endpoint = None;
    assert!(matches!(
        render(&topology, dir.path()),
        Err(TopologyError::MissingCasEndpoint)
    ));
}

#[test]
fn tampered_manifests_are_not_well_formed() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_fixture(dir.path());
    let topology = DeploymentTopology::from_file(&path).unwrap();
    let manifests = render(&topology, dir.path()).unwrap();

    let mut extra_arg = manifests.clone();
    extra_arg.deployment.spec.template.spec.containers[0]
        .args
        .push("--verbose".to_string());
    assert!(matches!(
        extra_arg.check_well_formed(),
        Err(TopologyError::MountArgMismatch { .. })
    ));

    let mut unmirrored = manifests;
    unmirrored.service.spec.ports.pop();
    assert!(matches!(
        unmirrored.check_well_formed(),
        Err(TopologyError::UnmirroredPort { port: 50061, .. })
    ));
}

#[test]
fn worker_pools_follow_the_scheduler_executable() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_fixture(dir.path());
    let mut topology = DeploymentTopology::from_file(&path).unwrap();

    let executable = Digest::compute(b"rbe-server build 1");
    let worker = WorkerImage {
        flavor: ToolchainFlavor::NativeCompiler,
        image: ContentAddressedImage {
            reference: ImageReference::new("lre-worker-cc", ImageTag::new("abc").unwrap()),
            digest: Digest::compute(b"worker manifest"),
            layers: vec![],
        },
        executable_digest: executable,
    };
    topology
        .worker_pools
        .push(WorkerPool::from_worker("cc", 3, &worker));
    assert!(topology.worker_pools[0].image.starts_with("lre-worker-cc@sha256:"));

    assert!(matches!(
        topology.validate(),
        Err(TopologyError::MissingExpectedExecutable { .. })
    ));

    topology.scheduler.executable_digest = Some(executable);
    assert!(render(&topology, dir.path()).is_ok());

    topology.scheduler.executable_digest = Some(Digest::compute(b"rbe-server build 2"));
    assert!(matches!(
        render(&topology, dir.path()),
        Err(TopologyError::ExecutableMismatch { .. })
    ));
}
