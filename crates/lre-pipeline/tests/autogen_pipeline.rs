use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use lre_core::labels::LABEL_TITLE;
use lre_core::{
    BaseImageConfig, ConfigKind, PipelineConfig, Platform, ToolchainFlavor,
    LABEL_EXECUTABLE_DIGEST,
};
use lre_oci::{LayerSource, OciLayout};
use lre_pipeline::fakes::{
    FakeBuildGraph, FakeConfigGenerator, FakeImageBuilder, FakeImageLoader, FakeImagePuller,
};
use lre_pipeline::{Adapters, Orchestrator, PipelineContext, PipelineError, Publish, Stage};

struct Harness {
    _dir: tempfile::TempDir,
    root: PathBuf,
    graph: Arc<FakeBuildGraph>,
    builder: Arc<FakeImageBuilder>,
    puller: Arc<FakeImagePuller>,
    loader: Arc<FakeImageLoader>,
    generator: Arc<FakeConfigGenerator>,
}

impl Harness {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("src");
        let store = dir.path().join("store");
        fs::create_dir_all(&root).unwrap();
        fs::create_dir_all(&store).unwrap();
        fs::write(root.join("flake.nix"), "{ outputs = _: { }; }").unwrap();
        Self {
            graph: Arc::new(FakeBuildGraph::new(&store)),
            builder: Arc::new(FakeImageBuilder::new()),
            puller: Arc::new(FakeImagePuller::new()),
            loader: Arc::new(FakeImageLoader::new()),
            generator: Arc::new(FakeConfigGenerator::new()),
            root,
            _dir: dir,
        }
    }

    fn orchestrator(&self, configure: impl FnOnce(&mut PipelineConfig)) -> Orchestrator {
        let mut config = PipelineConfig::default();
        configure(&mut config);
        config.validate().unwrap();
        let adapters = Adapters {
            graph: self.graph.clone(),
            builder: self.builder.clone(),
            puller: self.puller.clone(),
            loader: self.loader.clone(),
            generator: self.generator.clone(),
        };
        Orchestrator::new(PipelineContext::new(&self.root, config, adapters).with_revision("abc123"))
    }

    fn legacy_base(&self, tls_verify: bool) -> BaseImageConfig {
        BaseImageConfig {
            name: "rbe-ubuntu16-04".to_string(),
            digest: self.puller.digest(),
            registry: "localhost:5001".to_string(),
            tls_verify,
            platform: Platform::default(),
        }
    }
}

fn only(flavor: ToolchainFlavor) -> impl FnOnce(&mut PipelineConfig) {
    move |config| {
        config.flavors.cc.enabled = flavor == ToolchainFlavor::NativeCompiler;
        config.flavors.java.enabled = flavor == ToolchainFlavor::ManagedRuntime;
    }
}

fn files_under(root: &Path) -> Vec<PathBuf> {
    let mut out = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in fs::read_dir(&dir).unwrap() {
            let path = entry.unwrap().path();
            if path.is_dir() {
                stack.push(path);
            } else {
                out.push(path);
            }
        }
    }
    out.sort();
    out
}

/// Every path in every layer of `tag` in the layout at `dir`.
fn layer_paths(dir: &Path, tag: &str) -> Vec<String> {
    let layout = OciLayout::open(dir).unwrap();
    let manifest = layout.read_manifest(&layout.resolve(tag).unwrap()).unwrap();
    let mut paths = Vec::new();
    for layer in &manifest.layers {
        let bytes = layout.blobs().get(&layer.digest).unwrap();
        let mut archive = tar::Archive::new(flate2::read::GzDecoder::new(bytes.as_slice()));
        for entry in archive.entries().unwrap() {
            let entry = entry.unwrap();
            let path = entry.path().unwrap().display().to_string();
            paths.push(path.trim_end_matches('/').to_string());
        }
    }
    paths
}

fn mentions(root: &Path, needle: &str) -> usize {
    files_under(root)
        .iter()
        .map(|p| fs::read_to_string(p).unwrap().matches(needle).count())
        .sum()
}

#[tokio::test]
async fn cc_generate_yields_rewritten_config() {
    let h = Harness::new();
    let report = h
        .orchestrator(only(ToolchainFlavor::NativeCompiler))
        .generate()
        .await
        .unwrap();

    assert_eq!(report.flavors.len(), 1);
    let cc = &report.flavors[0];
    let tag = cc.tag.clone();

    let requests = h.generator.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].kind, ConfigKind::Cpp);
    assert_eq!(
        requests[0].toolchain_container.to_string(),
        format!("rbe-autogen-lre-cc:{tag}")
    );
    assert_eq!(
        requests[0].output_config_path,
        PathBuf::from("local-remote-execution/generated-cc")
    );
    assert_eq!(
        h.loader.loaded()[0].to_string(),
        format!("rbe-autogen-lre-cc:{tag}")
    );

    let out = h.root.join("local-remote-execution/generated-cc");
    let build = fs::read_to_string(out.join("config/BUILD")).unwrap();
    assert_eq!(build.matches("rbe-autogen-lre-cc").count(), 0);
    assert!(build.contains(&format!("docker://lre-cc:{tag}")));

    let config = cc.config.as_ref().unwrap();
    assert_eq!(config.flavor(), ToolchainFlavor::NativeCompiler);
    assert_eq!(config.build_file(), out.join("config/BUILD"));
    assert_eq!(config.env_file(), Some(out.join("config/environment.json").as_path()));

    let rewrite = cc.rewrite.as_ref().unwrap();
    assert_eq!(rewrite.files_changed.len(), 2);
    assert_eq!(rewrite.replacements, 2);

    let stages: Vec<Stage> = cc.stages.iter().map(|s| s.stage).collect();
    assert_eq!(
        stages,
        vec![
            Stage::BuildToolchain,
            Stage::ResolveTag,
            Stage::BuildImages,
            Stage::Load,
            Stage::Generate,
            Stage::Rewrite,
            Stage::Verify,
        ]
    );
    assert_eq!(report.stages[0].stage, Stage::BuildExecutable);
}

#[tokio::test]
async fn every_enabled_flavor_is_complete() {
    let h = Harness::new();
    let report = h.orchestrator(|_| {}).generate().await.unwrap();

    let flavors: Vec<_> = report.flavors.iter().map(|o| o.flavor).collect();
    assert_eq!(
        flavors,
        vec![ToolchainFlavor::NativeCompiler, ToolchainFlavor::ManagedRuntime]
    );
    for outcome in &report.flavors {
        let profile = outcome.flavor.profile();
        let config = outcome.config.as_ref().unwrap();
        assert_eq!(mentions(config.root(), profile.autogen_name.unwrap()), 0);
        assert!(mentions(config.root(), profile.deploy_name) >= 1);
    }

    let kinds: Vec<_> = h.generator.requests().iter().map(|r| r.kind).collect();
    assert_eq!(kinds, vec![ConfigKind::Cpp, ConfigKind::Java]);
}

#[tokio::test]
async fn legacy_pull_is_pinned_by_digest_without_tls() {
    let h = Harness::new();
    let base = h.legacy_base(false);
    let pinned = base.digest;
    let report = h
        .orchestrator(move |config| {
            config.flavors.cc.enabled = false;
            config.flavors.java.enabled = false;
            config.flavors.legacy.enabled = true;
            config.flavors.legacy.base = Some(base);
        })
        .generate()
        .await
        .unwrap();

    let legacy = &report.flavors[0];
    assert_eq!(legacy.flavor, ToolchainFlavor::Legacy);
    assert_eq!(legacy.base_image.digest, pinned);
    assert_eq!(legacy.base_image.reference.to_string(), "legacy:latest");
    assert!(legacy.config.is_none());

    let pulls = h.puller.requests();
    assert_eq!(pulls.len(), 1);
    assert!(!pulls[0].tls_verify);
    assert_eq!(
        pulls[0].source(),
        format!("localhost:5001/rbe-ubuntu16-04@{pinned}")
    );
    assert!(h.generator.requests().is_empty());
}

#[tokio::test]
async fn legacy_digest_mismatch_fails_pull() {
    let h = Harness::new();
    let mut base = h.legacy_base(true);
    base.digest = lre_core::Digest::compute(b"a different manifest");
    let err = h
        .orchestrator(move |config| {
            config.flavors.cc.enabled = false;
            config.flavors.java.enabled = false;
            config.flavors.legacy.enabled = true;
            config.flavors.legacy.base = Some(base);
        })
        .generate()
        .await
        .unwrap_err();

    assert_eq!(err.stage(), Some(Stage::Pull));
    assert!(err.to_string().contains("digest mismatch"));
}

#[tokio::test]
async fn sequential_failure_stops_later_flavors() {
    let h = Harness::new();
    h.generator.fail_for(ToolchainFlavor::NativeCompiler);
    let err = h.orchestrator(|_| {}).generate().await.unwrap_err();

    assert_eq!(err.stage(), Some(Stage::Generate));
    assert_eq!(err.flavor(), Some(ToolchainFlavor::NativeCompiler));

    let requests = h.generator.requests();
    assert_eq!(requests.len(), 1);
    assert!(!h.graph.built().contains(&"lre-java-toolchain".to_string()));
    assert!(!h
        .root
        .join("local-remote-execution/generated-java")
        .exists());
}

#[tokio::test]
async fn concurrent_failure_aborts_in_flight_flavors() {
    let h = Harness::new();
    h.generator.fail_for(ToolchainFlavor::NativeCompiler);
    h.generator
        .delay_for(ToolchainFlavor::ManagedRuntime, Duration::from_secs(30));
    let orchestrator = h.orchestrator(|config| config.parallel = true);

    let err = tokio::time::timeout(Duration::from_secs(10), orchestrator.generate())
        .await
        .expect("run should end as soon as cc fails")
        .unwrap_err();

    assert_eq!(err.flavor(), Some(ToolchainFlavor::NativeCompiler));
    assert!(!h.generator.completed().contains(&ToolchainFlavor::ManagedRuntime));
    assert!(!h
        .root
        .join("local-remote-execution/generated-java/config/BUILD")
        .exists());
}

#[tokio::test]
async fn concurrent_flavors_touch_disjoint_files() {
    let h = Harness::new();
    let report = h
        .orchestrator(|config| config.parallel = true)
        .generate()
        .await
        .unwrap();
    assert_eq!(report.flavors.len(), 2);

    let area = h.root.join("local-remote-execution");
    let cc_files = files_under(&area.join("generated-cc"));
    let java_files = files_under(&area.join("generated-java"));
    assert!(!cc_files.is_empty());
    assert!(!java_files.is_empty());
    assert!(cc_files.iter().all(|f| !java_files.contains(f)));

    for outcome in &report.flavors {
        let rewrite = outcome.rewrite.as_ref().unwrap();
        assert!(rewrite
            .root
            .ends_with(outcome.flavor.profile().output_subdir.unwrap()));
    }
}

#[tokio::test]
async fn executable_build_failure_is_shared_and_fatal() {
    let h = Harness::new();
    h.graph.fail_on("rbe-server");
    let err = h.orchestrator(|_| {}).generate().await.unwrap_err();

    assert_eq!(err.stage(), Some(Stage::BuildExecutable));
    assert_eq!(err.flavor(), None);
    assert!(err.to_string().contains("(shared)"));
    assert!(h.generator.requests().is_empty());
    assert!(h.builder.requests().is_empty());
}

#[tokio::test]
async fn rerun_reproduces_tag_and_config() {
    let h = Harness::new();
    let first = h
        .orchestrator(only(ToolchainFlavor::NativeCompiler))
        .generate()
        .await
        .unwrap();
    let build = h
        .root
        .join("local-remote-execution/generated-cc/config/BUILD");
    let before = fs::read(&build).unwrap();

    let second = h
        .orchestrator(only(ToolchainFlavor::NativeCompiler))
        .generate()
        .await
        .unwrap();
    assert_eq!(first.flavors[0].tag, second.flavors[0].tag);
    assert_eq!(
        first.flavors[0].base_image.digest,
        second.flavors[0].base_image.digest
    );
    assert_eq!(fs::read(&build).unwrap(), before);
    assert_ne!(first.run_id, second.run_id);
}

#[tokio::test]
async fn missing_env_file_is_not_an_error() {
    let h = Harness::new();
    h.generator.without_env_file();
    let report = h
        .orchestrator(only(ToolchainFlavor::ManagedRuntime))
        .generate()
        .await
        .unwrap();
    let config = report.flavors[0].config.as_ref().unwrap();
    assert!(config.env_file().is_none());
    assert!(config.build_file().is_file());
}

#[tokio::test]
async fn resolve_tag_matches_generate() {
    let h = Harness::new();
    let orchestrator = h.orchestrator(only(ToolchainFlavor::NativeCompiler));
    let tag = orchestrator
        .resolve_tag(ToolchainFlavor::NativeCompiler)
        .await
        .unwrap();
    let report = orchestrator.generate().await.unwrap();
    assert_eq!(report.flavors[0].tag, tag);
}

#[tokio::test]
async fn tag_changes_with_executable() {
    let a = Harness::new();
    let b = Harness {
        graph: Arc::new(
            FakeBuildGraph::new(&a.root.parent().unwrap().join("store-b"))
                .with_executable(b"\x7fELF rbe-server v2"),
        ),
        ..Harness::new()
    };
    let tag_a = a
        .orchestrator(only(ToolchainFlavor::NativeCompiler))
        .resolve_tag(ToolchainFlavor::NativeCompiler)
        .await
        .unwrap();
    let tag_b = b
        .orchestrator(only(ToolchainFlavor::NativeCompiler))
        .resolve_tag(ToolchainFlavor::NativeCompiler)
        .await
        .unwrap();
    assert_ne!(tag_a, tag_b);
}

#[tokio::test]
async fn compose_cc_worker_and_push() {
    let h = Harness::new();
    let orchestrator = h.orchestrator(only(ToolchainFlavor::NativeCompiler));
    let report = orchestrator
        .compose(
            ToolchainFlavor::NativeCompiler,
            Publish::Push {
                registry: "localhost:5001/".to_string(),
                tls_verify: false,
            },
        )
        .await
        .unwrap();

    let worker = &report.summary.worker;
    assert_eq!(worker.flavor, ToolchainFlavor::NativeCompiler);
    assert_eq!(worker.executable_digest, report.executable.digest);
    assert_eq!(worker.image.name(), "lre-worker-cc");
    let tag = worker.image.tag().clone();

    assert_eq!(
        h.loader.pushed(),
        vec![(format!("localhost:5001/lre-worker-cc:{tag}"), false)]
    );
    assert!(h.generator.requests().is_empty());

    let request = h.builder.requests().pop().unwrap();
    assert_eq!(
        request.layers,
        vec![vec![LayerSource::File {
            src: report.executable.path.clone(),
            dest: "/usr/local/bin/rbe-server".to_string(),
            mode: 0o755,
        }]]
    );

    let layout = OciLayout::open(&h.root.join(".lre/cc/worker")).unwrap();
    let manifest = layout
        .read_manifest(&layout.resolve(tag.as_str()).unwrap())
        .unwrap();
    let config = layout.read_config(&manifest).unwrap();
    assert_eq!(
        config.config.entrypoint,
        Some(vec!["/usr/local/bin/rbe-server".to_string()])
    );
    let labels = config.config.labels.unwrap();
    assert_eq!(
        labels[LABEL_EXECUTABLE_DIGEST],
        report.executable.digest.to_string()
    );
    assert_eq!(labels[LABEL_TITLE], "lre-worker-cc");
    assert_eq!(labels["org.opencontainers.image.revision"], "abc123");
    // closure, toolchain root, executable
    assert_eq!(manifest.layers.len(), 3);
}

#[tokio::test]
async fn compose_legacy_worker_loads_into_daemon() {
    let h = Harness::new();
    let base = h.legacy_base(false);
    let base_digest = base.digest;
    let report = h
        .orchestrator(move |config| {
            config.flavors.legacy.enabled = true;
            config.flavors.legacy.base = Some(base);
        })
        .compose(ToolchainFlavor::Legacy, Publish::Load)
        .await
        .unwrap();

    let expected_tag =
        lre_core::ContentTag::derive_from_base(&base_digest, &report.executable.digest).unwrap();
    assert_eq!(report.summary.worker.image.tag(), &expected_tag);
    assert_eq!(
        h.loader.loaded()[0].to_string(),
        format!("lre-worker-legacy:{expected_tag}")
    );
    assert_eq!(
        report.summary.published_to.as_deref(),
        Some(format!("docker-daemon:lre-worker-legacy:{expected_tag}").as_str())
    );
}

#[tokio::test]
async fn compose_disabled_flavor_is_rejected() {
    let h = Harness::new();
    let err = h
        .orchestrator(|_| {})
        .compose(ToolchainFlavor::Legacy, Publish::None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        PipelineError::FlavorDisabled(ToolchainFlavor::Legacy)
    ));
    assert!(h.graph.built().is_empty());
}

#[tokio::test]
async fn toolchain_image_carries_runtime_closure() {
    let h = Harness::new();
    let report = h
        .orchestrator(only(ToolchainFlavor::NativeCompiler))
        .generate()
        .await
        .unwrap();
    let tag = report.flavors[0].tag.to_string();
    let store = h.root.parent().unwrap().join("store");
    let env = store.join("fake-lre-cc-toolchain");
    let runtime = store.join("fake-lre-cc-toolchain-runtime");

    let requests = h.builder.requests();
    assert_eq!(
        requests[0].layers,
        vec![
            vec![
                LayerSource::Tree {
                    src: env.clone(),
                    dest: env.display().to_string(),
                    dereference: false,
                },
                LayerSource::Tree {
                    src: runtime.clone(),
                    dest: runtime.display().to_string(),
                    dereference: false,
                },
            ],
            vec![LayerSource::Tree {
                src: env.clone(),
                dest: "/".to_string(),
                dereference: false,
            }],
        ]
    );

    let in_image = |p: &Path| p.display().to_string().trim_start_matches('/').to_string();
    let paths = layer_paths(&h.root.join(".lre/cc/toolchain"), &tag);
    assert!(paths.contains(&in_image(&runtime.join("lib/liblre-cc-toolchain.so"))));
    assert!(paths.contains(&in_image(&env.join("bin/lre-cc-toolchain"))));
    assert!(paths.contains(&"bin/lre-cc-toolchain".to_string()));

    // extras bring their own closure; the toolchain's is not repeated
    let autogen = layer_paths(&h.root.join(".lre/cc/autogen"), &tag);
    let extras_runtime = store.join("fake-rbe-autogen-extras-runtime");
    assert!(autogen.contains(&in_image(&extras_runtime.join("lib/librbe-autogen-extras.so"))));
    assert!(autogen.contains(&"bin/rbe-autogen-extras".to_string()));
    let extras_layers: Vec<&LayerSource> = requests[1].layers.iter().flatten().collect();
    assert!(extras_layers
        .iter()
        .all(|l| !matches!(l, LayerSource::Tree { src, .. } if src == &runtime)));
}

#[tokio::test]
async fn autogen_extras_change_moves_tag() {
    let h = Harness::new();
    let first = h
        .orchestrator(only(ToolchainFlavor::NativeCompiler))
        .generate()
        .await
        .unwrap();

    let extras = h.root.parent().unwrap().join("store/fake-rbe-autogen-extras");
    fs::write(extras.join("bin/bazel"), "#!/bin/sh\n").unwrap();
    let second = h
        .orchestrator(only(ToolchainFlavor::NativeCompiler))
        .generate()
        .await
        .unwrap();

    let (first, second) = (&first.flavors[0], &second.flavors[0]);
    assert_ne!(
        first.autogen_image.as_ref().unwrap().digest,
        second.autogen_image.as_ref().unwrap().digest
    );
    assert_ne!(first.tag, second.tag);
}

#[tokio::test]
async fn reruns_keep_one_image_per_layout() {
    let mut h = Harness::new();
    let store = h.root.parent().unwrap().join("store");
    let mut tags = Vec::new();
    for version in ["v0", "v1", "v2"] {
        h.graph = Arc::new(
            FakeBuildGraph::new(&store)
                .with_executable(format!("\x7fELF rbe-server {version}").as_bytes()),
        );
        let report = h
            .orchestrator(only(ToolchainFlavor::NativeCompiler))
            .compose(ToolchainFlavor::NativeCompiler, Publish::None)
            .await
            .unwrap();
        tags.push(report.summary.worker.image.tag().clone());
    }
    assert_ne!(tags[0], tags[1]);
    assert_ne!(tags[1], tags[2]);

    for image in ["toolchain", "autogen", "worker"] {
        let layout = OciLayout::open(&h.root.join(".lre/cc").join(image)).unwrap();
        assert_eq!(layout.read_index().unwrap().manifests.len(), 1, "{image}");
        assert!(layout.resolve(tags[2].as_str()).is_ok());
        assert!(layout.resolve(tags[0].as_str()).is_err());
    }
}
