//! In-memory adapters (testing only)
//!
//! Every fake records what it was asked to do. Files the real tools would
//! produce (store trees, generated configs, pulled images) are written under
//! a caller-provided directory so the rest of the pipeline runs unchanged.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use lre_core::{
    ContentAddressedImage, Digest, ImageReference, ProvisionError, Result, ToolchainFlavor,
};
use lre_nix::{BuildInputs, CachedArtifactSet, Executable, RealizedToolchain};
use lre_oci::schema::{
    Descriptor, ImageConfig, ImageManifest, MEDIA_TYPE_CONFIG, MEDIA_TYPE_MANIFEST,
};
use lre_oci::{BuildRequest, BuiltImage, OciError, OciImageBuilder};

use crate::adapters::{
    BuildGraph, ConfigGenerator, GenerateRequest, ImageBuilder, ImageLoader, ImagePuller,
    PullRequest, PulledImage,
};

/// Build graph writing fake store paths under `store`.
pub struct FakeBuildGraph {
    store: PathBuf,
    executable: Vec<u8>,
    failing_attrs: Mutex<BTreeSet<String>>,
    built: Mutex<Vec<String>>,
}

impl FakeBuildGraph {
    pub fn new(store: &Path) -> Self {
        Self {
            store: store.to_path_buf(),
            executable: b"\x7fELF rbe-server".to_vec(),
            failing_attrs: Mutex::new(BTreeSet::new()),
            built: Mutex::new(Vec::new()),
        }
    }

    /// Contents of the built executable.
    pub fn with_executable(mut self, bytes: &[u8]) -> Self {
        self.executable = bytes.to_vec();
        self
    }

    /// Fail every build of `attr`.
    pub fn fail_on(&self, attr: &str) {
        self.failing_attrs.lock().unwrap().insert(attr.to_string());
    }

    /// Attributes built so far, in order.
    pub fn built(&self) -> Vec<String> {
        self.built.lock().unwrap().clone()
    }

    fn record(&self, attr: &str) -> Result<PathBuf> {
        self.built.lock().unwrap().push(attr.to_string());
        if self.failing_attrs.lock().unwrap().contains(attr) {
            return Err(ProvisionError::Build(format!(
                "nix build .#{attr} exited with code 1"
            )));
        }
        let out = self.store.join(format!("fake-{attr}"));
        std::fs::create_dir_all(&out)?;
        Ok(out)
    }
}

#[async_trait]
impl BuildGraph for FakeBuildGraph {
    async fn build_deps_only(&self, inputs: &BuildInputs) -> Result<CachedArtifactSet> {
        let store_path = self.record(&inputs.deps_attr)?;
        Ok(CachedArtifactSet {
            store_path,
            flake: inputs.flake.clone(),
        })
    }

    async fn build_full(
        &self,
        inputs: &BuildInputs,
        _deps: &CachedArtifactSet,
    ) -> Result<Executable> {
        let store_path = self.record(&inputs.attr)?;
        let bin = store_path.join("bin");
        std::fs::create_dir_all(&bin)?;
        let path = bin.join(&inputs.binary);
        std::fs::write(&path, &self.executable)?;
        Ok(Executable {
            path,
            name: inputs.binary.clone(),
            digest: Digest::compute(&self.executable),
            store_path,
        })
    }

    /// `fake-<attr>/bin/<attr>` needing `fake-<attr>-runtime/lib/lib<attr>.so`.
    async fn realize_toolchain(
        &self,
        _source_root: &Path,
        attr: &str,
    ) -> Result<RealizedToolchain> {
        let root = self.record(attr)?;
        let runtime = self.store.join(format!("fake-{attr}-runtime"));
        // store paths are immutable once written
        let bin = root.join("bin").join(attr);
        if !bin.exists() {
            std::fs::create_dir_all(root.join("bin"))?;
            std::fs::write(&bin, format!("#!/bin/sh\necho {attr}\n"))?;
        }
        let lib = runtime.join("lib").join(format!("lib{attr}.so"));
        if !lib.exists() {
            std::fs::create_dir_all(runtime.join("lib"))?;
            std::fs::write(&lib, attr.as_bytes())?;
        }

        let mut closure = vec![root.clone(), runtime];
        closure.sort();
        Ok(RealizedToolchain { root, closure })
    }
}

/// The native OCI builder, recording every request.
#[derive(Default)]
pub struct FakeImageBuilder {
    inner: OciImageBuilder,
    requests: Mutex<Vec<BuildRequest>>,
}

impl FakeImageBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn requests(&self) -> Vec<BuildRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ImageBuilder for FakeImageBuilder {
    async fn build(&self, request: BuildRequest, layout_dir: PathBuf) -> Result<BuiltImage> {
        self.requests.lock().unwrap().push(request.clone());
        Ok(self.inner.build(&request, &layout_dir)?)
    }
}

/// Puller serving one fixed image in `dir:` form.
pub struct FakeImagePuller {
    config: Vec<u8>,
    manifest: Vec<u8>,
    requests: Mutex<Vec<PullRequest>>,
}

impl Default for FakeImagePuller {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeImagePuller {
    pub fn new() -> Self {
        let config = serde_json::to_vec(&ImageConfig {
            architecture: "amd64".to_string(),
            os: "linux".to_string(),
            ..ImageConfig::default()
        })
        .unwrap_or_default();
        let manifest = serde_json::to_vec(&ImageManifest {
            schema_version: 2,
            media_type: Some(MEDIA_TYPE_MANIFEST.to_string()),
            config: Descriptor {
                media_type: MEDIA_TYPE_CONFIG.to_string(),
                digest: Digest::compute(&config),
                size: config.len() as u64,
                annotations: None,
            },
            layers: Vec::new(),
            annotations: None,
        })
        .unwrap_or_default();
        Self {
            config,
            manifest,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Manifest digest of the served image; pin this to make pulls succeed.
    pub fn digest(&self) -> Digest {
        Digest::compute(&self.manifest)
    }

    pub fn requests(&self) -> Vec<PullRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ImagePuller for FakeImagePuller {
    async fn pull(
        &self,
        request: &PullRequest,
        reference: &ImageReference,
        dest: &Path,
    ) -> Result<PulledImage> {
        self.requests.lock().unwrap().push(request.clone());
        let actual = self.digest();
        if actual != request.digest {
            return Err(OciError::DigestMismatch {
                expected: request.digest,
                actual,
            }
            .into());
        }
        std::fs::create_dir_all(dest)?;
        std::fs::write(dest.join("manifest.json"), &self.manifest)?;
        std::fs::write(dest.join(Digest::compute(&self.config).hex()), &self.config)?;
        Ok(PulledImage {
            dir: dest.to_path_buf(),
            image: ContentAddressedImage {
                reference: reference.clone(),
                digest: actual,
                layers: Vec::new(),
            },
        })
    }
}

/// Loader recording loads and pushes.
#[derive(Default)]
pub struct FakeImageLoader {
    loaded: Mutex<Vec<ImageReference>>,
    pushed: Mutex<Vec<(String, bool)>>,
    fail: Mutex<bool>,
}

impl FakeImageLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail(&self) {
        *self.fail.lock().unwrap() = true;
    }

    pub fn loaded(&self) -> Vec<ImageReference> {
        self.loaded.lock().unwrap().clone()
    }

    pub fn pushed(&self) -> Vec<(String, bool)> {
        self.pushed.lock().unwrap().clone()
    }

    fn check(&self, what: &str) -> Result<()> {
        if *self.fail.lock().unwrap() {
            return Err(ProvisionError::Image(format!("{what}: daemon not reachable")));
        }
        Ok(())
    }
}

#[async_trait]
impl ImageLoader for FakeImageLoader {
    async fn load(&self, image: &BuiltImage, reference: &ImageReference) -> Result<()> {
        self.check(&image.image.reference.to_string())?;
        self.loaded.lock().unwrap().push(reference.clone());
        Ok(())
    }

    async fn push(&self, image: &BuiltImage, destination: &str, tls_verify: bool) -> Result<()> {
        self.check(&image.image.reference.to_string())?;
        self.pushed
            .lock()
            .unwrap()
            .push((destination.to_string(), tls_verify));
        Ok(())
    }
}

/// Generator writing a minimal config tree that names the container it was
/// pointed at, the way `rbe_configs_gen` does.
#[derive(Default)]
pub struct FakeConfigGenerator {
    requests: Mutex<Vec<GenerateRequest>>,
    completed: Mutex<Vec<ToolchainFlavor>>,
    failing: Mutex<BTreeSet<ToolchainFlavor>>,
    delays: Mutex<Vec<(ToolchainFlavor, Duration)>>,
    skip_env_file: Mutex<bool>,
}

impl FakeConfigGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Exit non-zero for `flavor`.
    pub fn fail_for(&self, flavor: ToolchainFlavor) {
        self.failing.lock().unwrap().insert(flavor);
    }

    /// Take `delay` before answering for `flavor`.
    pub fn delay_for(&self, flavor: ToolchainFlavor, delay: Duration) {
        self.delays.lock().unwrap().push((flavor, delay));
    }

    /// Emit only `config/BUILD`.
    pub fn without_env_file(&self) {
        *self.skip_env_file.lock().unwrap() = true;
    }

    pub fn requests(&self) -> Vec<GenerateRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Flavors whose generation ran to completion.
    pub fn completed(&self) -> Vec<ToolchainFlavor> {
        self.completed.lock().unwrap().clone()
    }
}

#[async_trait]
impl ConfigGenerator for FakeConfigGenerator {
    async fn generate(&self, request: &GenerateRequest) -> Result<()> {
        self.requests.lock().unwrap().push(request.clone());

        let delay = self
            .delays
            .lock()
            .unwrap()
            .iter()
            .find(|(f, _)| *f == request.flavor)
            .map(|(_, d)| *d);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if self.failing.lock().unwrap().contains(&request.flavor) {
            return Err(ProvisionError::Generation {
                flavor: request.flavor.to_string(),
                reason: "rbe_configs_gen exited with code 1".to_string(),
            });
        }

        let root = request.source_root.join(&request.output_config_path);
        let config_dir = root.join("config");
        std::fs::create_dir_all(&config_dir)?;
        let container = &request.toolchain_container;
        std::fs::write(
            config_dir.join("BUILD"),
            format!(
                "platform(\n    name = \"platform\",\n    exec_properties = {{\n        \"container-image\": \"docker://{container}\",\n    }},\n)\n"
            ),
        )?;
        if !*self.skip_env_file.lock().unwrap() {
            std::fs::write(
                config_dir.join("environment.json"),
                format!("{{\"image\": \"{container}\"}}\n"),
            )?;
        }

        self.completed.lock().unwrap().push(request.flavor);
        Ok(())
    }
}
