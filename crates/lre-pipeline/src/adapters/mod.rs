//! Seams to the external systems the pipeline drives.
//!
//! Production implementations shell out through a
//! [`CommandRunner`](lre_core::CommandRunner) or wrap the native OCI builder;
//! in-memory versions live in [`crate::fakes`].

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use lre_core::{
    BaseImageConfig, ConfigKind, ContentAddressedImage, Digest, ImageReference, Platform,
    Result, ToolchainFlavor,
};
use lre_nix::{BuildInputs, CachedArtifactSet, Executable, RealizedToolchain};
use lre_oci::{BuildRequest, BuiltImage};

pub mod generator;
pub mod nix;
pub mod oci;
pub mod skopeo;

pub use generator::{generator_args, RbeConfigsGen};
pub use skopeo::Skopeo;

/// Dependency-aware build graph producing the main executable and
/// toolchain trees.
#[async_trait]
pub trait BuildGraph: Send + Sync {
    async fn build_deps_only(&self, inputs: &BuildInputs) -> Result<CachedArtifactSet>;

    async fn build_full(
        &self,
        inputs: &BuildInputs,
        deps: &CachedArtifactSet,
    ) -> Result<Executable>;

    async fn realize_toolchain(&self, source_root: &Path, attr: &str)
        -> Result<RealizedToolchain>;
}

/// Writes images to local layouts.
#[async_trait]
pub trait ImageBuilder: Send + Sync {
    async fn build(&self, request: BuildRequest, layout_dir: PathBuf) -> Result<BuiltImage>;
}

/// A base image fetched by digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PulledImage {
    /// Local copy holding the registry's manifest bytes.
    pub dir: PathBuf,
    pub image: ContentAddressedImage,
}

/// Parameters of a pinned pull.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullRequest {
    pub name: String,
    pub digest: Digest,
    pub registry: String,
    pub tls_verify: bool,
    pub platform: Platform,
}

impl From<&BaseImageConfig> for PullRequest {
    fn from(base: &BaseImageConfig) -> Self {
        Self {
            name: base.name.clone(),
            digest: base.digest,
            registry: base.registry.clone(),
            tls_verify: base.tls_verify,
            platform: base.platform.clone(),
        }
    }
}

impl PullRequest {
    /// `<registry>/<name>@<digest>`
    pub fn source(&self) -> String {
        format!("{}/{}@{}", self.registry, self.name, self.digest)
    }
}

#[async_trait]
pub trait ImagePuller: Send + Sync {
    /// Fetch the image into `dest`, failing unless its manifest digest
    /// equals the pinned one.
    async fn pull(
        &self,
        request: &PullRequest,
        reference: &ImageReference,
        dest: &Path,
    ) -> Result<PulledImage>;
}

/// Moves built images into a daemon or registry.
#[async_trait]
pub trait ImageLoader: Send + Sync {
    async fn load(&self, image: &BuiltImage, reference: &ImageReference) -> Result<()>;

    async fn push(&self, image: &BuiltImage, destination: &str, tls_verify: bool) -> Result<()>;
}

/// One invocation of the external config generator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerateRequest {
    pub flavor: ToolchainFlavor,
    pub kind: ConfigKind,
    /// Loaded introspection image.
    pub toolchain_container: ImageReference,
    pub source_root: PathBuf,
    /// Output directory relative to `source_root`.
    pub output_config_path: PathBuf,
}

#[async_trait]
pub trait ConfigGenerator: Send + Sync {
    async fn generate(&self, request: &GenerateRequest) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pull_source_is_digest_pinned() {
        let base = BaseImageConfig {
            name: "rbe-ubuntu16-04".to_string(),
            digest: Digest::compute(b"manifest"),
            registry: "localhost:5001".to_string(),
            tls_verify: false,
            platform: Platform::default(),
        };
        let request = PullRequest::from(&base);
        assert_eq!(
            request.source(),
            format!("localhost:5001/rbe-ubuntu16-04@{}", base.digest)
        );
        assert!(!request.tls_verify);
    }
}
