//! LRE Core Library
//!
//! Shared domain model for provisioning remote-build-execution toolchain
//! images: flavors, digests, image identities, content tags, configuration,
//! the platform-config rewriter and the external command runner.

pub mod config;
pub mod digest;
pub mod error;
pub mod fakes;
pub mod flavor;
pub mod git;
pub mod image;
pub mod labels;
pub mod process;
pub mod rewrite;
pub mod tag;
pub mod telemetry;

pub use config::{
    AutogenFlavorConfig, BaseImageConfig, ExecutableConfig, FlavorsConfig, GeneratorConfig,
    LegacyFlavorConfig, PipelineConfig, ToolchainDefinition, CONFIG_FILE_NAME,
};
pub use digest::{Digest, HashingWriter};
pub use error::{CommandError, ConfigError, ProvisionError, Result, RewriteError};
pub use flavor::{ConfigKind, FlavorProfile, ToolchainFlavor};
pub use git::{capture_head_sha, source_root};
pub use image::{
    ContentAddressedImage, ImageReference, ImageTag, LayerDescriptor, Platform, WorkerImage,
};
pub use labels::{OciLabels, LABEL_EXECUTABLE_DIGEST};
pub use process::{CommandOutput, CommandRunner, CommandSpec, ProcessRunner};
pub use rewrite::{GeneratedPlatformConfig, RewriteReport};
pub use tag::ContentTag;

/// Crate version, reported by `lre --version` and stamped into run reports.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
