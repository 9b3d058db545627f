//! LRE-Pipeline: autogen orchestration
//!
//! Drives the external systems (nix, the OCI builder, skopeo and the config
//! generator) through named stages to produce verified platform configs and
//! worker images for every enabled toolchain flavor.

pub mod adapters;
pub mod composer;
pub mod context;
pub mod error;
pub mod fakes;
pub mod flavor_pipeline;
pub mod orchestrator;
pub mod stage;

pub use adapters::{
    BuildGraph, ConfigGenerator, GenerateRequest, ImageBuilder, ImageLoader, ImagePuller,
    PullRequest, PulledImage,
};
pub use composer::{ComposeSummary, ComposedWorker, WorkerComposer};
pub use context::{Adapters, PipelineContext};
pub use error::PipelineError;
pub use flavor_pipeline::{
    FlavorOutcome, FlavorPipeline, PreparedToolchain, ResolvedToolchain,
};
pub use orchestrator::{ComposeReport, Orchestrator, Publish, RunReport};
pub use stage::{Stage, StageRecord};

/// Result type for pipeline runs
pub type Result<T> = std::result::Result<T, PipelineError>;
