//! Named pipeline stages and their execution records.

use std::future::Future;
use std::time::Instant;

use lre_core::{ProvisionError, ToolchainFlavor};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::error::PipelineError;

/// A step of the provisioning pipeline.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// nix build of the dependency closure, then the main executable
    BuildExecutable,

    /// Realise the flavor's toolchain package sets
    BuildToolchain,

    /// Derive the content tag shared by the flavor's images
    ResolveTag,

    /// Write the toolchain and introspection images to OCI layouts
    BuildImages,

    /// Fetch a pinned base image by digest
    Pull,

    /// Load the introspection image into the local daemon
    Load,

    /// Run the external config generator against the loaded image
    Generate,

    /// Replace the introspection image name with the deploy name
    Rewrite,

    /// Check that no reference to the introspection image remains
    Verify,

    /// Layer the executable onto the toolchain image
    Compose,

    /// Load or push the composed worker image
    Publish,
}

impl Stage {
    pub fn name(&self) -> &'static str {
        match self {
            Stage::BuildExecutable => "build-executable",
            Stage::BuildToolchain => "build-toolchain",
            Stage::ResolveTag => "resolve-tag",
            Stage::BuildImages => "build-images",
            Stage::Pull => "pull",
            Stage::Load => "load",
            Stage::Generate => "generate",
            Stage::Rewrite => "rewrite",
            Stage::Verify => "verify",
            Stage::Compose => "compose",
            Stage::Publish => "publish",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Outcome of one completed stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageRecord {
    pub stage: Stage,
    pub flavor: Option<ToolchainFlavor>,
    pub duration_ms: u64,
}

/// Run `fut` as `stage`, logging its start and end and wrapping any error
/// as [`PipelineError::StageFailed`].
pub async fn run_stage<T, F>(
    flavor: Option<ToolchainFlavor>,
    stage: Stage,
    records: &mut Vec<StageRecord>,
    fut: F,
) -> Result<T, PipelineError>
where
    F: Future<Output = Result<T, ProvisionError>>,
{
    let start = Instant::now();
    let scope = flavor.map(|f| f.id()).unwrap_or("shared");
    info!(flavor = scope, stage = %stage, "stage started");

    match fut.await {
        Ok(value) => {
            let duration_ms = start.elapsed().as_millis() as u64;
            info!(flavor = scope, stage = %stage, duration_ms, "stage finished");
            records.push(StageRecord {
                stage,
                flavor,
                duration_ms,
            });
            Ok(value)
        }
        Err(source) => {
            error!(flavor = scope, stage = %stage, error = %source, "stage failed");
            Err(PipelineError::StageFailed {
                flavor,
                stage,
                source,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_names_are_kebab_case() {
        assert_eq!(Stage::ResolveTag.name(), "resolve-tag");
        assert_eq!(Stage::BuildToolchain.to_string(), "build-toolchain");
        assert_eq!(
            serde_json::to_string(&Stage::BuildExecutable).unwrap(),
            "\"build_executable\""
        );
    }

    #[tokio::test]
    async fn test_run_stage_records_success() {
        let mut records = Vec::new();
        let value = run_stage(
            Some(ToolchainFlavor::NativeCompiler),
            Stage::ResolveTag,
            &mut records,
            async { Ok::<_, ProvisionError>(7) },
        )
        .await
        .unwrap();
        assert_eq!(value, 7);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].stage, Stage::ResolveTag);
    }

    #[tokio::test]
    async fn test_run_stage_wraps_failure() {
        let mut records = Vec::new();
        let err = run_stage(None, Stage::BuildExecutable, &mut records, async {
            Err::<(), _>(ProvisionError::Build("boom".to_string()))
        })
        .await
        .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::StageFailed {
                stage: Stage::BuildExecutable,
                flavor: None,
                ..
            }
        ));
        assert!(records.is_empty());
    }
}
