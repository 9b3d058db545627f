//! Pipeline errors.

use std::path::PathBuf;

use lre_core::{ProvisionError, ToolchainFlavor};
use thiserror::Error;

use crate::stage::Stage;

fn scope(flavor: &Option<ToolchainFlavor>) -> String {
    match flavor {
        Some(flavor) => format!("flavor {flavor}"),
        None => "shared".to_string(),
    }
}

#[derive(Error, Debug)]
pub enum PipelineError {
    /// A named stage failed; the run stops here.
    #[error("stage {stage} failed ({}): {source}", scope(.flavor))]
    StageFailed {
        flavor: Option<ToolchainFlavor>,
        stage: Stage,
        #[source]
        source: ProvisionError,
    },

    /// Two flavors would write into the same output tree.
    #[error("output directories of {first} and {second} overlap at {path}")]
    OverlappingOutputs {
        first: ToolchainFlavor,
        second: ToolchainFlavor,
        path: PathBuf,
    },

    #[error("flavor {0} is not enabled")]
    FlavorDisabled(ToolchainFlavor),

    /// A flavor task panicked or was cancelled.
    #[error("flavor task failed: {0}")]
    Task(String),

    #[error(transparent)]
    Provision(#[from] ProvisionError),
}

impl PipelineError {
    pub fn flavor(&self) -> Option<ToolchainFlavor> {
        match self {
            PipelineError::StageFailed { flavor, .. } => *flavor,
            PipelineError::FlavorDisabled(flavor) => Some(*flavor),
            _ => None,
        }
    }

    pub fn stage(&self) -> Option<Stage> {
        match self {
            PipelineError::StageFailed { stage, .. } => Some(*stage),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_failed_display() {
        let err = PipelineError::StageFailed {
            flavor: Some(ToolchainFlavor::NativeCompiler),
            stage: Stage::Generate,
            source: ProvisionError::Generation {
                flavor: "cc".to_string(),
                reason: "exit code 1".to_string(),
            },
        };
        let msg = err.to_string();
        assert!(msg.contains("stage generate failed (flavor cc)"));
        assert_eq!(err.stage(), Some(Stage::Generate));
        assert_eq!(err.flavor(), Some(ToolchainFlavor::NativeCompiler));
    }

    #[test]
    fn test_shared_scope() {
        let err = PipelineError::StageFailed {
            flavor: None,
            stage: Stage::BuildExecutable,
            source: ProvisionError::Build("link error".to_string()),
        };
        assert!(err.to_string().contains("(shared)"));
    }
}
