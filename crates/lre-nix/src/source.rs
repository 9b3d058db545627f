//! Build inputs: the source tree plus the flake attributes to build.

use std::path::{Path, PathBuf};

use lre_core::ExecutableConfig;
use serde::{Deserialize, Serialize};

use crate::flake::{flake_identity, FlakeIdentity};
use crate::Result;

/// Everything the build graph needs to produce the main executable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildInputs {
    pub source_root: PathBuf,
    /// Dependency-only derivation.
    pub deps_attr: String,
    pub attr: String,
    /// Binary name under `<out>/bin/`.
    pub binary: String,
    /// Identity of the pinned flake inputs.
    pub flake: FlakeIdentity,
}

impl BuildInputs {
    pub fn new(source_root: &Path, executable: &ExecutableConfig) -> Result<Self> {
        Ok(Self {
            source_root: source_root.to_path_buf(),
            deps_attr: executable.deps_attr.clone(),
            attr: executable.attr.clone(),
            binary: executable.binary.clone(),
            flake: flake_identity(source_root)?,
        })
    }
}
