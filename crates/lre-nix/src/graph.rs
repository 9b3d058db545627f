//! Nix-backed build graph.
//!
//! Builds run as `nix build .#<attr> --print-out-paths --no-link` from the
//! source root. The dependency-only derivation is built first so that a
//! source-only change reuses every cached dependency. Toolchains are
//! realised together with their runtime closure
//! (`nix path-info --recursive`), since the binaries in them load their
//! interpreter and libraries from absolute store paths.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use lre_core::{CommandRunner, CommandSpec, Digest};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::BuildError;
use crate::flake::FlakeIdentity;
use crate::source::BuildInputs;
use crate::Result;

/// Realised dependency closure, reused by the full build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedArtifactSet {
    pub store_path: PathBuf,
    pub flake: FlakeIdentity,
}

/// The statically linked main executable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Executable {
    /// `<out>/bin/<binary>`
    pub path: PathBuf,
    pub name: String,
    pub digest: Digest,
    pub store_path: PathBuf,
}

/// A realised toolchain package set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RealizedToolchain {
    /// The `buildEnv` output: a tree of links into the closure.
    pub root: PathBuf,
    /// Every store path `root` needs at runtime, `root` included, sorted.
    pub closure: Vec<PathBuf>,
}

const NIX: &str = "nix";

/// Drives `nix build` through a [`CommandRunner`].
#[derive(Clone)]
pub struct NixBuildGraph {
    runner: Arc<dyn CommandRunner>,
    timeout_secs: u64,
}

impl NixBuildGraph {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            timeout_secs: 0,
        }
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    /// Build `.#attr` and return its store path.
    pub async fn realize(&self, source_root: &Path, attr: &str) -> Result<PathBuf> {
        let spec = CommandSpec::new(NIX)
            .args(["build", &format!(".#{attr}"), "--print-out-paths", "--no-link"])
            .current_dir(source_root)
            .timeout_secs(self.timeout_secs);

        let output = self.runner.run(&spec).await?;
        if !output.success() {
            return Err(BuildError::NixBuildFailed {
                attr: attr.to_string(),
                code: output.exit_code,
                stderr: output.stderr,
            });
        }

        let out_path = output
            .stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .last()
            .ok_or_else(|| BuildError::NoOutPath(attr.to_string()))?;
        info!(attr, out_path, "realised");
        Ok(PathBuf::from(out_path))
    }

    /// Build only the dependency closure.
    pub async fn build_deps_only(&self, inputs: &BuildInputs) -> Result<CachedArtifactSet> {
        let store_path = self.realize(&inputs.source_root, &inputs.deps_attr).await?;
        Ok(CachedArtifactSet {
            store_path,
            flake: inputs.flake.clone(),
        })
    }

    /// Build the executable on top of a realised dependency closure.
    pub async fn build_full(
        &self,
        inputs: &BuildInputs,
        deps: &CachedArtifactSet,
    ) -> Result<Executable> {
        let store_path = self.realize(&inputs.source_root, &inputs.attr).await?;
        let path = store_path.join("bin").join(&inputs.binary);
        if !path.is_file() {
            return Err(BuildError::MissingBinary {
                out_path: store_path.display().to_string(),
                binary: inputs.binary.clone(),
            });
        }
        let digest = Digest::of_file(&path)?;
        info!(
            binary = %inputs.binary,
            digest = %digest.short(),
            deps = %deps.store_path.display(),
            flake = %deps.flake.short(),
            "built executable"
        );
        Ok(Executable {
            path,
            name: inputs.binary.clone(),
            digest,
            store_path,
        })
    }

    /// Store paths `store_path` references at runtime, itself included.
    pub async fn runtime_closure(&self, store_path: &Path) -> Result<Vec<PathBuf>> {
        let spec = CommandSpec::new(NIX)
            .args(["path-info", "--recursive"])
            .arg(store_path.display().to_string())
            .timeout_secs(self.timeout_secs);

        let output = self.runner.run(&spec).await?;
        if !output.success() {
            return Err(BuildError::ClosureQueryFailed {
                store_path: store_path.display().to_string(),
                code: output.exit_code,
                stderr: output.stderr,
            });
        }

        let mut closure: Vec<PathBuf> = output
            .stdout
            .lines()
            .map(str::trim)
            .filter(|l| l.starts_with('/'))
            .map(PathBuf::from)
            .collect();
        if !closure.iter().any(|p| p == store_path) {
            closure.push(store_path.to_path_buf());
        }
        closure.sort();
        closure.dedup();
        Ok(closure)
    }

    /// Realise a toolchain package set and its runtime closure.
    pub async fn realize_toolchain(
        &self,
        source_root: &Path,
        attr: &str,
    ) -> Result<RealizedToolchain> {
        let root = self.realize(source_root, attr).await?;
        if !root.is_dir() {
            return Err(BuildError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("toolchain output {} is not a directory", root.display()),
            )));
        }
        let closure = self.runtime_closure(&root).await?;
        info!(attr, paths = closure.len(), "resolved runtime closure");
        Ok(RealizedToolchain { root, closure })
    }
}
