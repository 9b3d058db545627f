//! [`BuildGraph`] over `nix build`.

use std::path::Path;

use async_trait::async_trait;
use lre_core::Result;
use lre_nix::{BuildInputs, CachedArtifactSet, Executable, NixBuildGraph, RealizedToolchain};

use super::BuildGraph;

#[async_trait]
impl BuildGraph for NixBuildGraph {
    async fn build_deps_only(&self, inputs: &BuildInputs) -> Result<CachedArtifactSet> {
        Ok(NixBuildGraph::build_deps_only(self, inputs).await?)
    }

    async fn build_full(
        &self,
        inputs: &BuildInputs,
        deps: &CachedArtifactSet,
    ) -> Result<Executable> {
        Ok(NixBuildGraph::build_full(self, inputs, deps).await?)
    }

    async fn realize_toolchain(
        &self,
        source_root: &Path,
        attr: &str,
    ) -> Result<RealizedToolchain> {
        Ok(NixBuildGraph::realize_toolchain(self, source_root, attr).await?)
    }
}
