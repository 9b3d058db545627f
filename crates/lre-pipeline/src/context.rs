//! Everything a pipeline run needs: source root, configuration, labels and
//! the adapters to the external systems.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use lre_core::{
    capture_head_sha, CommandRunner, OciLabels, PipelineConfig, ProcessRunner, Result,
};
use lre_nix::NixBuildGraph;
use lre_oci::OciImageBuilder;
use tracing::{debug, warn};

use crate::adapters::{
    BuildGraph, ConfigGenerator, ImageBuilder, ImageLoader, ImagePuller, RbeConfigsGen, Skopeo,
};

/// The external systems a run drives.
#[derive(Clone)]
pub struct Adapters {
    pub graph: Arc<dyn BuildGraph>,
    pub builder: Arc<dyn ImageBuilder>,
    pub puller: Arc<dyn ImagePuller>,
    pub loader: Arc<dyn ImageLoader>,
    pub generator: Arc<dyn ConfigGenerator>,
}

impl Adapters {
    /// Production adapters: nix, the native OCI writer, skopeo and
    /// `rbe_configs_gen`, all sharing one command runner.
    pub fn system(runner: Arc<dyn CommandRunner>, config: &PipelineConfig) -> Self {
        let timeout = config.command_timeout_secs;
        let skopeo = Arc::new(Skopeo::new(runner.clone()).with_timeout_secs(timeout));
        Self {
            graph: Arc::new(NixBuildGraph::new(runner.clone()).with_timeout_secs(timeout)),
            builder: Arc::new(OciImageBuilder::new()),
            puller: skopeo.clone(),
            loader: skopeo,
            generator: Arc::new(
                RbeConfigsGen::new(runner, config.generator.clone()).with_timeout_secs(timeout),
            ),
        }
    }
}

/// Shared, read-only state of one run.
#[derive(Clone)]
pub struct PipelineContext {
    pub source_root: PathBuf,
    pub config: Arc<PipelineConfig>,
    /// Configured labels with the revision filled in.
    pub labels: OciLabels,
    pub adapters: Adapters,
}

impl PipelineContext {
    pub fn new(source_root: &Path, config: PipelineConfig, adapters: Adapters) -> Self {
        let labels = config.labels.clone();
        Self {
            source_root: source_root.to_path_buf(),
            config: Arc::new(config),
            labels,
            adapters,
        }
    }

    pub fn with_revision(mut self, revision: impl Into<String>) -> Self {
        self.labels = self.labels.with_revision(revision);
        self
    }

    /// Context for `source_root` with its configuration file, the production
    /// adapters and the HEAD revision stamped into the labels.
    pub fn discover(source_root: &Path) -> Result<Self> {
        let config = PipelineConfig::load(source_root)?;
        debug!(root = %source_root.display(), ?config, "loaded pipeline config");
        let runner: Arc<dyn CommandRunner> = Arc::new(ProcessRunner::new());
        let adapters = Adapters::system(runner, &config);
        let context = Self::new(source_root, config, adapters);

        match capture_head_sha(source_root) {
            Ok(sha) => Ok(context.with_revision(sha)),
            Err(e) => {
                warn!(error = %e, "could not read HEAD revision; labels keep the configured value");
                Ok(context)
            }
        }
    }
}
