//! The per-flavor stage sequence.
//!
//! Autogen flavors: build-toolchain, resolve-tag, build-images, load,
//! generate, rewrite, verify. The legacy flavor only pulls its pinned base.

use std::path::PathBuf;

use lre_core::rewrite::rewrite;
use lre_core::{
    ContentAddressedImage, ContentTag, Digest, FlavorProfile, GeneratedPlatformConfig,
    ImageReference, ImageTag, ProvisionError, RewriteReport, ToolchainDefinition,
    ToolchainFlavor,
};
use lre_nix::{Executable, RealizedToolchain};
use lre_oci::{BaseSource, BuildRequest, BuiltImage, LayerSource};
use serde::Serialize;
use tracing::{debug, info};

use crate::adapters::{GenerateRequest, PullRequest, PulledImage};
use crate::context::PipelineContext;
use crate::error::PipelineError;
use crate::stage::{run_stage, Stage, StageRecord};

/// The images a flavor's configs and workers are built from.
#[derive(Debug, Clone)]
pub enum PreparedToolchain {
    Autogen {
        tag: ImageTag,
        realized: RealizedToolchain,
        /// `<deploy_name>:<tag>`
        toolchain: BuiltImage,
        /// `<autogen_name>:<tag>`, toolchain plus introspection extras.
        autogen: BuiltImage,
    },
    Pulled(PulledImage),
}

impl PreparedToolchain {
    /// Image the worker is layered onto.
    pub fn base_image(&self) -> &ContentAddressedImage {
        match self {
            PreparedToolchain::Autogen { toolchain, .. } => &toolchain.image,
            PreparedToolchain::Pulled(pulled) => &pulled.image,
        }
    }

    pub fn base_source(&self) -> BaseSource {
        match self {
            PreparedToolchain::Autogen { toolchain, .. } => BaseSource::Oci {
                layout: toolchain.layout.clone(),
                tag: toolchain.image.tag().to_string(),
            },
            PreparedToolchain::Pulled(pulled) => BaseSource::Dir(pulled.dir.clone()),
        }
    }

    /// Tag shared by every image derived from this toolchain and `executable`.
    pub fn worker_tag(&self, executable: &Digest) -> lre_core::Result<ImageTag> {
        match self {
            PreparedToolchain::Autogen { tag, .. } => Ok(tag.clone()),
            PreparedToolchain::Pulled(pulled) => {
                ContentTag::derive_from_base(&pulled.image.digest, executable)
            }
        }
    }
}

/// A flavor's realised trees and the content tag derived from them.
#[derive(Debug, Clone)]
pub struct ResolvedToolchain {
    pub definition: ToolchainDefinition,
    pub tag: ImageTag,
    pub toolchain: RealizedToolchain,
    /// Introspection extras, layered onto the autogen image only.
    pub extras: Option<RealizedToolchain>,
}

/// One layer holding every closure path not already in `skip`, each at its
/// own store path, followed by one holding `tree.root` at `/`. Symlinks stay
/// links so they keep resolving into the closure.
fn closure_layers(tree: &RealizedToolchain, skip: &[PathBuf]) -> Vec<Vec<LayerSource>> {
    let closure = tree
        .closure
        .iter()
        .filter(|path| !skip.contains(path))
        .map(|path| LayerSource::Tree {
            src: path.clone(),
            dest: path.to_string_lossy().into_owned(),
            dereference: false,
        })
        .collect();
    let root = vec![LayerSource::Tree {
        src: tree.root.clone(),
        dest: "/".to_string(),
        dereference: false,
    }];
    vec![closure, root]
}

/// What one flavor produced during `generate`.
#[derive(Debug, Clone, Serialize)]
pub struct FlavorOutcome {
    pub flavor: ToolchainFlavor,
    pub tag: ImageTag,
    pub base_image: ContentAddressedImage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub autogen_image: Option<ContentAddressedImage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<GeneratedPlatformConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rewrite: Option<RewriteReport>,
    pub stages: Vec<StageRecord>,
}

/// Runs the stages of a single flavor.
pub struct FlavorPipeline {
    ctx: PipelineContext,
    flavor: ToolchainFlavor,
}

impl FlavorPipeline {
    pub fn new(ctx: PipelineContext, flavor: ToolchainFlavor) -> Self {
        Self { ctx, flavor }
    }

    pub fn flavor(&self) -> ToolchainFlavor {
        self.flavor
    }

    fn profile(&self) -> &'static FlavorProfile {
        self.flavor.profile()
    }

    async fn stage<T, F>(
        &self,
        stage: Stage,
        records: &mut Vec<StageRecord>,
        fut: F,
    ) -> Result<T, PipelineError>
    where
        F: std::future::Future<Output = lre_core::Result<T>>,
    {
        run_stage(Some(self.flavor), stage, records, fut).await
    }

    fn missing(&self, what: &str) -> ProvisionError {
        ProvisionError::Build(format!("flavor {} has no {what}", self.flavor))
    }

    /// Full `generate` sequence for this flavor.
    pub async fn run(&self, executable: &Executable) -> Result<FlavorOutcome, PipelineError> {
        let mut records = Vec::new();
        let prepared = self.prepare(executable, &mut records).await?;

        let (config, report) = match &prepared {
            PreparedToolchain::Autogen { autogen, .. } => {
                let (config, report) = self.generate_config(autogen, &mut records).await?;
                (Some(config), Some(report))
            }
            PreparedToolchain::Pulled(_) => (None, None),
        };

        let autogen_image = match &prepared {
            PreparedToolchain::Autogen { autogen, .. } => Some(autogen.image.clone()),
            PreparedToolchain::Pulled(_) => None,
        };
        let tag = match &prepared {
            PreparedToolchain::Autogen { tag, .. } => tag.clone(),
            PreparedToolchain::Pulled(_) => {
                self.stage(Stage::ResolveTag, &mut records, async {
                    prepared.worker_tag(&executable.digest)
                })
                .await?
            }
        };

        Ok(FlavorOutcome {
            flavor: self.flavor,
            tag,
            base_image: prepared.base_image().clone(),
            autogen_image,
            config,
            rewrite: report,
            stages: records,
        })
    }

    /// Build (or pull) the images for this flavor.
    pub async fn prepare(
        &self,
        executable: &Executable,
        records: &mut Vec<StageRecord>,
    ) -> Result<PreparedToolchain, PipelineError> {
        if self.flavor.has_autogen() {
            self.prepare_autogen(executable, records).await
        } else {
            self.pull_base(records).await
        }
    }

    /// Realise the toolchain (and extras) and derive the flavor's tag.
    pub async fn resolve_tag(
        &self,
        executable: &Executable,
        records: &mut Vec<StageRecord>,
    ) -> Result<ResolvedToolchain, PipelineError> {
        let graph = &self.ctx.adapters.graph;
        let root = &self.ctx.source_root;

        let definition = self
            .ctx
            .config
            .toolchain(self.flavor)
            .ok_or_else(|| PipelineError::StageFailed {
                flavor: Some(self.flavor),
                stage: Stage::BuildToolchain,
                source: self.missing("toolchain definition"),
            })?;

        let (toolchain, extras) = self
            .stage(Stage::BuildToolchain, records, async {
                let toolchain = graph.realize_toolchain(root, &definition.attr).await?;
                let extras = match &definition.autogen_extras {
                    Some(attr) => Some(graph.realize_toolchain(root, attr).await?),
                    None => None,
                };
                Ok::<_, ProvisionError>((toolchain, extras))
            })
            .await?;

        let tag = self
            .stage(Stage::ResolveTag, records, async {
                let toolchain_root = toolchain.root.clone();
                let extras_root = extras.as_ref().map(|e| e.root.clone());
                let definition = definition.clone();
                let digest = executable.digest;
                let tag = tokio::task::spawn_blocking(move || {
                    ContentTag::derive(
                        &definition,
                        &toolchain_root,
                        extras_root.as_deref(),
                        &digest,
                    )
                })
                .await
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))??;
                Ok::<_, ProvisionError>(tag)
            })
            .await?;
        info!(flavor = %self.flavor, tag = %tag, "resolved content tag");

        Ok(ResolvedToolchain {
            definition,
            tag,
            toolchain,
            extras,
        })
    }

    async fn prepare_autogen(
        &self,
        executable: &Executable,
        records: &mut Vec<StageRecord>,
    ) -> Result<PreparedToolchain, PipelineError> {
        let profile = self.profile();
        let ResolvedToolchain {
            definition,
            tag,
            toolchain: realized,
            extras,
        } = self.resolve_tag(executable, records).await?;

        let autogen_name = profile
            .autogen_name
            .ok_or_else(|| PipelineError::StageFailed {
                flavor: Some(self.flavor),
                stage: Stage::BuildImages,
                source: self.missing("introspection image"),
            })?;
        let work_dir = self
            .ctx
            .config
            .flavor_work_dir(&self.ctx.source_root, self.flavor);
        let builder = &self.ctx.adapters.builder;

        let mut toolchain_request =
            BuildRequest::new(ImageReference::new(profile.deploy_name, tag.clone()))
                .with_env(definition.env.clone())
                .with_labels(
                    self.ctx
                        .labels
                        .clone()
                        .with_title(profile.deploy_name)
                        .to_map(),
                );
        for layer in closure_layers(&realized, &[]) {
            toolchain_request = toolchain_request.with_layer(layer);
        }

        let (toolchain, autogen) = self
            .stage(Stage::BuildImages, records, async {
                let toolchain = builder
                    .build(toolchain_request, work_dir.join("toolchain"))
                    .await?;

                let mut autogen_request =
                    BuildRequest::new(ImageReference::new(autogen_name, tag.clone()))
                        .with_base(BaseSource::Oci {
                            layout: toolchain.layout.clone(),
                            tag: tag.to_string(),
                        })
                        .with_labels(
                            self.ctx
                                .labels
                                .clone()
                                .with_title(autogen_name)
                                .with_description("Toolchain introspection image")
                                .to_map(),
                        );
                if let Some(extras) = &extras {
                    for layer in closure_layers(extras, &realized.closure) {
                        autogen_request = autogen_request.with_layer(layer);
                    }
                }
                let autogen = builder
                    .build(autogen_request, work_dir.join("autogen"))
                    .await?;
                Ok::<_, ProvisionError>((toolchain, autogen))
            })
            .await?;

        Ok(PreparedToolchain::Autogen {
            tag,
            realized,
            toolchain,
            autogen,
        })
    }

    async fn pull_base(
        &self,
        records: &mut Vec<StageRecord>,
    ) -> Result<PreparedToolchain, PipelineError> {
        let base = self
            .ctx
            .config
            .flavors
            .legacy
            .base
            .as_ref()
            .ok_or_else(|| PipelineError::StageFailed {
                flavor: Some(self.flavor),
                stage: Stage::Pull,
                source: self.missing("pinned base image"),
            })?;
        let request = PullRequest::from(base);
        let reference = ImageReference::new(self.profile().deploy_name, ImageTag::latest());
        let dest = self
            .ctx
            .config
            .flavor_work_dir(&self.ctx.source_root, self.flavor)
            .join("base");

        let pulled = self
            .stage(Stage::Pull, records, async {
                self.ctx
                    .adapters
                    .puller
                    .pull(&request, &reference, &dest)
                    .await
            })
            .await?;
        info!(
            flavor = %self.flavor,
            source = %request.source(),
            tls_verify = request.tls_verify,
            "pulled pinned base"
        );
        Ok(PreparedToolchain::Pulled(pulled))
    }

    /// Load the introspection image, run the generator against it and turn
    /// its output into a verified platform config.
    pub async fn generate_config(
        &self,
        autogen: &BuiltImage,
        records: &mut Vec<StageRecord>,
    ) -> Result<(GeneratedPlatformConfig, RewriteReport), PipelineError> {
        let profile = self.profile();
        let config = &self.ctx.config;
        let root = &self.ctx.source_root;
        let adapters = &self.ctx.adapters;

        let (output_config_path, kind, autogen_name) = match (
            config.output_config_path(self.flavor),
            profile.config_kind,
            profile.autogen_name,
        ) {
            (Some(path), Some(kind), Some(name)) => (path, kind, name),
            _ => {
                return Err(PipelineError::StageFailed {
                    flavor: Some(self.flavor),
                    stage: Stage::Generate,
                    source: self.missing("generated config"),
                })
            }
        };
        let output_dir = root.join(&output_config_path);

        let container = autogen.image.reference.clone();
        self.stage(Stage::Load, records, async {
            adapters.loader.load(autogen, &container).await
        })
        .await?;

        let request = GenerateRequest {
            flavor: self.flavor,
            kind,
            toolchain_container: container,
            source_root: root.clone(),
            output_config_path,
        };
        self.stage(Stage::Generate, records, async {
            if output_dir.exists() {
                debug!(dir = %output_dir.display(), "clearing previous output");
                tokio::fs::remove_dir_all(&output_dir).await?;
            }
            adapters.generator.generate(&request).await?;
            Ok::<_, ProvisionError>(())
        })
        .await?;

        let report = self
            .stage(Stage::Rewrite, records, async {
                let dir = output_dir.clone();
                let from = autogen_name.to_string();
                let to = profile.deploy_name.to_string();
                let report = tokio::task::spawn_blocking(move || rewrite(&dir, &from, &to))
                    .await
                    .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))??;
                Ok::<_, ProvisionError>(report)
            })
            .await?;
        info!(
            flavor = %self.flavor,
            files = report.files_changed.len(),
            replacements = report.replacements,
            "rewrote generated config"
        );

        let generated = self
            .stage(Stage::Verify, records, async {
                Ok::<_, ProvisionError>(GeneratedPlatformConfig::finalize(
                    self.flavor,
                    &output_dir,
                    autogen_name,
                    &config.generator.env_file,
                )?)
            })
            .await?;

        Ok((generated, report))
    }
}
