//! Autogen container orchestrator.
//!
//! Builds the main executable once, then runs every enabled flavor through
//! its [`FlavorPipeline`]. Flavors run one after another unless the config
//! asks for concurrency, in which case they share a [`JoinSet`] and the first
//! failure aborts the rest.

use std::path::PathBuf;
use std::time::Instant;

use chrono::{DateTime, Utc};
use lre_core::{ImageTag, ToolchainFlavor, VERSION};
use lre_nix::{BuildInputs, Executable};
use serde::Serialize;
use tokio::task::JoinSet;
use tracing::{info, warn};
use uuid::Uuid;

use crate::composer::{ComposeSummary, WorkerComposer};
use crate::context::PipelineContext;
use crate::error::PipelineError;
use crate::flavor_pipeline::{FlavorOutcome, FlavorPipeline, PreparedToolchain};
use crate::stage::{run_stage, Stage, StageRecord};

/// Result of a complete `generate` run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub version: String,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub source_root: PathBuf,
    pub executable: Executable,
    /// Shared stages, run once for all flavors.
    pub stages: Vec<StageRecord>,
    /// In pipeline order.
    pub flavors: Vec<FlavorOutcome>,
}

/// Result of composing one worker image.
#[derive(Debug, Clone, Serialize)]
pub struct ComposeReport {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub executable: Executable,
    pub summary: ComposeSummary,
    pub stages: Vec<StageRecord>,
}

/// What to do with a composed worker image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Publish {
    /// Leave it in its layout.
    None,
    /// Load it into the local daemon.
    Load,
    /// Push it to `<registry>/<worker name>:<tag>`.
    Push { registry: String, tls_verify: bool },
}

/// Fail when two flavors would write into overlapping output trees.
pub fn check_disjoint(outputs: &[(ToolchainFlavor, PathBuf)]) -> Result<(), PipelineError> {
    for (i, (first, a)) in outputs.iter().enumerate() {
        for (second, b) in &outputs[i + 1..] {
            if a.starts_with(b) || b.starts_with(a) {
                return Err(PipelineError::OverlappingOutputs {
                    first: *first,
                    second: *second,
                    path: if a.starts_with(b) { a.clone() } else { b.clone() },
                });
            }
        }
    }
    Ok(())
}

pub struct Orchestrator {
    ctx: PipelineContext,
}

impl Orchestrator {
    pub fn new(ctx: PipelineContext) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &PipelineContext {
        &self.ctx
    }

    fn require_enabled(&self, flavor: ToolchainFlavor) -> Result<(), PipelineError> {
        if self.ctx.config.is_enabled(flavor) {
            Ok(())
        } else {
            Err(PipelineError::FlavorDisabled(flavor))
        }
    }

    /// Output and scratch directories of every enabled flavor must be disjoint.
    pub fn check_outputs(&self) -> Result<(), PipelineError> {
        let root = &self.ctx.source_root;
        let flavors = self.ctx.config.enabled_flavors();

        let outputs: Vec<_> = flavors
            .iter()
            .filter_map(|f| self.ctx.config.output_dir(root, *f).map(|dir| (*f, dir)))
            .collect();
        check_disjoint(&outputs)?;

        let work_dirs: Vec<_> = flavors
            .iter()
            .map(|f| (*f, self.ctx.config.flavor_work_dir(root, *f)))
            .collect();
        check_disjoint(&work_dirs)
    }

    /// Dependency closure first, then the full build.
    pub async fn build_executable(
        &self,
        records: &mut Vec<StageRecord>,
    ) -> Result<Executable, PipelineError> {
        let graph = &self.ctx.adapters.graph;
        let root = &self.ctx.source_root;
        let executable_config = &self.ctx.config.executable;

        run_stage(None, Stage::BuildExecutable, records, async {
            let inputs = BuildInputs::new(root, executable_config)
                .map_err(lre_core::ProvisionError::from)?;
            info!(
                flake = %inputs.flake.short(),
                source = ?inputs.flake.source,
                "build inputs"
            );
            let deps = graph.build_deps_only(&inputs).await?;
            graph.build_full(&inputs, &deps).await
        })
        .await
    }

    /// Toolchain-generation entry point: produce a verified platform config
    /// for every enabled autogen flavor.
    pub async fn generate(&self) -> Result<RunReport, PipelineError> {
        let run_id = Uuid::new_v4().to_string();
        let started_at = Utc::now();
        let start = Instant::now();
        let flavors = self.ctx.config.enabled_flavors();
        info!(
            run_id = %run_id,
            root = %self.ctx.source_root.display(),
            flavors = ?flavors,
            parallel = self.ctx.config.parallel,
            "starting generate run"
        );

        self.check_outputs()?;

        let mut stages = Vec::new();
        let executable = self.build_executable(&mut stages).await?;

        let mut outcomes = if self.ctx.config.parallel {
            self.run_concurrent(&flavors, &executable).await?
        } else {
            self.run_sequential(&flavors, &executable).await?
        };
        outcomes.sort_by_key(|o| o.flavor);

        let duration_ms = start.elapsed().as_millis() as u64;
        info!(run_id = %run_id, duration_ms, flavors = outcomes.len(), "generate run finished");
        Ok(RunReport {
            run_id,
            version: VERSION.to_string(),
            started_at,
            duration_ms,
            source_root: self.ctx.source_root.clone(),
            executable,
            stages,
            flavors: outcomes,
        })
    }

    async fn run_sequential(
        &self,
        flavors: &[ToolchainFlavor],
        executable: &Executable,
    ) -> Result<Vec<FlavorOutcome>, PipelineError> {
        let mut outcomes = Vec::with_capacity(flavors.len());
        for flavor in flavors {
            let pipeline = FlavorPipeline::new(self.ctx.clone(), *flavor);
            outcomes.push(pipeline.run(executable).await?);
        }
        Ok(outcomes)
    }

    async fn run_concurrent(
        &self,
        flavors: &[ToolchainFlavor],
        executable: &Executable,
    ) -> Result<Vec<FlavorOutcome>, PipelineError> {
        let mut set = JoinSet::new();
        for flavor in flavors {
            let pipeline = FlavorPipeline::new(self.ctx.clone(), *flavor);
            let executable = executable.clone();
            set.spawn(async move { pipeline.run(&executable).await });
        }

        let mut outcomes = Vec::with_capacity(flavors.len());
        while let Some(joined) = set.join_next().await {
            let failure = match joined {
                Ok(Ok(outcome)) => {
                    outcomes.push(outcome);
                    continue;
                }
                Ok(Err(e)) => e,
                Err(e) => PipelineError::Task(e.to_string()),
            };

            if !set.is_empty() {
                warn!(in_flight = set.len(), error = %failure, "aborting remaining flavors");
            }
            set.abort_all();
            while set.join_next().await.is_some() {}
            return Err(failure);
        }
        Ok(outcomes)
    }

    /// The tag a flavor's images would carry for the current sources.
    pub async fn resolve_tag(&self, flavor: ToolchainFlavor) -> Result<ImageTag, PipelineError> {
        self.require_enabled(flavor)?;
        let mut records = Vec::new();
        let executable = self.build_executable(&mut records).await?;

        if !flavor.has_autogen() {
            let base = self
                .ctx
                .config
                .flavors
                .legacy
                .base
                .as_ref()
                .map(|b| b.digest)
                .ok_or(PipelineError::FlavorDisabled(flavor))?;
            return run_stage(Some(flavor), Stage::ResolveTag, &mut records, async {
                lre_core::ContentTag::derive_from_base(&base, &executable.digest)
            })
            .await;
        }

        let resolved = FlavorPipeline::new(self.ctx.clone(), flavor)
            .resolve_tag(&executable, &mut records)
            .await?;
        Ok(resolved.tag)
    }

    /// Build the executable and the flavor's worker image, then publish it.
    pub async fn compose(
        &self,
        flavor: ToolchainFlavor,
        publish: Publish,
    ) -> Result<ComposeReport, PipelineError> {
        self.require_enabled(flavor)?;
        let run_id = Uuid::new_v4().to_string();
        let started_at = Utc::now();
        let start = Instant::now();
        info!(run_id = %run_id, flavor = %flavor, ?publish, "starting compose run");

        let mut stages = Vec::new();
        let executable = self.build_executable(&mut stages).await?;

        let pipeline = FlavorPipeline::new(self.ctx.clone(), flavor);
        let toolchain: PreparedToolchain = pipeline.prepare(&executable, &mut stages).await?;

        let composer = WorkerComposer::new(&self.ctx);
        let composed = run_stage(Some(flavor), Stage::Compose, &mut stages, async {
            composer.compose(flavor, &toolchain, &executable).await
        })
        .await?;

        let reference = composed.built.image.reference.clone();
        let loader = &self.ctx.adapters.loader;
        let published_to = match &publish {
            Publish::None => None,
            Publish::Load => {
                run_stage(Some(flavor), Stage::Publish, &mut stages, async {
                    loader.load(&composed.built, &reference).await
                })
                .await?;
                Some(format!("docker-daemon:{reference}"))
            }
            Publish::Push {
                registry,
                tls_verify,
            } => {
                let destination = format!("{}/{reference}", registry.trim_end_matches('/'));
                run_stage(Some(flavor), Stage::Publish, &mut stages, async {
                    loader
                        .push(&composed.built, &destination, *tls_verify)
                        .await
                })
                .await?;
                Some(format!("docker://{destination}"))
            }
        };

        Ok(ComposeReport {
            run_id,
            started_at,
            duration_ms: start.elapsed().as_millis() as u64,
            summary: ComposeSummary {
                reference: reference.to_string(),
                pinned: composed.worker.image.pinned(),
                worker: composed.worker,
                published_to,
            },
            executable,
            stages,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disjoint_outputs_accepted() {
        let outputs = vec![
            (
                ToolchainFlavor::NativeCompiler,
                PathBuf::from("/src/lre/generated-cc"),
            ),
            (
                ToolchainFlavor::ManagedRuntime,
                PathBuf::from("/src/lre/generated-java"),
            ),
        ];
        assert!(check_disjoint(&outputs).is_ok());
    }

    #[test]
    fn test_nested_outputs_rejected() {
        let outputs = vec![
            (ToolchainFlavor::NativeCompiler, PathBuf::from("/src/lre")),
            (
                ToolchainFlavor::ManagedRuntime,
                PathBuf::from("/src/lre/generated-java"),
            ),
        ];
        let err = check_disjoint(&outputs).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::OverlappingOutputs {
                first: ToolchainFlavor::NativeCompiler,
                second: ToolchainFlavor::ManagedRuntime,
                ..
            }
        ));
    }

    #[test]
    fn test_generated_cc_is_not_a_prefix_of_generated_cc_extra() {
        // Component-wise comparison, not string prefixes.
        let outputs = vec![
            (ToolchainFlavor::NativeCompiler, PathBuf::from("/a/generated-cc")),
            (
                ToolchainFlavor::ManagedRuntime,
                PathBuf::from("/a/generated-cc-extra"),
            ),
        ];
        assert!(check_disjoint(&outputs).is_ok());
    }
}
