//! Worker images: the main executable layered onto a flavor's toolchain.

use lre_core::{ImageReference, Result, ToolchainFlavor, WorkerImage};
use lre_nix::Executable;
use lre_oci::{BuildRequest, BuiltImage, LayerSource};
use serde::Serialize;
use tracing::info;

use crate::context::PipelineContext;
use crate::flavor_pipeline::PreparedToolchain;

/// Where the executable lands inside every worker image.
pub const EXECUTABLE_DIR: &str = "/usr/local/bin";

/// A composed worker image and the layout holding it.
#[derive(Debug, Clone)]
pub struct ComposedWorker {
    pub built: BuiltImage,
    pub worker: WorkerImage,
}

/// Summary of a compose run.
#[derive(Debug, Clone, Serialize)]
pub struct ComposeSummary {
    pub worker: WorkerImage,
    pub reference: String,
    pub pinned: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub published_to: Option<String>,
}

pub struct WorkerComposer<'a> {
    ctx: &'a PipelineContext,
}

impl<'a> WorkerComposer<'a> {
    pub fn new(ctx: &'a PipelineContext) -> Self {
        Self { ctx }
    }

    /// Path of `executable` inside the image.
    pub fn executable_path(executable: &Executable) -> String {
        format!("{EXECUTABLE_DIR}/{}", executable.name)
    }

    pub fn request(
        &self,
        flavor: ToolchainFlavor,
        toolchain: &PreparedToolchain,
        executable: &Executable,
    ) -> Result<BuildRequest> {
        let profile = flavor.profile();
        let tag = toolchain.worker_tag(&executable.digest)?;
        let path = Self::executable_path(executable);

        Ok(
            BuildRequest::new(ImageReference::new(profile.worker_name, tag))
                .with_base(toolchain.base_source())
                .with_layer(vec![LayerSource::File {
                    src: executable.path.clone(),
                    dest: path.clone(),
                    mode: 0o755,
                }])
                .with_entrypoint(vec![path])
                .with_labels(
                    self.ctx
                        .labels
                        .clone()
                        .with_title(profile.worker_name)
                        .with_description(format!("Remote build execution worker ({flavor})"))
                        .to_worker_map(&executable.digest),
                ),
        )
    }

    pub async fn compose(
        &self,
        flavor: ToolchainFlavor,
        toolchain: &PreparedToolchain,
        executable: &Executable,
    ) -> Result<ComposedWorker> {
        let request = self.request(flavor, toolchain, executable)?;
        let layout_dir = self
            .ctx
            .config
            .flavor_work_dir(&self.ctx.source_root, flavor)
            .join("worker");
        let built = self.ctx.adapters.builder.build(request, layout_dir).await?;

        info!(
            flavor = %flavor,
            image = %built.image.reference,
            digest = %built.image.digest,
            executable = %executable.digest,
            "composed worker image"
        );
        Ok(ComposedWorker {
            worker: WorkerImage {
                flavor,
                image: built.image.clone(),
                executable_digest: executable.digest,
            },
            built,
        })
    }
}
