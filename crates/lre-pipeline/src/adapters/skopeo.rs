//! Registry and daemon transfers through `skopeo copy`.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use lre_core::{
    CommandRunner, CommandSpec, ContentAddressedImage, ImageReference, LayerDescriptor,
    ProvisionError, Result,
};
use lre_oci::schema::normalize_layer_media_type;
use lre_oci::{dir_manifest_digest, BaseImage, BaseSource, BuiltImage, OciError};
use tracing::info;

use super::{ImageLoader, ImagePuller, PullRequest, PulledImage};

#[derive(Clone)]
pub struct Skopeo {
    runner: Arc<dyn CommandRunner>,
    binary: String,
    timeout_secs: u64,
}

impl Skopeo {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            binary: "skopeo".to_string(),
            timeout_secs: 0,
        }
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    fn copy(&self) -> CommandSpec {
        CommandSpec::new(&self.binary)
            .arg("copy")
            .timeout_secs(self.timeout_secs)
    }

    async fn run(&self, spec: CommandSpec) -> Result<()> {
        let output = self.runner.run(&spec).await?;
        if !output.success() {
            return Err(ProvisionError::Image(format!(
                "`{spec}` exited with code {}: {}",
                output.exit_code,
                output.stderr.trim()
            )));
        }
        Ok(())
    }
}

fn oci_ref(image: &BuiltImage) -> String {
    format!("oci:{}:{}", image.layout.display(), image.image.tag())
}

#[async_trait]
impl ImagePuller for Skopeo {
    async fn pull(
        &self,
        request: &PullRequest,
        reference: &ImageReference,
        dest: &Path,
    ) -> Result<PulledImage> {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let spec = self
            .copy()
            .arg("--preserve-digests")
            .arg(format!("--src-tls-verify={}", request.tls_verify))
            .args(["--override-arch", &request.platform.architecture])
            .args(["--override-os", &request.platform.os])
            .arg(format!("docker://{}", request.source()))
            .arg(format!("dir:{}", dest.display()));
        self.run(spec).await?;

        let actual = dir_manifest_digest(dest)?;
        if actual != request.digest {
            return Err(OciError::DigestMismatch {
                expected: request.digest,
                actual,
            }
            .into());
        }

        let base = BaseImage::load(&BaseSource::Dir(dest.to_path_buf()))?;
        let mut layers = Vec::with_capacity(base.manifest.layers.len());
        for (descriptor, diff_id) in base.manifest.layers.iter().zip(&base.config.rootfs.diff_ids) {
            let media_type = normalize_layer_media_type(&descriptor.media_type)
                .ok_or_else(|| OciError::UnsupportedMediaType(descriptor.media_type.clone()))?;
            layers.push(LayerDescriptor {
                media_type: media_type.to_string(),
                digest: descriptor.digest,
                diff_id: *diff_id,
                size: descriptor.size,
            });
        }

        info!(image = %reference, digest = %actual, layers = layers.len(), "pulled pinned image");
        Ok(PulledImage {
            dir: dest.to_path_buf(),
            image: ContentAddressedImage {
                reference: reference.clone(),
                digest: actual,
                layers,
            },
        })
    }
}

#[async_trait]
impl ImageLoader for Skopeo {
    async fn load(&self, image: &BuiltImage, reference: &ImageReference) -> Result<()> {
        let spec = self
            .copy()
            .arg(oci_ref(image))
            .arg(format!("docker-daemon:{reference}"));
        self.run(spec).await?;
        info!(image = %reference, digest = %image.image.digest, "loaded into daemon");
        Ok(())
    }

    async fn push(&self, image: &BuiltImage, destination: &str, tls_verify: bool) -> Result<()> {
        let spec = self
            .copy()
            .arg(format!("--dest-tls-verify={tls_verify}"))
            .arg(oci_ref(image))
            .arg(format!("docker://{destination}"));
        self.run(spec).await?;
        info!(destination, digest = %image.image.digest, "pushed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lre_core::fakes::{Rule, ScriptedRunner};
    use lre_core::{Digest, ImageTag, Platform};
    use std::path::PathBuf;

    fn built(layout: &str) -> BuiltImage {
        BuiltImage {
            layout: PathBuf::from(layout),
            image: ContentAddressedImage {
                reference: ImageReference::new("rbe-autogen-lre-cc", ImageTag::new("t1").unwrap()),
                digest: Digest::compute(b"manifest"),
                layers: vec![],
            },
        }
    }

    #[tokio::test]
    async fn test_load_copies_layout_into_daemon() {
        let runner = Arc::new(ScriptedRunner::new());
        let skopeo = Skopeo::new(runner.clone());
        let image = built("/work/.lre/cc/autogen");
        skopeo.load(&image, &image.image.reference).await.unwrap();

        let call = &runner.calls_to("skopeo")[0];
        assert_eq!(
            call.args,
            vec![
                "copy",
                "oci:/work/.lre/cc/autogen:t1",
                "docker-daemon:rbe-autogen-lre-cc:t1"
            ]
        );
    }

    #[tokio::test]
    async fn test_push_sets_tls_flag() {
        let runner = Arc::new(ScriptedRunner::new());
        let skopeo = Skopeo::new(runner.clone());
        skopeo
            .push(&built("/l"), "localhost:5001/lre-worker-cc:t1", false)
            .await
            .unwrap();
        let call = &runner.calls()[0];
        assert!(call.args.contains(&"--dest-tls-verify=false".to_string()));
        assert_eq!(
            call.args.last().unwrap(),
            "docker://localhost:5001/lre-worker-cc:t1"
        );
    }

    #[tokio::test]
    async fn test_failed_copy_is_image_error() {
        let runner = Arc::new(
            ScriptedRunner::new().with_rule(Rule::new("skopeo").fail(1, "connection refused")),
        );
        let err = Skopeo::new(runner)
            .load(&built("/l"), &built("/l").image.reference)
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::Image(ref m) if m.contains("connection refused")));
    }

    #[tokio::test]
    async fn test_pull_digest_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("legacy");
        let runner = Arc::new(ScriptedRunner::new().with_rule(Rule::new("skopeo").hook(
            |spec| {
                let target = spec.args.last().unwrap().trim_start_matches("dir:").to_string();
                std::fs::create_dir_all(&target)?;
                std::fs::write(PathBuf::from(target).join("manifest.json"), b"{}")
            },
        )));
        let request = PullRequest {
            name: "rbe-ubuntu16-04".to_string(),
            digest: Digest::compute(b"something else"),
            registry: "localhost:5001".to_string(),
            tls_verify: false,
            platform: Platform::default(),
        };
        let err = Skopeo::new(runner)
            .pull(
                &request,
                &ImageReference::new("legacy", ImageTag::latest()),
                &dest,
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("digest mismatch"));
    }
}
