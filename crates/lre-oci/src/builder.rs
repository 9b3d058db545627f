//! Image assembly: base layers, new layers, config and manifest.
//!
//! Building only writes into the target layout directory. Nothing reaches a
//! daemon or registry until the image is explicitly loaded or pushed. Each
//! build replaces whatever layout was there, so a layout holds exactly one
//! image and no blobs from earlier runs.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use lre_core::{ContentAddressedImage, ImageReference, LayerDescriptor, Platform};
use tracing::{debug, info};

use crate::error::OciError;
use crate::layer::{build_layer, LayerSource};
use crate::layout::{BaseImage, BaseSource, OciLayout};
use crate::schema::{
    normalize_layer_media_type, ContainerConfig, Descriptor, HistoryEntry, ImageConfig,
    ImageManifest, RootFs, MEDIA_TYPE_CONFIG, MEDIA_TYPE_MANIFEST,
};
use crate::Result;

/// What to build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildRequest {
    /// Name and tag recorded in the layout.
    pub reference: ImageReference,
    pub base: Option<BaseSource>,
    /// One entry per layer, appended after the base layers.
    pub layers: Vec<Vec<LayerSource>>,
    /// Merged over the base's labels.
    pub labels: BTreeMap<String, String>,
    /// Replaces the base entrypoint and clears its cmd.
    pub entrypoint: Option<Vec<String>>,
    /// Merged over the base's environment.
    pub env: BTreeMap<String, String>,
    /// Used only without a base; a base keeps its own platform.
    pub platform: Platform,
}

impl BuildRequest {
    pub fn new(reference: ImageReference) -> Self {
        Self {
            reference,
            base: None,
            layers: Vec::new(),
            labels: BTreeMap::new(),
            entrypoint: None,
            env: BTreeMap::new(),
            platform: Platform::default(),
        }
    }

    pub fn with_base(mut self, base: BaseSource) -> Self {
        self.base = Some(base);
        self
    }

    pub fn with_layer(mut self, sources: Vec<LayerSource>) -> Self {
        self.layers.push(sources);
        self
    }

    pub fn with_labels(mut self, labels: BTreeMap<String, String>) -> Self {
        self.labels.extend(labels);
        self
    }

    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env.extend(env);
        self
    }

    pub fn with_entrypoint(mut self, entrypoint: Vec<String>) -> Self {
        self.entrypoint = Some(entrypoint);
        self
    }
}

/// An image written to a local layout, not yet visible to any daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltImage {
    pub layout: PathBuf,
    pub image: ContentAddressedImage,
}

/// Writes images into OCI layouts.
#[derive(Debug, Clone, Default)]
pub struct OciImageBuilder;

impl OciImageBuilder {
    pub fn new() -> Self {
        Self
    }

    pub fn build(&self, request: &BuildRequest, layout_dir: &Path) -> Result<BuiltImage> {
        if layout_dir.exists() {
            debug!(layout = %layout_dir.display(), "replacing previous layout");
            fs::remove_dir_all(layout_dir).map_err(OciError::io(layout_dir))?;
        }
        let layout = OciLayout::create(layout_dir)?;

        let (mut config, mut layers) = match &request.base {
            Some(source) => import_base(&layout, source)?,
            None => (
                ImageConfig {
                    architecture: request.platform.architecture.clone(),
                    os: request.platform.os.clone(),
                    ..ImageConfig::default()
                },
                Vec::new(),
            ),
        };

        for (n, sources) in request.layers.iter().enumerate() {
            if sources.is_empty() {
                continue;
            }
            let layer = build_layer(sources, layout.blobs())?;
            config.rootfs.diff_ids.push(layer.diff_id);
            config.history.push(HistoryEntry {
                created_by: Some(format!("lre-oci layer {n}")),
                empty_layer: None,
            });
            layers.push(layer);
        }

        apply_runtime_config(&mut config.config, request);

        let config_descriptor = layout.put_json(MEDIA_TYPE_CONFIG, &config)?;
        let manifest = ImageManifest {
            schema_version: 2,
            media_type: Some(MEDIA_TYPE_MANIFEST.to_string()),
            config: config_descriptor,
            layers: layers
                .iter()
                .map(|l| Descriptor {
                    media_type: l.media_type.clone(),
                    digest: l.digest,
                    size: l.size,
                    annotations: None,
                })
                .collect(),
            annotations: None,
        };
        let manifest_descriptor = layout.put_json(MEDIA_TYPE_MANIFEST, &manifest)?;
        layout.tag(request.reference.tag.as_str(), &manifest_descriptor)?;

        info!(
            image = %request.reference,
            digest = %manifest_descriptor.digest,
            layers = layers.len(),
            layout = %layout_dir.display(),
            "built image"
        );

        Ok(BuiltImage {
            layout: layout_dir.to_path_buf(),
            image: ContentAddressedImage {
                reference: request.reference.clone(),
                digest: manifest_descriptor.digest,
                layers,
            },
        })
    }
}

/// Copy the base's layer blobs into `layout` and return its config and layers.
fn import_base(
    layout: &OciLayout,
    source: &BaseSource,
) -> Result<(ImageConfig, Vec<LayerDescriptor>)> {
    let base = BaseImage::load(source)?;
    if base.config.rootfs.diff_ids.len() != base.manifest.layers.len() {
        return Err(OciError::InvalidLayout {
            path: base
                .layer_paths
                .first()
                .cloned()
                .unwrap_or_else(|| PathBuf::from("base")),
            reason: format!(
                "{} layers but {} diff ids",
                base.manifest.layers.len(),
                base.config.rootfs.diff_ids.len()
            ),
        });
    }

    let mut layers = Vec::with_capacity(base.manifest.layers.len());
    for ((descriptor, path), diff_id) in base
        .manifest
        .layers
        .iter()
        .zip(&base.layer_paths)
        .zip(&base.config.rootfs.diff_ids)
    {
        let media_type = normalize_layer_media_type(&descriptor.media_type)
            .ok_or_else(|| OciError::UnsupportedMediaType(descriptor.media_type.clone()))?;
        layout.blobs().import(path, &descriptor.digest)?;
        layers.push(LayerDescriptor {
            media_type: media_type.to_string(),
            digest: descriptor.digest,
            diff_id: *diff_id,
            size: descriptor.size,
        });
    }

    let config = ImageConfig {
        architecture: base.config.architecture,
        os: base.config.os,
        config: base.config.config,
        rootfs: RootFs {
            fs_type: "layers".to_string(),
            diff_ids: base.config.rootfs.diff_ids,
        },
        history: base.config.history,
    };
    Ok((config, layers))
}

fn apply_runtime_config(config: &mut ContainerConfig, request: &BuildRequest) {
    if !request.env.is_empty() {
        let mut env = config.env_map();
        env.extend(request.env.clone());
        config.env = env.into_iter().map(|(k, v)| format!("{k}={v}")).collect();
    }
    if !request.labels.is_empty() {
        config
            .labels
            .get_or_insert_with(BTreeMap::new)
            .extend(request.labels.clone());
    }
    if let Some(entrypoint) = &request.entrypoint {
        config.entrypoint = Some(entrypoint.clone());
        config.cmd = None;
    }
}
