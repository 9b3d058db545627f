//! OCI image layouts and base-image sources.
//!
//! An [`OciLayout`] is a directory with `oci-layout`, `index.json` and
//! `blobs/sha256/`. Tags are recorded on index entries through the
//! `org.opencontainers.image.ref.name` annotation.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use lre_core::Digest;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tempfile::NamedTempFile;

use crate::error::OciError;
use crate::schema::{
    Descriptor, ImageConfig, ImageIndex, ImageManifest, ANNOTATION_REF_NAME,
    IMAGE_LAYOUT_VERSION,
};
use crate::store::BlobStore;
use crate::Result;

const LAYOUT_FILE: &str = "oci-layout";
const INDEX_FILE: &str = "index.json";

fn write_atomic(dir: &Path, path: &Path, bytes: &[u8]) -> Result<()> {
    let mut tmp = NamedTempFile::new_in(dir).map_err(OciError::io(dir))?;
    tmp.write_all(bytes).map_err(OciError::io(path))?;
    tmp.persist(path).map_err(|e| OciError::Io {
        path: path.to_path_buf(),
        source: e.error,
    })?;
    Ok(())
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let bytes = fs::read(path).map_err(OciError::io(path))?;
    serde_json::from_slice(&bytes).map_err(OciError::json(path.display().to_string()))
}

#[derive(Debug, Clone)]
pub struct OciLayout {
    root: PathBuf,
    blobs: BlobStore,
}

impl OciLayout {
    /// Create (or reuse) a layout at `root`.
    pub fn create(root: &Path) -> Result<Self> {
        fs::create_dir_all(root).map_err(OciError::io(root))?;
        let blobs = BlobStore::new(root)?;
        let layout = Self {
            root: root.to_path_buf(),
            blobs,
        };

        let marker = root.join(LAYOUT_FILE);
        if !marker.exists() {
            let body = serde_json::json!({ "imageLayoutVersion": IMAGE_LAYOUT_VERSION });
            write_atomic(root, &marker, body.to_string().as_bytes())?;
        }
        if !root.join(INDEX_FILE).exists() {
            layout.write_index(&ImageIndex::default())?;
        }
        Ok(layout)
    }

    /// Open an existing layout.
    pub fn open(root: &Path) -> Result<Self> {
        if !root.join(LAYOUT_FILE).is_file() {
            return Err(OciError::InvalidLayout {
                path: root.to_path_buf(),
                reason: format!("no {LAYOUT_FILE} file"),
            });
        }
        Ok(Self {
            root: root.to_path_buf(),
            blobs: BlobStore::new(root)?,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn blobs(&self) -> &BlobStore {
        &self.blobs
    }

    pub fn read_index(&self) -> Result<ImageIndex> {
        read_json(&self.root.join(INDEX_FILE))
    }

    fn write_index(&self, index: &ImageIndex) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(index).map_err(OciError::json(INDEX_FILE))?;
        write_atomic(&self.root, &self.root.join(INDEX_FILE), &bytes)
    }

    /// Serialise `value` as a blob.
    pub fn put_json<T: Serialize>(&self, media_type: &str, value: &T) -> Result<Descriptor> {
        let bytes = serde_json::to_vec(value).map_err(OciError::json(media_type))?;
        let (digest, size) = self.blobs.put(&bytes)?;
        Ok(Descriptor {
            media_type: media_type.to_string(),
            digest,
            size,
            annotations: None,
        })
    }

    pub fn get_json<T: DeserializeOwned>(&self, digest: &Digest) -> Result<T> {
        let bytes = self.blobs.get(digest)?;
        serde_json::from_slice(&bytes).map_err(OciError::json(digest.to_string()))
    }

    /// Point `tag` at `manifest`, replacing any previous entry for the tag.
    pub fn tag(&self, tag: &str, manifest: &Descriptor) -> Result<()> {
        let mut index = self.read_index()?;
        index.manifests.retain(|d| d.ref_name() != Some(tag));

        let mut entry = manifest.clone();
        entry
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(ANNOTATION_REF_NAME.to_string(), tag.to_string());
        index.manifests.push(entry);
        index
            .manifests
            .sort_by(|a, b| a.ref_name().cmp(&b.ref_name()));
        self.write_index(&index)
    }

    /// Manifest descriptor for `tag`. A layout holding a single untagged
    /// manifest resolves any tag to it.
    pub fn resolve(&self, tag: &str) -> Result<Descriptor> {
        let index = self.read_index()?;
        if let Some(found) = index.manifests.iter().find(|d| d.ref_name() == Some(tag)) {
            return Ok(found.clone());
        }
        match index.manifests.as_slice() {
            [only] if only.ref_name().is_none() => Ok(only.clone()),
            _ => Err(OciError::TagNotFound {
                layout: self.root.clone(),
                tag: tag.to_string(),
            }),
        }
    }

    pub fn read_manifest(&self, descriptor: &Descriptor) -> Result<ImageManifest> {
        self.get_json(&descriptor.digest)
    }

    pub fn read_config(&self, manifest: &ImageManifest) -> Result<ImageConfig> {
        self.get_json(&manifest.config.digest)
    }
}

/// Where a base image comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BaseSource {
    /// A tag inside an OCI layout written by this crate or by skopeo.
    Oci { layout: PathBuf, tag: String },
    /// A `skopeo copy ... dir:<path>` directory, which keeps the registry's
    /// manifest bytes and therefore its digest.
    Dir(PathBuf),
}

/// A base image read from disk.
#[derive(Debug, Clone)]
pub struct BaseImage {
    pub manifest_digest: Digest,
    pub manifest: ImageManifest,
    pub config: ImageConfig,
    /// On-disk path of each layer blob, in manifest order.
    pub layer_paths: Vec<PathBuf>,
}

impl BaseImage {
    pub fn load(source: &BaseSource) -> Result<Self> {
        match source {
            BaseSource::Oci { layout, tag } => {
                let layout = OciLayout::open(layout)?;
                let descriptor = layout.resolve(tag)?;
                let manifest = layout.read_manifest(&descriptor)?;
                let config = layout.read_config(&manifest)?;
                let layer_paths = manifest
                    .layers
                    .iter()
                    .map(|l| layout.blobs().blob_path(&l.digest))
                    .collect();
                Ok(Self {
                    manifest_digest: descriptor.digest,
                    manifest,
                    config,
                    layer_paths,
                })
            }
            BaseSource::Dir(dir) => {
                let manifest_path = dir.join("manifest.json");
                let bytes = fs::read(&manifest_path).map_err(OciError::io(&manifest_path))?;
                let manifest: ImageManifest = serde_json::from_slice(&bytes)
                    .map_err(OciError::json(manifest_path.display().to_string()))?;
                let config = read_json(&dir.join(manifest.config.digest.hex()))?;
                let layer_paths = manifest
                    .layers
                    .iter()
                    .map(|l| dir.join(l.digest.hex()))
                    .collect();
                Ok(Self {
                    manifest_digest: Digest::compute(&bytes),
                    manifest,
                    config,
                    layer_paths,
                })
            }
        }
    }
}

/// Digest of the manifest in a skopeo `dir:` directory.
pub fn dir_manifest_digest(dir: &Path) -> Result<Digest> {
    let path = dir.join("manifest.json");
    Digest::of_file(&path).map_err(OciError::io(path))
}
