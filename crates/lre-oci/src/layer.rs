//! Deterministic layer archives.
//!
//! Entries are written in sorted path order with mtime 0, uid/gid 0, empty
//! owner names and normalised modes (0755 for directories and executables,
//! 0644 otherwise), then gzip-compressed with a zero header timestamp.
//! Identical trees give byte-identical blobs.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use flate2::{Compression, GzBuilder};
use lre_core::{HashingWriter, LayerDescriptor};
use tracing::debug;
use walkdir::WalkDir;

use crate::error::OciError;
use crate::schema::MEDIA_TYPE_LAYER_GZIP;
use crate::store::BlobStore;
use crate::Result;

/// Content placed into a layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayerSource {
    /// Copy the tree under `src` to `dest` inside the image. With
    /// `dereference`, symlinks are replaced by what they point to.
    Tree {
        src: PathBuf,
        dest: String,
        dereference: bool,
    },
    /// Place one file at `dest` with the given mode.
    File { src: PathBuf, dest: String, mode: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Entry {
    Dir,
    File { src: PathBuf, mode: u32 },
    Symlink { target: PathBuf },
}

fn image_path(dest: &str) -> String {
    dest.trim_matches('/').to_string()
}

fn join(base: &str, rel: &Path) -> String {
    let rel = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/");
    match (base.is_empty(), rel.is_empty()) {
        (true, _) => rel,
        (false, true) => base.to_string(),
        (false, false) => format!("{base}/{rel}"),
    }
}

fn add_parents(entries: &mut BTreeMap<String, Entry>, path: &str) {
    let mut prefix = String::new();
    let mut parts = path.split('/').peekable();
    while let Some(part) = parts.next() {
        if parts.peek().is_none() {
            break;
        }
        if !prefix.is_empty() {
            prefix.push('/');
        }
        prefix.push_str(part);
        entries.entry(prefix.clone()).or_insert(Entry::Dir);
    }
}

#[cfg(unix)]
fn normalized_mode(metadata: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    if metadata.permissions().mode() & 0o111 != 0 {
        0o755
    } else {
        0o644
    }
}

#[cfg(not(unix))]
fn normalized_mode(_metadata: &std::fs::Metadata) -> u32 {
    0o644
}

fn collect(sources: &[LayerSource]) -> Result<BTreeMap<String, Entry>> {
    let mut entries = BTreeMap::new();
    for source in sources {
        match source {
            LayerSource::File { src, dest, mode } => {
                if !src.is_file() {
                    return Err(OciError::MissingSource(src.clone()));
                }
                let path = image_path(dest);
                add_parents(&mut entries, &path);
                entries.insert(
                    path,
                    Entry::File {
                        src: src.clone(),
                        mode: *mode,
                    },
                );
            }
            LayerSource::Tree {
                src,
                dest,
                dereference,
            } => {
                if !src.exists() {
                    return Err(OciError::MissingSource(src.clone()));
                }
                let base = image_path(dest);
                for entry in WalkDir::new(src).follow_links(*dereference).sort_by_file_name() {
                    let entry = entry.map_err(|e| OciError::Io {
                        path: e.path().unwrap_or(src).to_path_buf(),
                        source: e.into(),
                    })?;
                    let rel = entry.path().strip_prefix(src).unwrap_or(entry.path());
                    let path = join(&base, rel);
                    if path.is_empty() {
                        continue;
                    }
                    let file_type = entry.file_type();
                    let item = if file_type.is_dir() {
                        Entry::Dir
                    } else if file_type.is_symlink() {
                        let target = std::fs::read_link(entry.path())
                            .map_err(OciError::io(entry.path()))?;
                        Entry::Symlink { target }
                    } else {
                        let metadata = entry.metadata().map_err(|e| OciError::Io {
                            path: entry.path().to_path_buf(),
                            source: e.into(),
                        })?;
                        Entry::File {
                            src: entry.path().to_path_buf(),
                            mode: normalized_mode(&metadata),
                        }
                    };
                    add_parents(&mut entries, &path);
                    entries.insert(path, item);
                }
            }
        }
    }
    Ok(entries)
}

fn header(entry_type: tar::EntryType, mode: u32, size: u64) -> tar::Header {
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(entry_type);
    header.set_mode(mode);
    header.set_size(size);
    header.set_mtime(0);
    header.set_uid(0);
    header.set_gid(0);
    header
}

fn write_entries<W: Write>(builder: &mut tar::Builder<W>, entries: &BTreeMap<String, Entry>) -> Result<()> {
    for (path, entry) in entries {
        match entry {
            Entry::Dir => {
                let mut h = header(tar::EntryType::Directory, 0o755, 0);
                builder
                    .append_data(&mut h, format!("{path}/"), io::empty())
                    .map_err(OciError::io(path))?;
            }
            Entry::File { src, mode } => {
                let file = File::open(src).map_err(OciError::io(src))?;
                let size = file.metadata().map_err(OciError::io(src))?.len();
                let mut h = header(tar::EntryType::Regular, *mode, size);
                builder
                    .append_data(&mut h, path, file)
                    .map_err(OciError::io(src))?;
            }
            Entry::Symlink { target } => {
                let mut h = header(tar::EntryType::Symlink, 0o777, 0);
                builder
                    .append_link(&mut h, path, target)
                    .map_err(OciError::io(path))?;
            }
        }
    }
    Ok(())
}

/// Archive `sources` into one gzip layer blob in `blobs`.
pub fn build_layer(sources: &[LayerSource], blobs: &BlobStore) -> Result<LayerDescriptor> {
    let entries = collect(sources)?;
    let mut diff_id = None;

    let (digest, size) = blobs.put_streamed(|blob| {
        let gz = GzBuilder::new().mtime(0).write(blob, Compression::default());
        let mut builder = tar::Builder::new(HashingWriter::new(gz));
        builder.mode(tar::HeaderMode::Deterministic);
        write_entries(&mut builder, &entries)?;

        let tar_writer = builder.into_inner().map_err(OciError::io("layer.tar"))?;
        let (gz, tar_digest, _) = tar_writer.finish();
        gz.finish().map_err(OciError::io("layer.tar.gz"))?;
        diff_id = Some(tar_digest);
        Ok(())
    })?;

    let diff_id = diff_id.ok_or_else(|| OciError::InvalidLayout {
        path: PathBuf::from("layer"),
        reason: "layer archive was not finalised".to_string(),
    })?;
    debug!(entries = entries.len(), digest = %digest.short(), diff_id = %diff_id.short(), "built layer");

    Ok(LayerDescriptor {
        media_type: MEDIA_TYPE_LAYER_GZIP.to_string(),
        digest,
        diff_id,
        size,
    })
}
