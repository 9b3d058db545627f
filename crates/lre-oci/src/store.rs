//! Content-addressed blob directory of an image layout.
//!
//! Layout: `<root>/blobs/sha256/<hex>`. Writes go through a temp file in the
//! same directory and are renamed into place, so a blob path only ever
//! holds complete content.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use lre_core::{Digest, HashingWriter};
use tempfile::NamedTempFile;

use crate::error::OciError;
use crate::Result;

#[derive(Debug, Clone)]
pub struct BlobStore {
    dir: PathBuf,
}

impl BlobStore {
    /// Open the blob directory under `root`, creating it if needed.
    pub fn new(root: &Path) -> Result<Self> {
        let dir = root.join("blobs").join("sha256");
        fs::create_dir_all(&dir).map_err(OciError::io(&dir))?;
        Ok(Self { dir })
    }

    pub fn blob_path(&self, digest: &Digest) -> PathBuf {
        self.dir.join(digest.hex())
    }

    pub fn exists(&self, digest: &Digest) -> bool {
        self.blob_path(digest).is_file()
    }

    /// Store `data`, returning its digest and size.
    pub fn put(&self, data: &[u8]) -> Result<(Digest, u64)> {
        let digest = Digest::compute(data);
        let path = self.blob_path(&digest);
        if !path.exists() {
            let mut tmp = NamedTempFile::new_in(&self.dir).map_err(OciError::io(&self.dir))?;
            tmp.write_all(data).map_err(OciError::io(&path))?;
            tmp.persist(&path).map_err(|e| OciError::Io {
                path: path.clone(),
                source: e.error,
            })?;
        }
        Ok((digest, data.len() as u64))
    }

    pub fn get(&self, digest: &Digest) -> Result<Vec<u8>> {
        let path = self.blob_path(digest);
        fs::read(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                OciError::BlobMissing(*digest)
            } else {
                OciError::Io { path, source: e }
            }
        })
    }

    /// Stream a blob in: `write` receives a hashing writer over a temp file.
    pub fn put_streamed<F>(&self, write: F) -> Result<(Digest, u64)>
    where
        F: FnOnce(&mut HashingWriter<&mut NamedTempFile>) -> Result<()>,
    {
        let mut tmp = NamedTempFile::new_in(&self.dir).map_err(OciError::io(&self.dir))?;
        let mut hashing = HashingWriter::new(&mut tmp);
        write(&mut hashing)?;
        hashing.flush().map_err(OciError::io(&self.dir))?;
        let (_, digest, size) = hashing.finish();

        let path = self.blob_path(&digest);
        if path.exists() {
            return Ok((digest, size));
        }
        tmp.persist(&path).map_err(|e| OciError::Io {
            path: path.clone(),
            source: e.error,
        })?;
        Ok((digest, size))
    }

    /// Copy a blob from a file elsewhere, verifying it hashes to `digest`.
    pub fn import(&self, src: &Path, digest: &Digest) -> Result<()> {
        if self.exists(digest) {
            return Ok(());
        }
        let actual = Digest::of_file(src).map_err(OciError::io(src))?;
        if actual != *digest {
            return Err(OciError::DigestMismatch {
                expected: *digest,
                actual,
            });
        }
        let path = self.blob_path(digest);
        let tmp = NamedTempFile::new_in(&self.dir).map_err(OciError::io(&self.dir))?;
        fs::copy(src, tmp.path()).map_err(OciError::io(src))?;
        tmp.persist(&path).map_err(|e| OciError::Io {
            path,
            source: e.error,
        })?;
        Ok(())
    }
}
