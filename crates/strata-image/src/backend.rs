//! Persistence for image configs and their per-image metadata.
//!
//! On-disk layout under the image root:
//!
//! ```text
//! content/sha256/<hex>          config bytes, named by their digest
//! metadata/sha256/<hex>/<key>   small values attached to an image
//! ```

use std::io::{self, Write};
use std::path::{Path, PathBuf};

use strata_common::constants::DIGEST_ALGORITHM;
use strata_common::error::{Result, StrataError};
use strata_common::types::Digest;

const CONTENT_DIR: &str = "content";
const METADATA_DIR: &str = "metadata";

/// Storage contract of the image store.
pub trait StoreBackend: Send + Sync {
    /// Digests of every stored config.
    ///
    /// # Errors
    ///
    /// Returns an error if the content directory cannot be read.
    fn walk(&self) -> Result<Vec<Digest>>;

    /// Reads a config and checks it against its digest.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if absent or `HashMismatch` if corrupted.
    fn get(&self, digest: &Digest) -> Result<Vec<u8>>;

    /// Stores a config under its digest.
    ///
    /// # Errors
    ///
    /// Returns an error for empty input or a failed write.
    fn set(&self, data: &[u8]) -> Result<Digest>;

    /// Removes a config and all of its metadata.
    ///
    /// # Errors
    ///
    /// Returns an error if the files cannot be removed.
    fn delete(&self, digest: &Digest) -> Result<()>;

    /// Attaches a metadata value to a stored config.
    ///
    /// # Errors
    ///
    /// Returns an error if the config does not exist or the write fails.
    fn set_metadata(&self, digest: &Digest, key: &str, data: &[u8]) -> Result<()>;

    /// Reads a metadata value.
    ///
    /// # Errors
    ///
    /// Returns an error if the config or the value does not exist.
    fn get_metadata(&self, digest: &Digest, key: &str) -> Result<Vec<u8>>;

    /// Removes a metadata value. Removing an absent value succeeds.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be removed.
    fn delete_metadata(&self, digest: &Digest, key: &str) -> Result<()>;
}

/// Filesystem [`StoreBackend`].
#[derive(Debug)]
pub struct FsBackend {
    root: PathBuf,
}

impl FsBackend {
    /// Opens the backend at `root`, creating its directories.
    ///
    /// # Errors
    ///
    /// Returns an error if the directories cannot be created.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        for dir in [CONTENT_DIR, METADATA_DIR] {
            let path = root.join(dir).join(DIGEST_ALGORITHM);
            std::fs::create_dir_all(&path).map_err(|e| StrataError::io(&path, e))?;
        }
        tracing::debug!(root = %root.display(), "image backend opened");
        Ok(Self { root })
    }

    fn content_file(&self, digest: &Digest) -> PathBuf {
        self.root
            .join(CONTENT_DIR)
            .join(digest.algorithm())
            .join(digest.hex())
    }

    fn metadata_dir(&self, digest: &Digest) -> PathBuf {
        self.root
            .join(METADATA_DIR)
            .join(digest.algorithm())
            .join(digest.hex())
    }

    fn metadata_file(&self, digest: &Digest, key: &str) -> Result<PathBuf> {
        if key.is_empty() || key.contains(['/', '\\']) || key == "." || key == ".." {
            return Err(StrataError::Config {
                message: format!("invalid metadata key: {key:?}"),
            });
        }
        Ok(self.metadata_dir(digest).join(key))
    }
}

impl StoreBackend for FsBackend {
    fn walk(&self) -> Result<Vec<Digest>> {
        let dir = self.root.join(CONTENT_DIR).join(DIGEST_ALGORITHM);
        let entries = std::fs::read_dir(&dir).map_err(|e| StrataError::io(&dir, e))?;
        let mut digests = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StrataError::io(&dir, e))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            match Digest::from_hex(&name) {
                Ok(digest) => digests.push(digest),
                Err(e) => tracing::debug!(name = %name, error = %e, "skipping invalid digest"),
            }
        }
        digests.sort();
        Ok(digests)
    }

    fn get(&self, digest: &Digest) -> Result<Vec<u8>> {
        let path = self.content_file(digest);
        let content = std::fs::read(&path).map_err(|e| StrataError::io(&path, e))?;
        let actual = Digest::from_bytes(&content);
        if &actual != digest {
            return Err(StrataError::HashMismatch {
                resource: path.display().to_string(),
                expected: digest.to_string(),
                actual: actual.to_string(),
            });
        }
        Ok(content)
    }

    fn set(&self, data: &[u8]) -> Result<Digest> {
        if data.is_empty() {
            return Err(StrataError::Config {
                message: "image config is empty".into(),
            });
        }
        let digest = Digest::from_bytes(data);
        atomic_write(&self.content_file(&digest), data)?;
        Ok(digest)
    }

    fn delete(&self, digest: &Digest) -> Result<()> {
        let dir = self.metadata_dir(digest);
        match std::fs::remove_dir_all(&dir) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => {
                return Err(StrataError::io(&dir, e));
            }
            _ => {}
        }
        let file = self.content_file(digest);
        std::fs::remove_file(&file).map_err(|e| StrataError::io(&file, e))
    }

    fn set_metadata(&self, digest: &Digest, key: &str, data: &[u8]) -> Result<()> {
        let _ = self.get(digest)?;
        let file = self.metadata_file(digest, key)?;
        let dir = self.metadata_dir(digest);
        std::fs::create_dir_all(&dir).map_err(|e| StrataError::io(&dir, e))?;
        atomic_write(&file, data)
    }

    fn get_metadata(&self, digest: &Digest, key: &str) -> Result<Vec<u8>> {
        let _ = self.get(digest)?;
        let file = self.metadata_file(digest, key)?;
        std::fs::read(&file).map_err(|e| StrataError::io(&file, e))
    }

    fn delete_metadata(&self, digest: &Digest, key: &str) -> Result<()> {
        let file = self.metadata_file(digest, key)?;
        match std::fs::remove_file(&file) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(StrataError::io(&file, e)),
            _ => Ok(()),
        }
    }
}

/// Writes `data` to a temporary file next to `path` and renames it over
/// `path`, so readers see either the old or the new contents.
fn atomic_write(path: &Path, data: &[u8]) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| StrataError::io(dir, e))?;
    tmp.write_all(data).map_err(|e| StrataError::io(tmp.path(), e))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| StrataError::io(tmp.path(), e))?;
    let _ = tmp
        .persist(path)
        .map_err(|e| StrataError::io(path, e.error))?;
    Ok(())
}
