//! Filesystem-backed metadata store.
//!
//! Layout under the store root:
//!
//! ```text
//! sha256/<hex>/{diff,size,cache-id,parent,descriptor.json,tar-split.json.gz}
//! mounts/<name>/{mount-id,init-id,parent}
//! tmp/write-set-<random>/
//! ```
//!
//! A layer transaction stages its files in `tmp/` and is renamed into
//! `sha256/<hex>` on commit.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use strata_common::constants::DIGEST_ALGORITHM;
use strata_common::error::{Result, StrataError};
use strata_common::types::{ChainId, DiffId, Digest, random_id};

use super::{Descriptor, MetadataStore, MetadataTransaction, TarSplitSink};

const DIFF_FILE: &str = "diff";
const SIZE_FILE: &str = "size";
const CACHE_ID_FILE: &str = "cache-id";
const PARENT_FILE: &str = "parent";
const DESCRIPTOR_FILE: &str = "descriptor.json";
const TAR_SPLIT_FILE: &str = "tar-split.json.gz";
const MOUNT_ID_FILE: &str = "mount-id";
const INIT_ID_FILE: &str = "init-id";
const MOUNTS_DIR: &str = "mounts";
const TMP_DIR: &str = "tmp";

/// Metadata store keeping one directory per layer and per mount.
#[derive(Debug, Clone)]
pub struct FsMetadataStore {
    root: PathBuf,
}

impl FsMetadataStore {
    /// Opens the store at `root`, creating it if needed.
    ///
    /// Transactions left behind by an interrupted process are discarded.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory structure cannot be created.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        for dir in [DIGEST_ALGORITHM, MOUNTS_DIR] {
            let path = root.join(dir);
            fs::create_dir_all(&path).map_err(|e| StrataError::io(&path, e))?;
        }
        let tmp = root.join(TMP_DIR);
        match fs::remove_dir_all(&tmp) {
            Ok(()) => tracing::debug!(path = %tmp.display(), "discarded stale transactions"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(StrataError::io(&tmp, e)),
        }
        fs::create_dir_all(&tmp).map_err(|e| StrataError::io(&tmp, e))?;
        Ok(Self { root })
    }

    /// Returns the store root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn layer_dir(&self, layer: &ChainId) -> PathBuf {
        let digest = layer.digest();
        self.root.join(digest.algorithm()).join(digest.hex())
    }

    fn mount_dir(&self, name: &str) -> Result<PathBuf> {
        if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\']) {
            return Err(StrataError::Config {
                message: format!("invalid mount name: {name:?}"),
            });
        }
        Ok(self.root.join(MOUNTS_DIR).join(name))
    }

    fn set_mount_value(&self, name: &str, file: &str, value: &str) -> Result<()> {
        let dir = self.mount_dir(name)?;
        fs::create_dir_all(&dir).map_err(|e| StrataError::io(&dir, e))?;
        write_atomic(&dir, file, value.as_bytes())
    }
}

impl MetadataStore for FsMetadataStore {
    fn start_transaction(&self) -> Result<Box<dyn MetadataTransaction>> {
        let dir = self
            .root
            .join(TMP_DIR)
            .join(format!("write-set-{}", random_id()));
        fs::create_dir(&dir).map_err(|e| StrataError::io(&dir, e))?;
        Ok(Box::new(FsTransaction {
            store_root: self.root.clone(),
            dir: Some(dir),
        }))
    }

    fn get_size(&self, layer: &ChainId) -> Result<u64> {
        let path = self.layer_dir(layer).join(SIZE_FILE);
        let value = read_value(&path)?;
        value.parse().map_err(|_| StrataError::Config {
            message: format!("{}: invalid size {value:?}", path.display()),
        })
    }

    fn get_parent(&self, layer: &ChainId) -> Result<Option<ChainId>> {
        read_optional(&self.layer_dir(layer).join(PARENT_FILE))?
            .map(|value| ChainId::parse(&value))
            .transpose()
    }

    fn get_diff_id(&self, layer: &ChainId) -> Result<DiffId> {
        DiffId::parse(&read_value(&self.layer_dir(layer).join(DIFF_FILE))?)
    }

    fn get_cache_id(&self, layer: &ChainId) -> Result<String> {
        let path = self.layer_dir(layer).join(CACHE_ID_FILE);
        let value = read_value(&path)?;
        if value.is_empty() {
            return Err(StrataError::Config {
                message: format!("{}: empty cache id", path.display()),
            });
        }
        Ok(value)
    }

    fn get_descriptor(&self, layer: &ChainId) -> Result<Option<Descriptor>> {
        let path = self.layer_dir(layer).join(DESCRIPTOR_FILE);
        match fs::read(&path) {
            Ok(data) => Ok(Some(serde_json::from_slice(&data)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StrataError::io(path, e)),
        }
    }

    fn tar_split_reader(&self, layer: &ChainId) -> Result<Box<dyn Read + Send>> {
        let path = self.layer_dir(layer).join(TAR_SPLIT_FILE);
        let file = File::open(&path).map_err(|e| StrataError::io(&path, e))?;
        Ok(Box::new(GzDecoder::new(file)))
    }

    fn set_mount_id(&self, name: &str, mount_id: &str) -> Result<()> {
        self.set_mount_value(name, MOUNT_ID_FILE, mount_id)
    }

    fn set_init_id(&self, name: &str, init_id: &str) -> Result<()> {
        self.set_mount_value(name, INIT_ID_FILE, init_id)
    }

    fn set_mount_parent(&self, name: &str, parent: &ChainId) -> Result<()> {
        self.set_mount_value(name, PARENT_FILE, parent.as_str())
    }

    fn get_mount_id(&self, name: &str) -> Result<String> {
        read_value(&self.mount_dir(name)?.join(MOUNT_ID_FILE))
    }

    fn get_init_id(&self, name: &str) -> Result<Option<String>> {
        read_optional(&self.mount_dir(name)?.join(INIT_ID_FILE))
    }

    fn get_mount_parent(&self, name: &str) -> Result<Option<ChainId>> {
        read_optional(&self.mount_dir(name)?.join(PARENT_FILE))?
            .map(|value| ChainId::parse(&value))
            .transpose()
    }

    fn list(&self) -> Result<(Vec<ChainId>, Vec<String>)> {
        let mut layers = Vec::new();
        for name in list_dirs(&self.root.join(DIGEST_ALGORITHM))? {
            match Digest::from_hex(&name) {
                Ok(digest) => layers.push(ChainId::new(digest)),
                Err(_) => tracing::debug!(entry = %name, "ignoring unexpected layer directory"),
            }
        }
        let mounts = list_dirs(&self.root.join(MOUNTS_DIR))?;
        Ok((layers, mounts))
    }

    fn remove(&self, layer: &ChainId) -> Result<()> {
        remove_dir(&self.layer_dir(layer))
    }

    fn remove_mount(&self, name: &str) -> Result<()> {
        remove_dir(&self.mount_dir(name)?)
    }
}

/// A staged layer directory under `tmp/`.
#[derive(Debug)]
struct FsTransaction {
    store_root: PathBuf,
    dir: Option<PathBuf>,
}

impl FsTransaction {
    fn staging(&self) -> Result<&Path> {
        self.dir.as_deref().ok_or_else(|| StrataError::Config {
            message: "metadata transaction already finished".into(),
        })
    }

    fn write(&self, file: &str, data: &[u8]) -> Result<()> {
        let path = self.staging()?.join(file);
        fs::write(&path, data).map_err(|e| StrataError::io(path, e))
    }
}

impl MetadataTransaction for FsTransaction {
    fn set_size(&mut self, size: u64) -> Result<()> {
        self.write(SIZE_FILE, size.to_string().as_bytes())
    }

    fn set_parent(&mut self, parent: &ChainId) -> Result<()> {
        self.write(PARENT_FILE, parent.as_str().as_bytes())
    }

    fn set_diff_id(&mut self, diff_id: &DiffId) -> Result<()> {
        self.write(DIFF_FILE, diff_id.as_str().as_bytes())
    }

    fn set_cache_id(&mut self, cache_id: &str) -> Result<()> {
        self.write(CACHE_ID_FILE, cache_id.as_bytes())
    }

    fn set_descriptor(&mut self, descriptor: &Descriptor) -> Result<()> {
        self.write(DESCRIPTOR_FILE, &serde_json::to_vec(descriptor)?)
    }

    fn tar_split_writer(&mut self) -> Result<Box<dyn TarSplitSink>> {
        let path = self.staging()?.join(TAR_SPLIT_FILE);
        let file = File::create(&path).map_err(|e| StrataError::io(&path, e))?;
        Ok(Box::new(GzipSink {
            encoder: GzEncoder::new(file, Compression::default()),
            path,
        }))
    }

    fn commit(mut self: Box<Self>, chain_id: &ChainId) -> Result<()> {
        let staging = self.staging()?.to_path_buf();
        let digest = chain_id.digest();
        let target = self.store_root.join(digest.algorithm()).join(digest.hex());
        if target.exists() {
            tracing::warn!(chain_id = %chain_id, "replacing stale layer metadata");
            remove_dir(&target)?;
        }
        fs::rename(&staging, &target).map_err(|e| StrataError::io(&target, e))?;
        self.dir = None;
        Ok(())
    }

    fn cancel(mut self: Box<Self>) -> Result<()> {
        match self.dir.take() {
            Some(dir) => remove_dir(&dir),
            None => Ok(()),
        }
    }
}

impl Drop for FsTransaction {
    fn drop(&mut self) {
        if let Some(dir) = self.dir.take() {
            if let Err(e) = remove_dir(&dir) {
                tracing::warn!(path = %dir.display(), error = %e, "failed to discard metadata transaction");
            }
        }
    }
}

/// Gzip-compressed tar-split index file.
struct GzipSink {
    encoder: GzEncoder<File>,
    path: PathBuf,
}

impl Write for GzipSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.encoder.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.encoder.flush()
    }
}

impl TarSplitSink for GzipSink {
    fn finish(self: Box<Self>) -> Result<()> {
        let Self { encoder, path } = *self;
        let file = encoder.finish().map_err(|e| StrataError::io(&path, e))?;
        file.sync_all().map_err(|e| StrataError::io(&path, e))
    }
}

fn read_value(path: &Path) -> Result<String> {
    fs::read_to_string(path)
        .map(|s| s.trim().to_string())
        .map_err(|e| StrataError::io(path, e))
}

fn read_optional(path: &Path) -> Result<Option<String>> {
    match read_value(path) {
        Ok(value) if value.is_empty() => Ok(None),
        Ok(value) => Ok(Some(value)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

fn write_atomic(dir: &Path, file: &str, data: &[u8]) -> Result<()> {
    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| StrataError::io(dir, e))?;
    tmp.write_all(data)
        .map_err(|e| StrataError::io(tmp.path(), e))?;
    let target = dir.join(file);
    let _ = tmp
        .persist(&target)
        .map_err(|e| StrataError::io(&target, e.error))?;
    Ok(())
}

fn list_dirs(dir: &Path) -> Result<Vec<String>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(StrataError::io(dir, e)),
    };
    let mut names = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| StrataError::io(dir, e))?;
        let is_dir = entry
            .file_type()
            .map_err(|e| StrataError::io(entry.path(), e))?
            .is_dir();
        if is_dir {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    names.sort();
    Ok(names)
}

fn remove_dir(dir: &Path) -> Result<()> {
    match fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StrataError::io(dir, e)),
    }
}
