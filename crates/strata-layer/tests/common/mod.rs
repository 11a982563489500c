//! Shared fixtures for the layer store integration tests.

#![allow(dead_code, clippy::expect_used, clippy::unwrap_used)]

use std::collections::HashMap;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex};

use strata_common::error::{Result, StrataError};
use strata_graphdriver::{Capabilities, Change, CreateOpts, Driver};
use strata_layer::{FsMetadataStore, LayerStore};
use tempfile::TempDir;

/// Wraps a real driver, counting calls and injecting failures.
pub struct CountingDriver {
    inner: Arc<dyn Driver>,
    pub creates: AtomicUsize,
    pub applies: AtomicUsize,
    pub removes: AtomicUsize,
    pub fail_remove: AtomicBool,
    gate: Mutex<Option<Arc<Barrier>>>,
}

impl CountingDriver {
    pub fn new(inner: Arc<dyn Driver>) -> Self {
        Self {
            inner,
            creates: AtomicUsize::new(0),
            applies: AtomicUsize::new(0),
            removes: AtomicUsize::new(0),
            fail_remove: AtomicBool::new(false),
            gate: Mutex::new(None),
        }
    }

    /// Makes every following `apply_diff` wait on `barrier` once it is done.
    pub fn gate_applies(&self, barrier: Arc<Barrier>) {
        *self.gate.lock().unwrap() = Some(barrier);
    }

    pub fn creates(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn applies(&self) -> usize {
        self.applies.load(Ordering::SeqCst)
    }

    pub fn removes(&self) -> usize {
        self.removes.load(Ordering::SeqCst)
    }
}

impl Driver for CountingDriver {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn create(&self, id: &str, parent: Option<&str>, opts: Option<&CreateOpts>) -> Result<()> {
        let _ = self.creates.fetch_add(1, Ordering::SeqCst);
        self.inner.create(id, parent, opts)
    }

    fn create_read_write(
        &self,
        id: &str,
        parent: Option<&str>,
        opts: Option<&CreateOpts>,
    ) -> Result<()> {
        let _ = self.creates.fetch_add(1, Ordering::SeqCst);
        self.inner.create_read_write(id, parent, opts)
    }

    fn remove(&self, id: &str) -> Result<()> {
        if self.fail_remove.load(Ordering::SeqCst) {
            return Err(StrataError::Io {
                path: PathBuf::from(id),
                source: io::Error::other("injected remove failure"),
            });
        }
        let _ = self.removes.fetch_add(1, Ordering::SeqCst);
        self.inner.remove(id)
    }

    fn get(&self, id: &str, mount_label: &str) -> Result<PathBuf> {
        self.inner.get(id, mount_label)
    }

    fn put(&self, id: &str) -> Result<()> {
        self.inner.put(id)
    }

    fn exists(&self, id: &str) -> bool {
        self.inner.exists(id)
    }

    fn status(&self) -> Vec<(String, String)> {
        self.inner.status()
    }

    fn metadata(&self, id: &str) -> Result<HashMap<String, String>> {
        self.inner.metadata(id)
    }

    fn cleanup(&self) -> Result<()> {
        self.inner.cleanup()
    }

    fn diff(&self, id: &str, parent: Option<&str>) -> Result<Box<dyn Read + Send>> {
        self.inner.diff(id, parent)
    }

    fn changes(&self, id: &str, parent: Option<&str>) -> Result<Vec<Change>> {
        self.inner.changes(id, parent)
    }

    fn apply_diff(&self, id: &str, parent: Option<&str>, diff: &mut dyn Read) -> Result<u64> {
        let _ = self.applies.fetch_add(1, Ordering::SeqCst);
        let size = self.inner.apply_diff(id, parent, diff)?;
        let gate = self.gate.lock().unwrap().clone();
        if let Some(barrier) = gate {
            let _ = barrier.wait();
        }
        Ok(size)
    }

    fn diff_size(&self, id: &str, parent: Option<&str>) -> Result<u64> {
        self.inner.diff_size(id, parent)
    }

    fn capabilities(&self) -> Capabilities {
        self.inner.capabilities()
    }
}

/// A store over a scratch root, with its counting driver.
pub struct Fixture {
    pub dir: TempDir,
    pub driver: Arc<CountingDriver>,
    pub store: LayerStore,
}

impl Fixture {
    pub fn new() -> Self {
        init_tracing();
        let dir = tempfile::tempdir().expect("tempdir");
        let (driver, store) = open(dir.path());
        Self { dir, driver, store }
    }

    /// Drops the current store and opens a new one over the same root.
    pub fn reopen(self) -> Self {
        let Self { dir, store, .. } = self;
        drop(store);
        let (driver, store) = open(dir.path());
        Self { dir, driver, store }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    /// Number of physical layer directories held by the driver.
    pub fn driver_dirs(&self) -> usize {
        std::fs::read_dir(self.root().join("vfs").join("dir"))
            .expect("read driver dir")
            .count()
    }

    /// Number of committed layer metadata directories.
    pub fn metadata_layers(&self) -> usize {
        std::fs::read_dir(self.root().join("layerdb").join("sha256"))
            .expect("read metadata dir")
            .count()
    }
}

pub fn open(root: &Path) -> (Arc<CountingDriver>, LayerStore) {
    let vfs = strata_graphdriver::vfs::init(&root.join("vfs"), &[]).expect("vfs driver");
    let driver = Arc::new(CountingDriver::new(vfs));
    let as_driver: Arc<dyn Driver> = driver.clone();
    let metadata = FsMetadataStore::new(root.join("layerdb")).expect("metadata store");
    let store = LayerStore::new(Arc::new(metadata), as_driver).expect("layer store");
    (driver, store)
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Builds an uncompressed layer tar holding the given regular files.
pub fn layer_tar(files: &[(&str, &str)]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (path, data) in files {
        append_file(&mut builder, path, data);
    }
    builder.into_inner().expect("finish tar")
}

pub fn append_file(builder: &mut tar::Builder<Vec<u8>>, path: &str, data: &str) {
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Regular);
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(1_700_000_000);
    builder
        .append_data(&mut header, path, data.as_bytes())
        .expect("append file");
}

pub fn append_dir(builder: &mut tar::Builder<Vec<u8>>, path: &str) {
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Directory);
    header.set_size(0);
    header.set_mode(0o755);
    header.set_mtime(1_700_000_000);
    builder
        .append_data(&mut header, path, io::empty())
        .expect("append dir");
}

/// Entry paths of a tar stream.
pub fn entry_names(stream: impl Read) -> Vec<String> {
    let mut archive = tar::Archive::new(stream);
    archive
        .entries()
        .expect("entries")
        .map(|e| {
            let entry = e.expect("entry");
            let path = entry.path().expect("path").to_string_lossy().into_owned();
            path.trim_end_matches('/').to_string()
        })
        .collect()
}

/// Yields `limit` bytes of `data` and then fails.
pub struct AbortingReader<'a> {
    pub data: &'a [u8],
    pub limit: usize,
}

impl Read for AbortingReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.limit == 0 {
            return Err(io::Error::other("stream aborted"));
        }
        let n = buf.len().min(self.limit).min(self.data.len());
        buf[..n].copy_from_slice(&self.data[..n]);
        self.data = &self.data[n..];
        self.limit -= n;
        Ok(n)
    }
}
