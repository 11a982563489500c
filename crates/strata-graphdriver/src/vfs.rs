//! The `vfs` graph driver.
//!
//! Each layer is a plain directory under `<home>/dir/<id>`. Creating a layer
//! on top of a parent copies the parent's whole tree, so no union mount is
//! needed and the driver works on any filesystem. Diffs are computed by the
//! naive tree walker in [`crate::naive`].

use std::collections::HashMap;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use strata_common::error::{Result, StrataError};

use crate::driver::{Capabilities, Change, CreateOpts, Driver};
use crate::naive;

/// Name under which the driver is registered.
pub const NAME: &str = "vfs";

/// Directory-copy graph driver.
#[derive(Debug)]
pub struct VfsDriver {
    home: PathBuf,
    active: Mutex<HashMap<String, usize>>,
}

impl VfsDriver {
    /// Opens the driver rooted at `home`, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the home directory cannot be created or an
    /// unsupported option is given.
    pub fn new(home: impl Into<PathBuf>, options: &[String]) -> Result<Self> {
        if let Some(option) = options.first() {
            return Err(StrataError::Config {
                message: format!("vfs driver does not support option {option}"),
            });
        }
        let home = home.into();
        let dir = home.join("dir");
        std::fs::create_dir_all(&dir).map_err(|e| StrataError::io(&dir, e))?;
        tracing::info!(home = %home.display(), "vfs driver initialized");
        Ok(Self {
            home,
            active: Mutex::new(HashMap::new()),
        })
    }

    fn dir(&self, id: &str) -> PathBuf {
        self.home.join("dir").join(id)
    }

    fn existing_dir(&self, id: &str) -> Result<PathBuf> {
        let dir = self.dir(id);
        if dir.is_dir() {
            Ok(dir)
        } else {
            Err(StrataError::NotFound {
                kind: "vfs layer",
                id: id.to_string(),
            })
        }
    }

    fn parent_dir(&self, parent: Option<&str>) -> Result<Option<PathBuf>> {
        parent.map(|p| self.existing_dir(p)).transpose()
    }

    fn lock_active(&self) -> Result<MutexGuard<'_, HashMap<String, usize>>> {
        self.active.lock().map_err(|_| StrataError::Config {
            message: "vfs mount table lock poisoned".into(),
        })
    }
}

/// Registry entry point for the `vfs` driver.
///
/// # Errors
///
/// Returns an error if the driver cannot be initialized.
pub fn init(home: &Path, options: &[String]) -> Result<Arc<dyn Driver>> {
    Ok(Arc::new(VfsDriver::new(home, options)?))
}

impl Driver for VfsDriver {
    fn name(&self) -> &str {
        NAME
    }

    fn create(&self, id: &str, parent: Option<&str>, opts: Option<&CreateOpts>) -> Result<()> {
        self.create_read_write(id, parent, opts)
    }

    fn create_read_write(
        &self,
        id: &str,
        parent: Option<&str>,
        opts: Option<&CreateOpts>,
    ) -> Result<()> {
        if opts.is_some_and(|o| !o.storage_opt.is_empty()) {
            return Err(StrataError::Config {
                message: "storage options are not supported by the vfs driver".into(),
            });
        }
        let parent_dir = self.parent_dir(parent)?;
        let dir = self.dir(id);
        std::fs::create_dir(&dir).map_err(|e| StrataError::io(&dir, e))?;
        if let Some(parent_dir) = parent_dir {
            if let Err(e) = naive::copy_tree(&parent_dir, &dir) {
                let _ = std::fs::remove_dir_all(&dir);
                return Err(e);
            }
        }
        tracing::debug!(id, parent = parent.unwrap_or_default(), "vfs layer created");
        Ok(())
    }

    fn remove(&self, id: &str) -> Result<()> {
        let _ = self.lock_active()?.remove(id);
        let dir = self.dir(id);
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StrataError::io(dir, e)),
        }
    }

    fn get(&self, id: &str, _mount_label: &str) -> Result<PathBuf> {
        let dir = self.existing_dir(id)?;
        *self.lock_active()?.entry(id.to_string()).or_insert(0) += 1;
        Ok(dir)
    }

    fn put(&self, id: &str) -> Result<()> {
        let mut active = self.lock_active()?;
        match active.get_mut(id) {
            Some(count) if *count > 1 => {
                *count -= 1;
                Ok(())
            }
            Some(_) => {
                let _ = active.remove(id);
                Ok(())
            }
            None => Err(StrataError::NotFound {
                kind: "active mount",
                id: id.to_string(),
            }),
        }
    }

    fn exists(&self, id: &str) -> bool {
        self.dir(id).is_dir()
    }

    fn status(&self) -> Vec<(String, String)> {
        vec![("Root Dir".into(), self.home.display().to_string())]
    }

    fn metadata(&self, id: &str) -> Result<HashMap<String, String>> {
        let dir = self.existing_dir(id)?;
        Ok(HashMap::from([("Path".into(), dir.display().to_string())]))
    }

    fn cleanup(&self) -> Result<()> {
        self.lock_active()?.clear();
        Ok(())
    }

    fn diff(&self, id: &str, parent: Option<&str>) -> Result<Box<dyn Read + Send>> {
        let dir = self.existing_dir(id)?;
        let changes = self.changes(id, parent)?;
        naive::export_changes(&dir, &changes)
    }

    fn changes(&self, id: &str, parent: Option<&str>) -> Result<Vec<Change>> {
        let dir = self.existing_dir(id)?;
        let parent_dir = self.parent_dir(parent)?;
        naive::changes(&dir, parent_dir.as_deref())
    }

    fn apply_diff(&self, id: &str, _parent: Option<&str>, diff: &mut dyn Read) -> Result<u64> {
        let dir = self.existing_dir(id)?;
        naive::apply_tar(&dir, diff)
    }

    fn diff_size(&self, id: &str, parent: Option<&str>) -> Result<u64> {
        let dir = self.existing_dir(id)?;
        let changes = self.changes(id, parent)?;
        naive::changes_size(&dir, &changes)
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            reproduces_exact_diffs: false,
        }
    }
}
