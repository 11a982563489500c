//! The graph driver contract.

use std::collections::HashMap;
use std::fmt;
use std::io::Read;
use std::path::PathBuf;

use strata_common::error::Result;

/// Optional arguments for creating a layer directory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CreateOpts {
    /// Security label applied when the layer is mounted.
    pub mount_label: String,
    /// Driver-specific storage options (quota, size, ...).
    pub storage_opt: HashMap<String, String>,
}

/// Static properties of a driver.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// Whether `diff` reproduces the exact tar bytes given to `apply_diff`.
    ///
    /// Drivers that do not need the layer store to keep a tar-split index
    /// so that exported layers still hash to their diff id.
    pub reproduces_exact_diffs: bool,
}

/// Kind of a single filesystem change between two layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ChangeKind {
    /// Present in both, with different content or attributes.
    Modified,
    /// Present only in the upper layer.
    Added,
    /// Present only in the lower layer.
    Deleted,
}

/// A filesystem change reported by [`Driver::changes`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Change {
    /// Path relative to the layer root.
    pub path: PathBuf,
    /// What happened at that path.
    pub kind: ChangeKind,
}

impl fmt::Display for Change {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let marker = match self.kind {
            ChangeKind::Modified => 'C',
            ChangeKind::Added => 'A',
            ChangeKind::Deleted => 'D',
        };
        write!(f, "{marker} /{}", self.path.display())
    }
}

/// A pluggable storage backend keyed by opaque cache ids.
///
/// Implementations must be safe to call from several threads at once.
/// `get`/`put` are reference counted per id: every successful `get` must
/// be matched by exactly one `put`.
pub trait Driver: Send + Sync {
    /// Short name of the driver (e.g. `vfs`).
    fn name(&self) -> &str;

    /// Creates a read-only layer `id` on top of `parent`.
    ///
    /// # Errors
    ///
    /// Returns an error if the parent is unknown or storage allocation fails.
    fn create(&self, id: &str, parent: Option<&str>, opts: Option<&CreateOpts>) -> Result<()>;

    /// Creates a writable layer `id` on top of `parent`.
    ///
    /// # Errors
    ///
    /// Returns an error if the parent is unknown or storage allocation fails.
    fn create_read_write(
        &self,
        id: &str,
        parent: Option<&str>,
        opts: Option<&CreateOpts>,
    ) -> Result<()>;

    /// Removes the storage behind `id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage cannot be released.
    fn remove(&self, id: &str) -> Result<()>;

    /// Mounts `id` and returns the path to its root.
    ///
    /// # Errors
    ///
    /// Returns an error if `id` does not exist or cannot be mounted.
    fn get(&self, id: &str, mount_label: &str) -> Result<PathBuf>;

    /// Releases one mount reference on `id`.
    ///
    /// # Errors
    ///
    /// Returns an error if `id` is not mounted.
    fn put(&self, id: &str) -> Result<()>;

    /// Returns whether storage for `id` exists.
    fn exists(&self, id: &str) -> bool;

    /// Returns human-readable status pairs.
    fn status(&self) -> Vec<(String, String)>;

    /// Returns low-level metadata about `id`.
    ///
    /// # Errors
    ///
    /// Returns an error if `id` does not exist.
    fn metadata(&self, id: &str) -> Result<HashMap<String, String>>;

    /// Releases every resource held by the driver (e.g. active mounts).
    ///
    /// # Errors
    ///
    /// Returns an error if some resource could not be released.
    fn cleanup(&self) -> Result<()>;

    /// Produces a tar stream of the changes in `id` relative to `parent`.
    ///
    /// # Errors
    ///
    /// Returns an error if either layer is missing or the diff fails.
    fn diff(&self, id: &str, parent: Option<&str>) -> Result<Box<dyn Read + Send>>;

    /// Lists the changes in `id` relative to `parent`.
    ///
    /// # Errors
    ///
    /// Returns an error if either layer is missing.
    fn changes(&self, id: &str, parent: Option<&str>) -> Result<Vec<Change>>;

    /// Extracts the tar stream `diff` into `id` and returns the number of
    /// content bytes applied.
    ///
    /// The driver may stop reading at the end-of-archive marker.
    ///
    /// # Errors
    ///
    /// Returns an error if the stream is not a valid tar archive or cannot
    /// be read to completion.
    fn apply_diff(&self, id: &str, parent: Option<&str>, diff: &mut dyn Read) -> Result<u64>;

    /// Returns the size in bytes of the changes in `id` relative to `parent`.
    ///
    /// # Errors
    ///
    /// Returns an error if either layer is missing.
    fn diff_size(&self, id: &str, parent: Option<&str>) -> Result<u64>;

    /// Returns the driver's capabilities.
    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn change_display_uses_kind_markers() {
        let added = Change {
            path: PathBuf::from("etc/hosts"),
            kind: ChangeKind::Added,
        };
        let deleted = Change {
            path: PathBuf::from("tmp"),
            kind: ChangeKind::Deleted,
        };
        assert_eq!(added.to_string(), "A /etc/hosts");
        assert_eq!(deleted.to_string(), "D /tmp");
    }

    #[test]
    fn default_capabilities_do_not_reproduce_diffs() {
        assert!(!Capabilities::default().reproduces_exact_diffs);
    }
}
