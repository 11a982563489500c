//! Read-write (container) layers.

use std::collections::HashMap;
use std::fmt;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use strata_common::error::{Result, StrataError};
use strata_common::types::ChainId;
use strata_graphdriver::{Change, Driver};

use crate::ro_layer::RoLayer;

/// Populates a freshly created init layer, given its mounted root.
pub type MountInit = Box<dyn FnOnce(&Path) -> Result<()> + Send>;

/// Options for [`crate::LayerStore::create_rw_layer`].
#[derive(Default)]
pub struct CreateRwLayerOpts {
    /// Security label used when mounting.
    pub mount_label: String,
    /// Driver-specific storage options for the writable device.
    pub storage_opt: HashMap<String, String>,
    /// Initializer for an init layer between the parent and the
    /// writable device. No init layer is created when `None`.
    pub init: Option<MountInit>,
}

impl fmt::Debug for CreateRwLayerOpts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CreateRwLayerOpts")
            .field("mount_label", &self.mount_label)
            .field("storage_opt", &self.storage_opt)
            .field("init", &self.init.is_some())
            .finish()
    }
}

/// Immutable description of a read-write layer.
#[derive(Debug)]
pub struct MountedLayer {
    pub(crate) name: String,
    pub(crate) mount_id: String,
    pub(crate) init_id: Option<String>,
    pub(crate) parent: Option<Arc<RoLayer>>,
}

impl MountedLayer {
    /// Name the layer was created under.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Graph driver id of the writable device.
    pub fn mount_id(&self) -> &str {
        &self.mount_id
    }

    /// Graph driver id of the init layer, if any.
    pub fn init_id(&self) -> Option<&str> {
        self.init_id.as_deref()
    }

    /// Read-only parent layer, if any.
    pub fn parent(&self) -> Option<&RoLayer> {
        self.parent.as_deref()
    }

    /// Driver id the writable device was created on top of.
    pub(crate) fn base_cache_id(&self) -> Option<&str> {
        self.init_id
            .as_deref()
            .or_else(|| self.parent().map(RoLayer::cache_id))
    }
}

/// One retained reference to a read-write layer.
pub struct RwLayer {
    pub(crate) mount: Arc<MountedLayer>,
    pub(crate) handle: u64,
    pub(crate) driver: Arc<dyn Driver>,
}

impl RwLayer {
    /// Name of the layer.
    pub fn name(&self) -> &str {
        self.mount.name()
    }

    /// Chain id of the read-only parent, if any.
    pub fn parent(&self) -> Option<&ChainId> {
        self.mount.parent().map(RoLayer::chain_id)
    }

    /// Shared description of the layer.
    pub const fn info(&self) -> &Arc<MountedLayer> {
        &self.mount
    }

    /// Mounts the writable device and returns its root.
    ///
    /// Mounts are reference counted by the driver; pair each call with
    /// [`RwLayer::unmount`].
    ///
    /// # Errors
    ///
    /// Returns a backend error if the driver cannot mount the device.
    pub fn mount(&self, mount_label: &str) -> Result<PathBuf> {
        self.driver
            .get(&self.mount.mount_id, mount_label)
            .map_err(|e| StrataError::backend("driver get", e))
    }

    /// Releases one mount of the writable device.
    ///
    /// # Errors
    ///
    /// Returns a backend error if the device is not mounted.
    pub fn unmount(&self) -> Result<()> {
        self.driver
            .put(&self.mount.mount_id)
            .map_err(|e| StrataError::backend("driver put", e))
    }

    /// Size of the changes made in the writable device.
    ///
    /// # Errors
    ///
    /// Returns a backend error if the driver cannot compute the size.
    pub fn size(&self) -> Result<u64> {
        self.driver
            .diff_size(&self.mount.mount_id, self.mount.base_cache_id())
            .map_err(|e| StrataError::backend("driver diff size", e))
    }

    /// Changes made in the writable device.
    ///
    /// # Errors
    ///
    /// Returns a backend error if the driver cannot compute the changes.
    pub fn changes(&self) -> Result<Vec<Change>> {
        self.driver
            .changes(&self.mount.mount_id, self.mount.base_cache_id())
            .map_err(|e| StrataError::backend("driver changes", e))
    }

    /// Tar stream of the changes made in the writable device.
    ///
    /// Files placed by the init layer never appear in it.
    ///
    /// # Errors
    ///
    /// Returns a backend error if the driver cannot produce the diff.
    pub fn tar_stream(&self) -> Result<Box<dyn Read + Send>> {
        self.driver
            .diff(&self.mount.mount_id, self.mount.base_cache_id())
            .map_err(|e| StrataError::backend("driver diff", e))
    }

    /// Low-level driver metadata of the writable device.
    ///
    /// # Errors
    ///
    /// Returns a backend error if the driver cannot describe the device.
    pub fn metadata(&self) -> Result<HashMap<String, String>> {
        self.driver
            .metadata(&self.mount.mount_id)
            .map_err(|e| StrataError::backend("driver metadata", e))
    }
}

impl fmt::Debug for RwLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RwLayer")
            .field("name", &self.mount.name)
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}
