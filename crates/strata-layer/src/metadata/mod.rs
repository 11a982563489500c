//! Persistence contract for layer and mount attributes.
//!
//! Layer attributes are written into a [`MetadataTransaction`] while the
//! layer is being applied and only become visible under their chain id when
//! the transaction commits, so an interrupted registration never leaves a
//! partially described layer behind.

pub mod fs;

use std::io::{Read, Write};

use serde::{Deserialize, Serialize};
use strata_common::error::Result;
use strata_common::types::{ChainId, DiffId, Digest};

pub use fs::FsMetadataStore;

/// Distribution descriptor recorded for a layer that was pulled from a
/// registry (media type, compressed digest and size, foreign URLs).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    /// Media type of the distributed blob.
    pub media_type: String,
    /// Digest of the distributed (usually compressed) blob.
    pub digest: Digest,
    /// Size in bytes of the distributed blob.
    pub size: u64,
    /// Alternate locations of the blob.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub urls: Vec<String>,
}

/// Destination for a layer's tar-split index.
pub trait TarSplitSink: Write + Send {
    /// Flushes and closes the index.
    ///
    /// # Errors
    ///
    /// Returns an error if the index cannot be written out.
    fn finish(self: Box<Self>) -> Result<()>;
}

/// Accumulates the attributes of one layer until commit.
///
/// Dropping a transaction without committing it discards it.
pub trait MetadataTransaction: Send {
    /// Records the size of the layer's own diff.
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be persisted.
    fn set_size(&mut self, size: u64) -> Result<()>;

    /// Records the parent chain id.
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be persisted.
    fn set_parent(&mut self, parent: &ChainId) -> Result<()>;

    /// Records the diff id.
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be persisted.
    fn set_diff_id(&mut self, diff_id: &DiffId) -> Result<()>;

    /// Records the graph driver cache id.
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be persisted.
    fn set_cache_id(&mut self, cache_id: &str) -> Result<()>;

    /// Records the distribution descriptor.
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be persisted.
    fn set_descriptor(&mut self, descriptor: &Descriptor) -> Result<()>;

    /// Opens a writer for the layer's tar-split index.
    ///
    /// # Errors
    ///
    /// Returns an error if the index file cannot be created.
    fn tar_split_writer(&mut self) -> Result<Box<dyn TarSplitSink>>;

    /// Publishes every recorded attribute under `chain_id` atomically.
    ///
    /// # Errors
    ///
    /// Returns an error if the attributes cannot be published; nothing is
    /// visible under `chain_id` in that case.
    fn commit(self: Box<Self>, chain_id: &ChainId) -> Result<()>;

    /// Discards the transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if the staged data cannot be removed.
    fn cancel(self: Box<Self>) -> Result<()>;
}

/// Read, list, and remove access to committed layer and mount attributes.
pub trait MetadataStore: Send + Sync {
    /// Starts a new layer transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if staging space cannot be allocated.
    fn start_transaction(&self) -> Result<Box<dyn MetadataTransaction>>;

    /// Returns the diff size of `layer`.
    ///
    /// # Errors
    ///
    /// Returns an error if the attribute is missing or malformed.
    fn get_size(&self, layer: &ChainId) -> Result<u64>;

    /// Returns the parent of `layer`, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the attribute cannot be read.
    fn get_parent(&self, layer: &ChainId) -> Result<Option<ChainId>>;

    /// Returns the diff id of `layer`.
    ///
    /// # Errors
    ///
    /// Returns an error if the attribute is missing or malformed.
    fn get_diff_id(&self, layer: &ChainId) -> Result<DiffId>;

    /// Returns the cache id of `layer`.
    ///
    /// # Errors
    ///
    /// Returns an error if the attribute is missing.
    fn get_cache_id(&self, layer: &ChainId) -> Result<String>;

    /// Returns the descriptor of `layer`, if one was recorded.
    ///
    /// # Errors
    ///
    /// Returns an error if the attribute cannot be read or parsed.
    fn get_descriptor(&self, layer: &ChainId) -> Result<Option<Descriptor>>;

    /// Opens the tar-split index of `layer`.
    ///
    /// # Errors
    ///
    /// Returns a not-found error if the layer has no index.
    fn tar_split_reader(&self, layer: &ChainId) -> Result<Box<dyn Read + Send>>;

    /// Records the driver id of the mount `name`.
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be persisted.
    fn set_mount_id(&self, name: &str, mount_id: &str) -> Result<()>;

    /// Records the init layer driver id of the mount `name`.
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be persisted.
    fn set_init_id(&self, name: &str, init_id: &str) -> Result<()>;

    /// Records the parent layer of the mount `name`.
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be persisted.
    fn set_mount_parent(&self, name: &str, parent: &ChainId) -> Result<()>;

    /// Returns the driver id of the mount `name`.
    ///
    /// # Errors
    ///
    /// Returns an error if the attribute is missing.
    fn get_mount_id(&self, name: &str) -> Result<String>;

    /// Returns the init layer driver id of the mount `name`, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the attribute cannot be read.
    fn get_init_id(&self, name: &str) -> Result<Option<String>>;

    /// Returns the parent layer of the mount `name`, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the attribute cannot be read.
    fn get_mount_parent(&self, name: &str) -> Result<Option<ChainId>>;

    /// Lists every committed layer and every mount name.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be enumerated.
    fn list(&self) -> Result<(Vec<ChainId>, Vec<String>)>;

    /// Removes all attributes of `layer`.
    ///
    /// # Errors
    ///
    /// Returns an error if the attributes cannot be removed.
    fn remove(&self, layer: &ChainId) -> Result<()>;

    /// Removes all attributes of the mount `name`.
    ///
    /// # Errors
    ///
    /// Returns an error if the attributes cannot be removed.
    fn remove_mount(&self, name: &str) -> Result<()>;
}
