//! Read-only layers and their handles.

use std::collections::HashMap;
use std::fmt;
use std::io::Read;
use std::sync::Arc;

use strata_common::error::{Result, StrataError};
use strata_common::types::{ChainId, DiffId};
use strata_graphdriver::Driver;

use crate::metadata::{Descriptor, MetadataStore};
use crate::tarsplit::Assembler;
use crate::verify::VerifiedReader;

/// Immutable description of one registered layer.
///
/// Shared between the store's arena, child layers, mounts, and handles.
/// Reference counts live in the store, never here.
#[derive(Debug)]
pub struct RoLayer {
    pub(crate) chain_id: ChainId,
    pub(crate) diff_id: DiffId,
    pub(crate) parent: Option<Arc<RoLayer>>,
    pub(crate) cache_id: String,
    pub(crate) size: u64,
    pub(crate) descriptor: Option<Descriptor>,
}

impl RoLayer {
    /// Chain id of the stack ending at this layer.
    pub const fn chain_id(&self) -> &ChainId {
        &self.chain_id
    }

    /// Diff id of this layer's own tar stream.
    pub const fn diff_id(&self) -> &DiffId {
        &self.diff_id
    }

    /// Parent layer, if any.
    pub fn parent(&self) -> Option<&Self> {
        self.parent.as_deref()
    }

    /// Graph driver id of this layer.
    pub fn cache_id(&self) -> &str {
        &self.cache_id
    }

    /// Size of this layer's own diff.
    pub const fn diff_size(&self) -> u64 {
        self.size
    }

    /// Size of the whole chain ending at this layer.
    pub fn size(&self) -> u64 {
        self.ancestry().map(|l| l.size).sum()
    }

    /// Number of layers in the chain ending at this layer.
    pub fn depth(&self) -> usize {
        self.ancestry().count()
    }

    /// Distribution descriptor recorded at registration, if any.
    pub const fn descriptor(&self) -> Option<&Descriptor> {
        self.descriptor.as_ref()
    }

    /// Iterates from this layer down to the base layer.
    pub fn ancestry(&self) -> impl Iterator<Item = &Self> {
        std::iter::successors(Some(self), |l| l.parent())
    }
}

/// Attributes of a layer removed from the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    /// Chain id of the removed layer.
    pub chain_id: ChainId,
    /// Diff id of the removed layer.
    pub diff_id: DiffId,
    /// Size of the whole chain ending at the removed layer.
    pub size: u64,
    /// Size of the removed layer's own diff.
    pub diff_size: u64,
}

impl Metadata {
    pub(crate) fn of(layer: &RoLayer) -> Self {
        Self {
            chain_id: layer.chain_id.clone(),
            diff_id: layer.diff_id.clone(),
            size: layer.size(),
            diff_size: layer.size,
        }
    }
}

/// One retained reference to a read-only layer.
///
/// Handles are not `Clone`: every handle stands for exactly one reference
/// and must be given back to [`crate::LayerStore::release`]. Dropping a
/// handle without releasing it leaks the reference.
pub struct Layer {
    pub(crate) layer: Arc<RoLayer>,
    pub(crate) handle: u64,
    pub(crate) driver: Arc<dyn Driver>,
    pub(crate) metadata: Arc<dyn MetadataStore>,
}

impl Layer {
    /// Chain id of the referenced layer.
    pub fn chain_id(&self) -> &ChainId {
        self.layer.chain_id()
    }

    /// Diff id of the referenced layer.
    pub fn diff_id(&self) -> &DiffId {
        self.layer.diff_id()
    }

    /// Parent layer, if any.
    pub fn parent(&self) -> Option<&RoLayer> {
        self.layer.parent()
    }

    /// Size of the whole chain.
    pub fn size(&self) -> u64 {
        self.layer.size()
    }

    /// Size of this layer's own diff.
    pub fn diff_size(&self) -> u64 {
        self.layer.diff_size()
    }

    /// Distribution descriptor, if any.
    pub fn descriptor(&self) -> Option<&Descriptor> {
        self.layer.descriptor()
    }

    /// Shared description of the referenced layer.
    pub const fn info(&self) -> &Arc<RoLayer> {
        &self.layer
    }

    /// Low-level driver metadata of the layer.
    ///
    /// # Errors
    ///
    /// Returns a backend error if the driver cannot describe the layer.
    pub fn metadata(&self) -> Result<HashMap<String, String>> {
        self.driver
            .metadata(self.layer.cache_id())
            .map_err(|e| StrataError::backend("driver metadata", e))
    }

    /// Returns the layer's tar stream, verified against its diff id.
    ///
    /// When a tar-split index was recorded the original bytes are
    /// reassembled; otherwise the driver's diff is used. A stream that does
    /// not hash to the diff id fails with `InvalidData` at its end.
    ///
    /// # Errors
    ///
    /// Returns a backend error if the stream cannot be opened.
    pub fn tar_stream(&self) -> Result<Box<dyn Read + Send>> {
        let inner: Box<dyn Read + Send> = match self.metadata.tar_split_reader(self.chain_id()) {
            Ok(index) => Box::new(Assembler::new(
                Arc::clone(&self.driver),
                self.layer.cache_id(),
                index,
            )?),
            Err(e) if e.is_not_found() => self
                .driver
                .diff(
                    self.layer.cache_id(),
                    self.layer.parent().map(RoLayer::cache_id),
                )
                .map_err(|e| StrataError::backend("driver diff", e))?,
            Err(e) => return Err(StrataError::backend("tar-split read", e)),
        };
        Ok(Box::new(VerifiedReader::new(inner, self.diff_id().clone())))
    }

    /// Returns the driver diff between this layer and one of its ancestors.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if `ancestor` is not below this layer, or a
    /// backend error if the driver diff fails.
    pub fn tar_stream_from(&self, ancestor: &ChainId) -> Result<Box<dyn Read + Send>> {
        let base = self
            .layer
            .ancestry()
            .skip(1)
            .find(|l| l.chain_id() == ancestor)
            .ok_or_else(|| StrataError::NotFound {
                kind: "ancestor layer",
                id: ancestor.to_string(),
            })?;
        self.driver
            .diff(self.layer.cache_id(), Some(base.cache_id()))
            .map_err(|e| StrataError::backend("driver diff", e))
    }
}

impl fmt::Debug for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Layer")
            .field("chain_id", self.chain_id())
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_common::types::Digest;

    fn layer(byte: u8, size: u64, parent: Option<Arc<RoLayer>>) -> Arc<RoLayer> {
        Arc::new(RoLayer {
            chain_id: ChainId::new(Digest::from_bytes(&[byte])),
            diff_id: DiffId::new(Digest::from_bytes(&[byte, byte])),
            parent,
            cache_id: format!("cache-{byte}"),
            size,
            descriptor: None,
        })
    }

    #[test]
    fn size_and_depth_cover_the_whole_chain() {
        let base = layer(1, 10, None);
        let mid = layer(2, 20, Some(Arc::clone(&base)));
        let top = layer(3, 5, Some(Arc::clone(&mid)));

        assert_eq!(top.size(), 35);
        assert_eq!(top.diff_size(), 5);
        assert_eq!(top.depth(), 3);
        assert_eq!(base.depth(), 1);
        let chain: Vec<&str> = top.ancestry().map(RoLayer::cache_id).collect();
        assert_eq!(chain, vec!["cache-3", "cache-2", "cache-1"]);
    }

    #[test]
    fn metadata_snapshot_reports_both_sizes() {
        let base = layer(1, 10, None);
        let top = layer(2, 7, Some(base));
        let meta = Metadata::of(&top);
        assert_eq!(meta.size, 17);
        assert_eq!(meta.diff_size, 7);
        assert_eq!(&meta.chain_id, top.chain_id());
    }
}
