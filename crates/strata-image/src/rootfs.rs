//! The root filesystem section of an image config.

use serde::{Deserialize, Serialize};
use strata_common::types::{ChainId, DiffId};
use strata_layer::create_chain_id;

/// `type` of a root filesystem made of stacked layers.
pub const TYPE_LAYERS: &str = "layers";

/// Ordered diff ids of an image's layers, base first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootFs {
    /// Filesystem type, normally [`TYPE_LAYERS`].
    #[serde(rename = "type")]
    pub kind: String,
    /// Diff ids from the base layer up.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub diff_ids: Vec<DiffId>,
}

impl RootFs {
    /// An empty layered root filesystem.
    pub fn new() -> Self {
        Self {
            kind: TYPE_LAYERS.to_string(),
            diff_ids: Vec::new(),
        }
    }

    /// Adds a layer on top.
    pub fn append(&mut self, diff_id: DiffId) {
        self.diff_ids.push(diff_id);
    }

    /// Chain id of the top layer, or `None` for an empty root filesystem.
    pub fn chain_id(&self) -> Option<ChainId> {
        create_chain_id(&self.diff_ids)
    }
}

impl Default for RootFs {
    fn default() -> Self {
        Self::new()
    }
}
