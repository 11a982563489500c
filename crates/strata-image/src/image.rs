//! Image configuration model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use strata_common::error::{Result, StrataError};
use strata_common::types::ImageId;

use crate::rootfs::RootFs;

/// One step of an image's build history.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct History {
    /// When the step ran.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
    /// Command that produced the step.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub created_by: String,
    /// Free-form note.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub comment: String,
    /// Whether the step left the filesystem unchanged.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub empty_layer: bool,
}

/// A parsed image config.
///
/// Fields this store does not interpret are kept in `extra` untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Image {
    /// Layers making up the root filesystem.
    pub rootfs: RootFs,
    /// Build history, oldest first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<History>,
    /// Creation time of the image.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
    /// Remaining config fields.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
    #[serde(skip)]
    id: Option<ImageId>,
    #[serde(skip)]
    parent: Option<ImageId>,
}

impl Image {
    /// Parses a config.
    ///
    /// # Errors
    ///
    /// Returns a serialization error for malformed JSON.
    pub fn from_json(config: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(config)?)
    }

    /// Number of history entries that produced a layer.
    pub fn non_empty_layers(&self) -> usize {
        self.history.iter().filter(|h| !h.empty_layer).count()
    }

    /// Rejects configs whose history describes more layers than the root
    /// filesystem lists.
    ///
    /// # Errors
    ///
    /// Returns `TooManyLayers` on a mismatch.
    pub fn validate(&self) -> Result<()> {
        let history = self.non_empty_layers();
        let diff_ids = self.rootfs.diff_ids.len();
        if history > diff_ids {
            return Err(StrataError::TooManyLayers { history, diff_ids });
        }
        Ok(())
    }

    /// Id the image was loaded under, if it came from a store.
    pub const fn id(&self) -> Option<&ImageId> {
        self.id.as_ref()
    }

    /// Parent image recorded in the store, if any.
    pub const fn parent(&self) -> Option<&ImageId> {
        self.parent.as_ref()
    }

    pub(crate) fn with_identity(mut self, id: ImageId, parent: Option<ImageId>) -> Self {
        self.id = Some(id);
        self.parent = parent;
        self
    }
}
