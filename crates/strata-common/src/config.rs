//! Store configuration model.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::constants::{DEFAULT_ROOT, DRIVER_DIR, IMAGE_DB_DIR, LAYER_DB_DIR};
use crate::error::{Result, StrataError};

/// Options used to open the layer and image stores.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreOptions {
    /// Base directory for all Strata state.
    pub root: PathBuf,
    /// Directory holding layer metadata. Defaults to `<root>/layerdb`.
    pub metadata_dir: Option<PathBuf>,
    /// Directory holding image configs. Defaults to `<root>/imagedb`.
    pub image_dir: Option<PathBuf>,
    /// Graph driver to use. `None` picks a prior or default driver.
    pub graph_driver: Option<String>,
    /// Driver-specific `key=value` options.
    pub graph_driver_options: Vec<String>,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self::with_root(DEFAULT_ROOT)
    }
}

impl StoreOptions {
    /// Creates options rooted at the given directory.
    #[must_use]
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            metadata_dir: None,
            image_dir: None,
            graph_driver: None,
            graph_driver_options: Vec::new(),
        }
    }

    /// Loads options from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| StrataError::io(path, e))?;
        let options: Self = serde_json::from_str(&content)?;
        if options.root.as_os_str().is_empty() {
            return Err(StrataError::Config {
                message: format!("{}: root must not be empty", path.display()),
            });
        }
        Ok(options)
    }

    /// Returns the layer metadata directory.
    #[must_use]
    pub fn metadata_dir(&self) -> PathBuf {
        self.metadata_dir
            .clone()
            .unwrap_or_else(|| self.root.join(LAYER_DB_DIR))
    }

    /// Returns the image config directory.
    #[must_use]
    pub fn image_dir(&self) -> PathBuf {
        self.image_dir
            .clone()
            .unwrap_or_else(|| self.root.join(IMAGE_DB_DIR))
    }

    /// Returns the directory under which graph drivers keep their data.
    #[must_use]
    pub fn driver_root(&self) -> PathBuf {
        self.root.join(DRIVER_DIR)
    }
}
