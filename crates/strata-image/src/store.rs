//! The image store.
//!
//! Images are configs addressed by their own digest. Each image holds one
//! reference on the top layer of its root filesystem for as long as it is
//! stored. A parent/child index between images is kept alongside; it is
//! independent of the layer graph.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use strata_common::error::{Result, StrataError};
use strata_common::types::{ChainId, ImageId};
use strata_layer::{Layer, LayerStore, Metadata};

use crate::backend::{FsBackend, StoreBackend};
use crate::image::Image;

const PARENT_KEY: &str = "parent";

/// The slice of the layer store the image store depends on.
pub trait LayerGetReleaser: Send + Sync {
    /// Takes a reference to a layer.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown layer.
    fn get(&self, chain_id: &ChainId) -> Result<Layer>;

    /// Gives a reference back.
    ///
    /// # Errors
    ///
    /// Returns an error if the reference was not handed out by this store
    /// or a removal fails.
    fn release(&self, layer: Layer) -> Result<Vec<Metadata>>;
}

impl LayerGetReleaser for LayerStore {
    fn get(&self, chain_id: &ChainId) -> Result<Layer> {
        Self::get(self, chain_id)
    }

    fn release(&self, layer: Layer) -> Result<Vec<Metadata>> {
        Self::release(self, layer)
    }
}

struct ImageMeta {
    layer: Option<Layer>,
    children: HashSet<ImageId>,
}

/// Store of image configs.
pub struct ImageStore {
    layers: Arc<dyn LayerGetReleaser>,
    backend: Arc<dyn StoreBackend>,
    images: Mutex<HashMap<ImageId, ImageMeta>>,
}

impl ImageStore {
    /// Creates a store over `backend` and restores every stored image,
    /// retaking its layer reference.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be listed.
    pub fn new(backend: Arc<dyn StoreBackend>, layers: Arc<dyn LayerGetReleaser>) -> Result<Self> {
        let store = Self {
            layers,
            backend,
            images: Mutex::new(HashMap::new()),
        };
        store.restore()?;
        Ok(store)
    }

    /// Opens a filesystem-backed store rooted at `root`.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be created or listed.
    pub fn open(root: impl Into<PathBuf>, layers: Arc<dyn LayerGetReleaser>) -> Result<Self> {
        Self::new(Arc::new(FsBackend::new(root)?), layers)
    }

    /// Stores an image config and returns its id.
    ///
    /// Creating an image that already exists returns its id unchanged.
    ///
    /// # Errors
    ///
    /// Returns a serialization error for malformed JSON, `TooManyLayers`
    /// if the history lists more layers than the root filesystem, or
    /// `NotFound` if the top layer is not registered. The config stays
    /// stored in that case and is picked up on restore once its layers
    /// exist.
    pub fn create(&self, config: &[u8]) -> Result<ImageId> {
        let image = Image::from_json(config)?;
        image.validate()?;

        let digest = self.backend.set(config)?;
        let id = ImageId::from(digest);

        let mut images = self.lock_images()?;
        if images.contains_key(&id) {
            return Ok(id);
        }

        let layer = match image.rootfs.chain_id() {
            None => None,
            Some(chain_id) => Some(self.layers.get(&chain_id)?),
        };
        let _ = images.insert(
            id.clone(),
            ImageMeta {
                layer,
                children: HashSet::new(),
            },
        );
        drop(images);

        tracing::info!(image = %id, "image created");
        Ok(id)
    }

    /// Loads an image config.
    ///
    /// # Errors
    ///
    /// Returns an error if the config is missing, corrupted, or malformed.
    pub fn get(&self, id: &ImageId) -> Result<Image> {
        let config = self.backend.get(id.digest())?;
        let image = Image::from_json(&config)?;
        Ok(image.with_identity(id.clone(), self.read_parent(id)))
    }

    /// Removes an image and gives back its layer reference.
    ///
    /// Children of the image lose their parent link. Returns the layers
    /// removed as a result. A config that cannot be removed from the
    /// backend is logged and left behind; the layer reference is released
    /// regardless.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown image, or an error from the layer
    /// store.
    pub fn delete(&self, id: &ImageId) -> Result<Vec<Metadata>> {
        let mut images = self.lock_images()?;
        let meta = images.remove(id).ok_or_else(|| StrataError::NotFound {
            kind: "image",
            id: id.to_string(),
        })?;

        for child in &meta.children {
            if let Err(e) = self.backend.delete_metadata(child.digest(), PARENT_KEY) {
                tracing::warn!(image = %child, error = %e, "failed to unlink child image");
            }
        }
        if let Some(parent) = self.read_parent(id) {
            if let Some(parent_meta) = images.get_mut(&parent) {
                let _ = parent_meta.children.remove(id);
            }
        }
        drop(images);

        if let Err(e) = self.backend.delete(id.digest()) {
            tracing::warn!(image = %id, error = %e, "failed to remove image config");
        }
        tracing::info!(image = %id, "image deleted");

        match meta.layer {
            Some(layer) => self.layers.release(layer),
            None => Ok(Vec::new()),
        }
    }

    /// Resolves a full or abbreviated image id.
    ///
    /// Accepts a hex prefix, optionally with an algorithm prefix.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if nothing matches or `Ambiguous` if more than
    /// one image does.
    pub fn search(&self, term: &str) -> Result<ImageId> {
        let not_found = || StrataError::NotFound {
            kind: "image",
            id: term.to_string(),
        };
        let prefix = term.split_once(':').map_or(term, |(_, hex)| hex);
        if prefix.is_empty() || !prefix.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(not_found());
        }
        let prefix = prefix.to_ascii_lowercase();

        let images = self.lock_images()?;
        let mut matches = images.keys().filter(|id| id.digest().hex().starts_with(&prefix));
        let Some(found) = matches.next() else {
            return Err(not_found());
        };
        if matches.next().is_some() {
            return Err(StrataError::Ambiguous {
                term: term.to_string(),
            });
        }
        Ok(found.clone())
    }

    /// Records `parent` as the parent image of `id`.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if either image is unknown.
    pub fn set_parent(&self, id: &ImageId, parent: &ImageId) -> Result<()> {
        let mut images = self.lock_images()?;
        if !images.contains_key(id) {
            return Err(StrataError::NotFound {
                kind: "image",
                id: id.to_string(),
            });
        }
        if !images.contains_key(parent) {
            return Err(StrataError::NotFound {
                kind: "parent image",
                id: parent.to_string(),
            });
        }

        if let Some(old) = self.read_parent(id) {
            if let Some(old_meta) = images.get_mut(&old) {
                let _ = old_meta.children.remove(id);
            }
        }
        self.backend
            .set_metadata(id.digest(), PARENT_KEY, parent.as_str().as_bytes())?;
        if let Some(parent_meta) = images.get_mut(parent) {
            let _ = parent_meta.children.insert(id.clone());
        }
        tracing::debug!(image = %id, parent = %parent, "image parent set");
        Ok(())
    }

    /// Parent image of `id`, if one is recorded.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown image.
    pub fn get_parent(&self, id: &ImageId) -> Result<Option<ImageId>> {
        if !self.lock_images()?.contains_key(id) {
            return Err(StrataError::NotFound {
                kind: "image",
                id: id.to_string(),
            });
        }
        Ok(self.read_parent(id))
    }

    /// Images whose parent is `id`, sorted.
    ///
    /// # Errors
    ///
    /// Returns an error if the image map lock is poisoned.
    pub fn children(&self, id: &ImageId) -> Result<Vec<ImageId>> {
        let images = self.lock_images()?;
        let mut children: Vec<ImageId> = images
            .get(id)
            .map(|meta| meta.children.iter().cloned().collect())
            .unwrap_or_default();
        children.sort();
        Ok(children)
    }

    /// Images without children.
    ///
    /// # Errors
    ///
    /// Returns an error if the image map lock is poisoned.
    pub fn heads(&self) -> Result<HashMap<ImageId, Image>> {
        self.images_map(false)
    }

    /// Every stored image.
    ///
    /// # Errors
    ///
    /// Returns an error if the image map lock is poisoned.
    pub fn map(&self) -> Result<HashMap<ImageId, Image>> {
        self.images_map(true)
    }

    fn images_map(&self, all: bool) -> Result<HashMap<ImageId, Image>> {
        let images = self.lock_images()?;
        let mut out = HashMap::new();
        for (id, meta) in images.iter() {
            if !all && !meta.children.is_empty() {
                continue;
            }
            match self.get(id) {
                Ok(image) => {
                    let _ = out.insert(id.clone(), image);
                }
                Err(e) => tracing::error!(image = %id, error = %e, "invalid image access"),
            }
        }
        Ok(out)
    }

    fn read_parent(&self, id: &ImageId) -> Option<ImageId> {
        let raw = self.backend.get_metadata(id.digest(), PARENT_KEY).ok()?;
        let text = String::from_utf8(raw).ok()?;
        match ImageId::parse(text.trim()) {
            Ok(parent) => Some(parent),
            Err(e) => {
                tracing::warn!(image = %id, error = %e, "ignoring invalid parent link");
                None
            }
        }
    }

    fn restore(&self) -> Result<()> {
        let mut images = self.lock_images()?;
        for digest in self.backend.walk()? {
            let id = ImageId::from(digest);
            let image = match self.get(&id) {
                Ok(image) => image,
                Err(e) => {
                    tracing::error!(image = %id, error = %e, "skipping invalid image");
                    continue;
                }
            };
            let layer = match image.rootfs.chain_id() {
                None => None,
                Some(chain_id) => match self.layers.get(&chain_id) {
                    Ok(layer) => Some(layer),
                    Err(e) => {
                        tracing::error!(
                            image = %id,
                            chain_id = %chain_id,
                            error = %e,
                            "skipping image whose layers are missing"
                        );
                        continue;
                    }
                },
            };
            let _ = images.insert(
                id,
                ImageMeta {
                    layer,
                    children: HashSet::new(),
                },
            );
        }

        let ids: Vec<ImageId> = images.keys().cloned().collect();
        for id in ids {
            if let Some(parent) = self.read_parent(&id) {
                if let Some(parent_meta) = images.get_mut(&parent) {
                    let _ = parent_meta.children.insert(id);
                }
            }
        }

        tracing::info!(images = images.len(), "image store restored");
        Ok(())
    }

    fn lock_images(&self) -> Result<MutexGuard<'_, HashMap<ImageId, ImageMeta>>> {
        self.images.lock().map_err(|_| StrataError::Config {
            message: "image map lock poisoned".into(),
        })
    }
}

impl fmt::Debug for ImageStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let images = self.images.lock().map(|m| m.len()).unwrap_or_default();
        f.debug_struct("ImageStore")
            .field("images", &images)
            .finish_non_exhaustive()
    }
}
