//! The layer store.
//!
//! Read-only layers live in an arena keyed by chain id; read-write layers
//! live in a separate map keyed by name. Each map has its own mutex. When
//! both are needed the mount map is locked first.
//!
//! A read-only layer's reference count is the number of live [`Layer`]
//! handles plus one for every child layer and every read-write layer built
//! directly on top of it. A layer is physically removed when its count
//! reaches zero, and the removal cascades to parents whose count drops to
//! zero in turn.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::sync::{Arc, Mutex, MutexGuard};

use strata_common::config::StoreOptions;
use strata_common::constants::{INIT_LAYER_SUFFIX, MAX_LAYER_DEPTH};
use strata_common::error::{Result, StrataError};
use strata_common::types::{ChainId, DiffId, random_id};
use strata_graphdriver::{CreateOpts, Driver, DriverRegistry};

use crate::chain::compute_chain_id;
use crate::metadata::{Descriptor, FsMetadataStore, MetadataStore, MetadataTransaction};
use crate::mounted_layer::{CreateRwLayerOpts, MountInit, MountedLayer, RwLayer};
use crate::reference::{LayerHandle, Retainable};
use crate::ro_layer::{Layer, Metadata, RoLayer};
use crate::tarsplit::Disassembler;
use crate::verify::DigestReader;

struct LayerNode {
    layer: Arc<RoLayer>,
    reference_count: usize,
    handles: HashSet<u64>,
}

impl LayerNode {
    fn new(layer: Arc<RoLayer>) -> Self {
        Self {
            layer,
            reference_count: 0,
            handles: HashSet::new(),
        }
    }

    /// Takes a reference on behalf of a child layer or a mount.
    const fn hold(&mut self) {
        self.reference_count += 1;
    }
}

impl Retainable for LayerNode {
    fn id(&self) -> String {
        self.layer.chain_id().to_string()
    }

    fn handles(&mut self) -> &mut HashSet<u64> {
        &mut self.handles
    }

    fn on_change(&mut self, delta: isize) {
        self.reference_count = self.reference_count.saturating_add_signed(delta);
    }

    fn reference_count(&self) -> usize {
        self.reference_count
    }
}

struct MountNode {
    mount: Arc<MountedLayer>,
    handles: HashSet<u64>,
}

impl Retainable for MountNode {
    fn id(&self) -> String {
        self.mount.name().to_string()
    }

    fn handles(&mut self) -> &mut HashSet<u64> {
        &mut self.handles
    }

    fn on_change(&mut self, _delta: isize) {}

    fn reference_count(&self) -> usize {
        self.handles.len()
    }
}

type LayerMap = HashMap<ChainId, LayerNode>;
type MountMap = HashMap<String, MountNode>;

/// Reference-counted store of read-only and read-write layers.
pub struct LayerStore {
    metadata: Arc<dyn MetadataStore>,
    driver: Arc<dyn Driver>,
    use_tar_split: bool,
    layers: Mutex<LayerMap>,
    mounts: Mutex<MountMap>,
    orphans: Mutex<Vec<String>>,
}

impl LayerStore {
    /// Creates a store over `metadata` and `driver` and restores every
    /// layer and mount recorded in `metadata`.
    ///
    /// # Errors
    ///
    /// Returns a backend error if the metadata store cannot be listed.
    /// Individual layers or mounts that fail to load are skipped.
    pub fn new(metadata: Arc<dyn MetadataStore>, driver: Arc<dyn Driver>) -> Result<Self> {
        let use_tar_split = !driver.capabilities().reproduces_exact_diffs;
        let store = Self {
            metadata,
            driver,
            use_tar_split,
            layers: Mutex::new(HashMap::new()),
            mounts: Mutex::new(HashMap::new()),
            orphans: Mutex::new(Vec::new()),
        };
        store.restore()?;
        Ok(store)
    }

    /// Opens the driver and metadata store described by `options`.
    ///
    /// # Errors
    ///
    /// Returns an error if no driver can be opened or the metadata
    /// directory cannot be created.
    pub fn from_options(options: &StoreOptions) -> Result<Self> {
        let driver = DriverRegistry::with_builtins().open(
            options.graph_driver.as_deref(),
            &options.driver_root(),
            &options.graph_driver_options,
        )?;
        let metadata = FsMetadataStore::new(options.metadata_dir())?;
        Self::new(Arc::new(metadata), driver)
    }

    /// Registers a layer by applying `tar` on top of `parent`.
    ///
    /// # Errors
    ///
    /// See [`LayerStore::register_with_descriptor`].
    pub fn register<R: Read>(&self, tar: R, parent: Option<&ChainId>) -> Result<Layer> {
        self.register_with_descriptor(tar, parent, None)
    }

    /// Registers a layer and records its distribution descriptor.
    ///
    /// The stream is spooled and hashed before the driver is involved. If a
    /// layer with the resulting chain id already exists, a reference to it
    /// is returned and nothing is written. A layer registered concurrently
    /// with the same content wins over this one; the copy made here is then
    /// discarded.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown parent, `MaxDepthExceeded` if the
    /// chain would exceed [`MAX_LAYER_DEPTH`], or a backend error if the
    /// stream cannot be applied or persisted. Nothing is left behind on
    /// failure.
    pub fn register_with_descriptor<R: Read>(
        &self,
        tar: R,
        parent: Option<&ChainId>,
        descriptor: Option<Descriptor>,
    ) -> Result<Layer> {
        let parent = match parent {
            None => None,
            Some(id) => {
                let mut layers = self.lock_layers()?;
                let node = layers.get_mut(id).ok_or_else(|| StrataError::NotFound {
                    kind: "parent layer",
                    id: id.to_string(),
                })?;
                if node.layer.depth() >= MAX_LAYER_DEPTH {
                    return Err(StrataError::MaxDepthExceeded {
                        max: MAX_LAYER_DEPTH,
                    });
                }
                node.hold();
                Some(Arc::clone(&node.layer))
            }
        };

        let result = self.register_on(tar, parent.as_ref(), descriptor);
        if result.is_err() {
            if let Some(parent) = &parent {
                self.drop_hold_and_log(parent.chain_id());
            }
        }
        result
    }

    /// Returns a new reference to the layer `chain_id`.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the layer is unknown.
    pub fn get(&self, chain_id: &ChainId) -> Result<Layer> {
        let mut layers = self.lock_layers()?;
        let node = layers.get_mut(chain_id).ok_or_else(|| StrataError::NotFound {
            kind: "layer",
            id: chain_id.to_string(),
        })?;
        let handle = node.retain();
        let layer = Arc::clone(&node.layer);
        drop(layers);
        Ok(self.layer_handle(layer, handle))
    }

    /// Gives back a layer reference.
    ///
    /// Returns the attributes of every layer that was removed as a result,
    /// child first.
    ///
    /// # Errors
    ///
    /// Returns `NotRetained` if the handle was not handed out by this store,
    /// or a backend error if a removal fails. A failed removal stops the
    /// walk; the failing layer stays registered with no references.
    pub fn release(&self, layer: Layer) -> Result<Vec<Metadata>> {
        let mut layers = self.lock_layers()?;
        let Some(node) = layers.get_mut(layer.chain_id()) else {
            return Err(StrataError::NotRetained {
                id: layer.chain_id().to_string(),
            });
        };
        if node.release(layer.handle)? > 0 {
            return Ok(Vec::new());
        }
        self.release_chain(&mut layers, layer.chain_id().clone())
    }

    /// Returns a point-in-time snapshot of every registered layer.
    ///
    /// # Errors
    ///
    /// Returns an error if the layer map lock is poisoned.
    pub fn map(&self) -> Result<HashMap<ChainId, Arc<RoLayer>>> {
        Ok(self
            .lock_layers()?
            .iter()
            .map(|(id, node)| (id.clone(), Arc::clone(&node.layer)))
            .collect())
    }

    /// Current reference count of `chain_id`, for diagnostics.
    pub fn reference_count(&self, chain_id: &ChainId) -> Option<usize> {
        self.layers
            .lock()
            .ok()?
            .get(chain_id)
            .map(|node| node.reference_count)
    }

    /// Creates the read-write layer `name` on top of `parent`.
    ///
    /// With an initializer in `opts`, an init layer is created between the
    /// parent and the writable device and populated first.
    ///
    /// # Errors
    ///
    /// Returns `NameConflict` if `name` is in use, `NotFound` for an
    /// unknown parent, the initializer's error, or a backend error. Nothing
    /// is left behind on failure.
    pub fn create_rw_layer(
        &self,
        name: &str,
        parent: Option<&ChainId>,
        opts: CreateRwLayerOpts,
    ) -> Result<RwLayer> {
        let mut mounts = self.lock_mounts()?;
        if mounts.contains_key(name) {
            return Err(StrataError::NameConflict {
                name: name.to_string(),
            });
        }

        let parent_layer = match parent {
            None => None,
            Some(id) => {
                let mut layers = self.lock_layers()?;
                let node = layers.get_mut(id).ok_or_else(|| StrataError::NotFound {
                    kind: "parent layer",
                    id: id.to_string(),
                })?;
                node.hold();
                Some(Arc::clone(&node.layer))
            }
        };

        let mount = match self.create_mount(name, parent_layer, opts) {
            Ok(mount) => mount,
            Err(e) => {
                if let Some(parent) = parent {
                    self.drop_hold_and_log(parent);
                }
                return Err(e);
            }
        };

        let mut node = MountNode {
            mount: Arc::new(mount),
            handles: HashSet::new(),
        };
        let handle = node.retain();
        let mount = Arc::clone(&node.mount);
        let _ = mounts.insert(name.to_string(), node);
        drop(mounts);

        tracing::info!(name, mount_id = %mount.mount_id(), "read-write layer created");
        Ok(RwLayer {
            mount,
            handle,
            driver: Arc::clone(&self.driver),
        })
    }

    /// Returns a new reference to the read-write layer `name`.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if no such layer exists.
    pub fn get_rw_layer(&self, name: &str) -> Result<RwLayer> {
        let mut mounts = self.lock_mounts()?;
        let node = mounts.get_mut(name).ok_or_else(|| StrataError::NotFound {
            kind: "read-write layer",
            id: name.to_string(),
        })?;
        let handle = node.retain();
        let mount = Arc::clone(&node.mount);
        drop(mounts);
        Ok(RwLayer {
            mount,
            handle,
            driver: Arc::clone(&self.driver),
        })
    }

    /// Returns the driver id of the read-write layer `name`.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if no such layer exists.
    pub fn get_mount_id(&self, name: &str) -> Result<String> {
        self.lock_mounts()?
            .get(name)
            .map(|node| node.mount.mount_id().to_string())
            .ok_or_else(|| StrataError::NotFound {
                kind: "read-write layer",
                id: name.to_string(),
            })
    }

    /// Gives back a read-write layer reference.
    ///
    /// On the last reference the writable device, the init layer, and the
    /// mount metadata are removed and the hold on the parent is released.
    ///
    /// # Errors
    ///
    /// Returns `NotRetained` for a handle this store did not hand out, or a
    /// backend error. After a backend error the layer stays registered
    /// with no references; retaking and releasing it retries the removal.
    pub fn release_rw_layer(&self, layer: RwLayer) -> Result<Vec<Metadata>> {
        let mut mounts = self.lock_mounts()?;
        let Some(node) = mounts.get_mut(layer.name()) else {
            return Err(StrataError::NotRetained {
                id: layer.name().to_string(),
            });
        };
        if node.release(layer.handle)? > 0 {
            return Ok(Vec::new());
        }

        let mount = Arc::clone(&node.mount);
        self.driver
            .remove(mount.mount_id())
            .map_err(|e| StrataError::backend("driver remove", e))?;
        if let Some(init_id) = mount.init_id() {
            self.driver
                .remove(init_id)
                .map_err(|e| StrataError::backend("driver remove", e))?;
        }
        self.metadata
            .remove_mount(mount.name())
            .map_err(|e| StrataError::backend("metadata remove", e))?;
        let _ = mounts.remove(mount.name());
        tracing::info!(name = mount.name(), "read-write layer removed");

        let Some(parent) = mount.parent() else {
            return Ok(Vec::new());
        };
        let mut layers = self.lock_layers()?;
        self.drop_hold(&mut layers, parent.chain_id())
    }

    /// Driver cache ids left behind by layers and mounts whose metadata
    /// could not be loaded at startup.
    ///
    /// Nothing references them; removing them through the driver is left
    /// to the caller.
    pub fn orphaned_cache_ids(&self) -> Vec<String> {
        self.orphans
            .lock()
            .map(|orphans| orphans.clone())
            .unwrap_or_default()
    }

    /// Releases either kind of handle.
    ///
    /// # Errors
    ///
    /// See [`LayerStore::release`] and [`LayerStore::release_rw_layer`].
    pub fn release_handle(&self, handle: LayerHandle) -> Result<Vec<Metadata>> {
        match handle {
            LayerHandle::ReadOnly(layer) => self.release(layer),
            LayerHandle::ReadWrite(layer) => self.release_rw_layer(layer),
        }
    }

    /// Releases driver-wide resources such as active mounts.
    ///
    /// # Errors
    ///
    /// Returns a backend error if the driver cleanup fails.
    pub fn cleanup(&self) -> Result<()> {
        self.driver
            .cleanup()
            .map_err(|e| StrataError::backend("driver cleanup", e))
    }

    /// Human-readable driver status.
    pub fn driver_status(&self) -> Vec<(String, String)> {
        self.driver.status()
    }

    /// Name of the graph driver in use.
    pub fn driver_name(&self) -> &str {
        self.driver.name()
    }

    fn register_on<R: Read>(
        &self,
        tar: R,
        parent: Option<&Arc<RoLayer>>,
        descriptor: Option<Descriptor>,
    ) -> Result<Layer> {
        let (mut spool, diff_id) = spool(tar)?;
        let chain_id = compute_chain_id(parent.map(|p| p.chain_id()), &diff_id);
        let mut layers = self.lock_layers()?;
        if let Some(layer) = self.retain_existing(&mut layers, &chain_id, parent) {
            tracing::debug!(chain_id = %chain_id, "layer already registered");
            return Ok(layer);
        }
        drop(layers);

        let parent_cache = parent.map(|p| p.cache_id());
        let mut staging = Staging::begin(self.driver.as_ref(), self.metadata.as_ref(), parent_cache)?;
        let size = self.apply_tar(&mut spool, &mut staging, parent_cache)?;

        let layer = Arc::new(RoLayer {
            chain_id,
            diff_id,
            parent: parent.cloned(),
            cache_id: staging.cache_id.clone(),
            size,
            descriptor,
        });
        staging.record(&layer)?;

        let mut layers = self.lock_layers()?;
        if let Some(winner) = self.retain_existing(&mut layers, layer.chain_id(), parent) {
            drop(layers);
            tracing::debug!(
                chain_id = %winner.chain_id(),
                cache_id = %staging.cache_id,
                "layer registered concurrently, discarding duplicate"
            );
            drop(staging);
            return Ok(winner);
        }

        staging.commit(layer.chain_id())?;
        let mut node = LayerNode::new(Arc::clone(&layer));
        let handle = node.retain();
        let _ = layers.insert(layer.chain_id().clone(), node);
        drop(layers);

        tracing::debug!(
            chain_id = %layer.chain_id(),
            diff_id = %layer.diff_id(),
            cache_id = %layer.cache_id(),
            size,
            "layer registered"
        );
        Ok(self.layer_handle(layer, handle))
    }

    /// Hands out a reference to an already registered `chain_id`.
    ///
    /// The hold taken on `parent` for this registration is given back; the
    /// existing layer holds the parent already.
    fn retain_existing(
        &self,
        layers: &mut LayerMap,
        chain_id: &ChainId,
        parent: Option<&Arc<RoLayer>>,
    ) -> Option<Layer> {
        let existing = layers.get_mut(chain_id)?;
        let handle = existing.retain();
        let winner = Arc::clone(&existing.layer);
        if let Some(parent) = parent {
            match self.drop_hold(layers, parent.chain_id()) {
                Ok(removed) => log_release_metadata(&removed),
                Err(e) => tracing::error!(
                    chain_id = %parent.chain_id(),
                    error = %e,
                    "failed to release parent of duplicate layer"
                ),
            }
        }
        Some(self.layer_handle(winner, handle))
    }

    fn apply_tar(
        &self,
        spool: &mut File,
        staging: &mut Staging<'_>,
        parent_cache: Option<&str>,
    ) -> Result<u64> {
        let cache_id = staging.cache_id.clone();
        let apply = |e| StrataError::backend("driver apply diff", e);

        let size = if self.use_tar_split {
            let sink = staging
                .tx()?
                .tar_split_writer()
                .map_err(|e| StrataError::backend("tar-split create", e))?;
            let mut disassembler = Disassembler::new(spool, sink);
            let size = self
                .driver
                .apply_diff(&cache_id, parent_cache, &mut disassembler)
                .map_err(apply)?;
            let _ = io::copy(&mut disassembler, &mut io::sink())
                .map_err(|e| StrataError::io("layer tar stream", e))?;
            disassembler
                .finish()
                .map_err(|e| StrataError::backend("tar-split write", e))?;
            size
        } else {
            self.driver
                .apply_diff(&cache_id, parent_cache, spool)
                .map_err(apply)?
        };

        tracing::debug!(cache_id = %cache_id, size, "layer tar applied");
        Ok(size)
    }

    fn create_mount(
        &self,
        name: &str,
        parent: Option<Arc<RoLayer>>,
        opts: CreateRwLayerOpts,
    ) -> Result<MountedLayer> {
        let CreateRwLayerOpts {
            mount_label,
            storage_opt,
            init,
        } = opts;
        let create_opts = CreateOpts {
            mount_label,
            storage_opt,
        };
        let mount_id = random_id();
        let parent_cache = parent.as_deref().map(RoLayer::cache_id);

        let init_id = match init {
            Some(init) => Some(self.init_mount(&mount_id, parent_cache, &create_opts, init)?),
            None => None,
        };

        let base = init_id.as_deref().or(parent_cache);
        if let Err(e) = self
            .driver
            .create_read_write(&mount_id, base, Some(&create_opts))
        {
            if let Some(init_id) = &init_id {
                self.remove_and_log(init_id);
            }
            return Err(StrataError::backend("driver create", e));
        }

        let mount = MountedLayer {
            name: name.to_string(),
            mount_id,
            init_id,
            parent,
        };
        if let Err(e) = self.save_mount(&mount) {
            self.remove_and_log(mount.mount_id());
            if let Some(init_id) = mount.init_id() {
                self.remove_and_log(init_id);
            }
            if let Err(e) = self.metadata.remove_mount(name) {
                tracing::warn!(name, error = %e, "failed to remove partial mount metadata");
            }
            return Err(e);
        }
        Ok(mount)
    }

    fn init_mount(
        &self,
        mount_id: &str,
        parent_cache: Option<&str>,
        opts: &CreateOpts,
        init: MountInit,
    ) -> Result<String> {
        let init_id = format!("{mount_id}{INIT_LAYER_SUFFIX}");
        self.driver
            .create_read_write(&init_id, parent_cache, Some(opts))
            .map_err(|e| StrataError::backend("driver create", e))?;

        let populated = self
            .driver
            .get(&init_id, &opts.mount_label)
            .map_err(|e| StrataError::backend("driver get", e))
            .and_then(|root| {
                let result = init(root.as_path());
                let unmounted = self
                    .driver
                    .put(&init_id)
                    .map_err(|e| StrataError::backend("driver put", e));
                result.and(unmounted)
            });
        if let Err(e) = populated {
            self.remove_and_log(&init_id);
            return Err(e);
        }
        Ok(init_id)
    }

    fn save_mount(&self, mount: &MountedLayer) -> Result<()> {
        let write = |e| StrataError::backend("metadata write", e);
        self.metadata
            .set_mount_id(mount.name(), mount.mount_id())
            .map_err(write)?;
        if let Some(init_id) = mount.init_id() {
            self.metadata
                .set_init_id(mount.name(), init_id)
                .map_err(write)?;
        }
        if let Some(parent) = mount.parent() {
            self.metadata
                .set_mount_parent(mount.name(), parent.chain_id())
                .map_err(write)?;
        }
        Ok(())
    }

    /// Drops one non-handle reference and cascades at zero.
    fn drop_hold(&self, layers: &mut LayerMap, chain_id: &ChainId) -> Result<Vec<Metadata>> {
        let node = layers
            .get_mut(chain_id)
            .filter(|node| node.reference_count > 0)
            .ok_or_else(|| StrataError::NotRetained {
                id: chain_id.to_string(),
            })?;
        node.reference_count -= 1;
        if node.reference_count > 0 {
            return Ok(Vec::new());
        }
        self.release_chain(layers, chain_id.clone())
    }

    fn drop_hold_and_log(&self, chain_id: &ChainId) {
        let result = self
            .lock_layers()
            .and_then(|mut layers| self.drop_hold(&mut layers, chain_id));
        match result {
            Ok(removed) => log_release_metadata(&removed),
            Err(e) => tracing::error!(chain_id = %chain_id, error = %e, "failed to release layer"),
        }
    }

    /// Removes `start` and every ancestor whose count reaches zero.
    fn release_chain(&self, layers: &mut LayerMap, start: ChainId) -> Result<Vec<Metadata>> {
        let mut removed = Vec::new();
        let mut next = Some(start);
        while let Some(chain_id) = next.take() {
            let Some(node) = layers.get(&chain_id) else {
                break;
            };
            if node.reference_count > 0 {
                break;
            }
            let layer = Arc::clone(&node.layer);
            if let Err(e) = self.delete_layer(&layer) {
                log_release_metadata(&removed);
                return Err(e);
            }
            let _ = layers.remove(&chain_id);
            removed.push(Metadata::of(&layer));

            if let Some(parent) = layer.parent() {
                if let Some(parent_node) = layers.get_mut(parent.chain_id()) {
                    parent_node.reference_count = parent_node.reference_count.saturating_sub(1);
                    next = Some(parent.chain_id().clone());
                }
            }
        }
        Ok(removed)
    }

    fn delete_layer(&self, layer: &RoLayer) -> Result<()> {
        self.driver
            .remove(layer.cache_id())
            .map_err(|e| StrataError::backend("driver remove", e))?;
        self.metadata
            .remove(layer.chain_id())
            .map_err(|e| StrataError::backend("metadata remove", e))?;
        tracing::debug!(chain_id = %layer.chain_id(), cache_id = %layer.cache_id(), "layer deleted");
        Ok(())
    }

    fn remove_and_log(&self, cache_id: &str) {
        if let Err(e) = self.driver.remove(cache_id) {
            tracing::warn!(cache_id, error = %e, "failed to remove driver storage");
        }
    }

    fn layer_handle(&self, layer: Arc<RoLayer>, handle: u64) -> Layer {
        Layer {
            layer,
            handle,
            driver: Arc::clone(&self.driver),
            metadata: Arc::clone(&self.metadata),
        }
    }

    fn restore(&self) -> Result<()> {
        let (chain_ids, names) = self
            .metadata
            .list()
            .map_err(|e| StrataError::backend("metadata list", e))?;

        let mut mounts = self.lock_mounts()?;
        let mut layers = self.lock_layers()?;
        let mut orphans = Vec::new();
        for chain_id in &chain_ids {
            if let Err(e) = self.load_chain(&mut layers, chain_id) {
                tracing::debug!(chain_id = %chain_id, error = %e, "skipping layer that failed to load");
                if !layers.contains_key(chain_id) {
                    if let Ok(cache_id) = self.metadata.get_cache_id(chain_id) {
                        orphans.push(cache_id);
                    }
                }
            }
        }
        for name in names {
            match self.load_mount(&mut layers, &name) {
                Ok(mount) => {
                    let _ = mounts.insert(
                        name,
                        MountNode {
                            mount: Arc::new(mount),
                            handles: HashSet::new(),
                        },
                    );
                }
                Err(e) => {
                    tracing::debug!(name = %name, error = %e, "skipping mount that failed to load");
                    orphans.extend(self.metadata.get_mount_id(&name).ok());
                    orphans.extend(self.metadata.get_init_id(&name).ok().flatten());
                }
            }
        }

        orphans.retain(|cache_id| self.driver.exists(cache_id));
        for cache_id in &orphans {
            tracing::warn!(
                driver = self.driver.name(),
                cache_id = %cache_id,
                "driver storage has no loadable layer"
            );
        }
        if let Ok(mut kept) = self.orphans.lock() {
            *kept = orphans;
        }

        tracing::info!(
            driver = self.driver.name(),
            layers = layers.len(),
            mounts = mounts.len(),
            "layer store restored"
        );
        Ok(())
    }

    /// Loads `top` and any ancestors not loaded yet, base first.
    fn load_chain(&self, layers: &mut LayerMap, top: &ChainId) -> Result<()> {
        let mut pending = Vec::new();
        let mut cursor = Some(top.clone());
        while let Some(chain_id) = cursor {
            if layers.contains_key(&chain_id) {
                break;
            }
            if pending.len() > MAX_LAYER_DEPTH {
                return Err(StrataError::MaxDepthExceeded {
                    max: MAX_LAYER_DEPTH,
                });
            }
            cursor = self.metadata.get_parent(&chain_id)?;
            pending.push(chain_id);
        }

        for chain_id in pending.into_iter().rev() {
            let layer = self.read_layer(layers, &chain_id)?;
            if let Some(parent) = layer.parent() {
                if let Some(node) = layers.get_mut(parent.chain_id()) {
                    node.hold();
                }
            }
            let _ = layers.insert(chain_id, LayerNode::new(layer));
        }
        Ok(())
    }

    fn read_layer(&self, layers: &LayerMap, chain_id: &ChainId) -> Result<Arc<RoLayer>> {
        let diff_id = self.metadata.get_diff_id(chain_id)?;
        let size = self.metadata.get_size(chain_id)?;
        let cache_id = self.metadata.get_cache_id(chain_id)?;
        let descriptor = self.metadata.get_descriptor(chain_id)?;
        let parent = match self.metadata.get_parent(chain_id)? {
            None => None,
            Some(parent_id) => Some(Arc::clone(
                &layers
                    .get(&parent_id)
                    .ok_or_else(|| StrataError::NotFound {
                        kind: "parent layer",
                        id: parent_id.to_string(),
                    })?
                    .layer,
            )),
        };

        let expected = compute_chain_id(parent.as_deref().map(RoLayer::chain_id), &diff_id);
        if &expected != chain_id {
            return Err(StrataError::HashMismatch {
                resource: format!("layer {chain_id}"),
                expected: chain_id.to_string(),
                actual: expected.to_string(),
            });
        }

        Ok(Arc::new(RoLayer {
            chain_id: chain_id.clone(),
            diff_id,
            parent,
            cache_id,
            size,
            descriptor,
        }))
    }

    fn load_mount(&self, layers: &mut LayerMap, name: &str) -> Result<MountedLayer> {
        let mount_id = self.metadata.get_mount_id(name)?;
        let init_id = self.metadata.get_init_id(name)?;
        let parent = match self.metadata.get_mount_parent(name)? {
            None => None,
            Some(parent_id) => {
                let node = layers
                    .get_mut(&parent_id)
                    .ok_or_else(|| StrataError::NotFound {
                        kind: "parent layer",
                        id: parent_id.to_string(),
                    })?;
                node.hold();
                Some(Arc::clone(&node.layer))
            }
        };
        Ok(MountedLayer {
            name: name.to_string(),
            mount_id,
            init_id,
            parent,
        })
    }

    fn lock_layers(&self) -> Result<MutexGuard<'_, LayerMap>> {
        self.layers.lock().map_err(|_| StrataError::Config {
            message: "layer map lock poisoned".into(),
        })
    }

    fn lock_mounts(&self) -> Result<MutexGuard<'_, MountMap>> {
        self.mounts.lock().map_err(|_| StrataError::Config {
            message: "mount map lock poisoned".into(),
        })
    }
}

impl fmt::Debug for LayerStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LayerStore")
            .field("driver", &self.driver.name())
            .field("use_tar_split", &self.use_tar_split)
            .finish_non_exhaustive()
    }
}

/// Driver storage and a metadata transaction for a layer being registered.
///
/// Dropped without [`Staging::commit`], both are discarded.
struct Staging<'a> {
    driver: &'a dyn Driver,
    cache_id: String,
    tx: Option<Box<dyn MetadataTransaction>>,
    committed: bool,
}

impl<'a> Staging<'a> {
    fn begin(
        driver: &'a dyn Driver,
        metadata: &dyn MetadataStore,
        parent_cache: Option<&str>,
    ) -> Result<Self> {
        let cache_id = random_id();
        driver
            .create(&cache_id, parent_cache, None)
            .map_err(|e| StrataError::backend("driver create", e))?;
        let mut staging = Self {
            driver,
            cache_id,
            tx: None,
            committed: false,
        };
        staging.tx = Some(
            metadata
                .start_transaction()
                .map_err(|e| StrataError::backend("metadata transaction", e))?,
        );
        Ok(staging)
    }

    fn tx(&mut self) -> Result<&mut (dyn MetadataTransaction + 'static)> {
        self.tx.as_deref_mut().ok_or_else(|| StrataError::Config {
            message: "metadata transaction already finished".into(),
        })
    }

    fn record(&mut self, layer: &RoLayer) -> Result<()> {
        let write = |e| StrataError::backend("metadata write", e);
        let tx = self.tx()?;
        tx.set_diff_id(layer.diff_id()).map_err(write)?;
        tx.set_size(layer.diff_size()).map_err(write)?;
        tx.set_cache_id(layer.cache_id()).map_err(write)?;
        if let Some(parent) = layer.parent() {
            tx.set_parent(parent.chain_id()).map_err(write)?;
        }
        if let Some(descriptor) = layer.descriptor() {
            tx.set_descriptor(descriptor).map_err(write)?;
        }
        Ok(())
    }

    fn commit(mut self, chain_id: &ChainId) -> Result<()> {
        let tx = self.tx.take().ok_or_else(|| StrataError::Config {
            message: "metadata transaction already finished".into(),
        })?;
        tx.commit(chain_id)
            .map_err(|e| StrataError::backend("metadata commit", e))?;
        self.committed = true;
        Ok(())
    }
}

impl Drop for Staging<'_> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        if let Some(tx) = self.tx.take() {
            if let Err(e) = tx.cancel() {
                tracing::warn!(cache_id = %self.cache_id, error = %e, "failed to cancel metadata transaction");
            }
        }
        if let Err(e) = self.driver.remove(&self.cache_id) {
            tracing::warn!(cache_id = %self.cache_id, error = %e, "failed to remove staged layer");
        }
    }
}

/// Copies `tar` into an anonymous temporary file, returning the file
/// rewound to its start and the digest of its contents.
fn spool<R: Read>(tar: R) -> Result<(File, DiffId)> {
    let dir = std::env::temp_dir();
    let mut file = tempfile::tempfile().map_err(|e| StrataError::io(&dir, e))?;
    let mut digest = DigestReader::new(tar);
    let bytes = io::copy(&mut digest, &mut file)
        .map_err(|e| StrataError::io("layer tar stream", e))?;
    let _ = file
        .seek(SeekFrom::Start(0))
        .map_err(|e| StrataError::io(&dir, e))?;
    let diff_id = DiffId::new(digest.finish());
    tracing::debug!(diff_id = %diff_id, bytes, "layer tar spooled");
    Ok((file, diff_id))
}

/// Releases `layer` and logs the outcome instead of returning it.
pub fn release_and_log(store: &LayerStore, layer: Layer) {
    let chain_id = layer.chain_id().clone();
    match store.release(layer) {
        Ok(removed) => log_release_metadata(&removed),
        Err(e) => tracing::error!(chain_id = %chain_id, error = %e, "failed to release layer"),
    }
}

/// Logs every layer removed by a release.
pub fn log_release_metadata(removed: &[Metadata]) {
    for metadata in removed {
        tracing::info!(
            chain_id = %metadata.chain_id,
            diff_id = %metadata.diff_id,
            size = metadata.size,
            "layer cleaned up"
        );
    }
}
