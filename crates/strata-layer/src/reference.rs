//! Reference bookkeeping shared by read-only and read-write layers.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

use strata_common::error::{Result, StrataError};

use crate::mounted_layer::RwLayer;
use crate::ro_layer::Layer;

static NEXT_HANDLE: AtomicU64 = AtomicU64::new(1);

/// Allocates a process-wide unique handle id.
pub(crate) fn next_handle() -> u64 {
    NEXT_HANDLE.fetch_add(1, Ordering::Relaxed)
}

/// Retain/release bookkeeping of an arena node.
pub trait Retainable {
    /// Identity used in error messages.
    fn id(&self) -> String;

    /// Live handles on this node.
    fn handles(&mut self) -> &mut HashSet<u64>;

    /// Adjusts the count after a handle was added (`+1`) or removed (`-1`).
    fn on_change(&mut self, delta: isize);

    /// Current reference count.
    fn reference_count(&self) -> usize;

    /// Hands out a new reference and returns its handle id.
    fn retain(&mut self) -> u64 {
        let handle = next_handle();
        let _ = self.handles().insert(handle);
        self.on_change(1);
        handle
    }

    /// Gives back the reference `handle` and returns the remaining count.
    ///
    /// # Errors
    ///
    /// Returns `NotRetained` if `handle` was not handed out by this node.
    fn release(&mut self, handle: u64) -> Result<usize> {
        if !self.handles().remove(&handle) {
            return Err(StrataError::NotRetained { id: self.id() });
        }
        self.on_change(-1);
        Ok(self.reference_count())
    }
}

/// Either kind of layer handle.
#[derive(Debug)]
pub enum LayerHandle {
    /// A read-only (image) layer.
    ReadOnly(Layer),
    /// A read-write (container) layer.
    ReadWrite(RwLayer),
}

impl From<Layer> for LayerHandle {
    fn from(layer: Layer) -> Self {
        Self::ReadOnly(layer)
    }
}

impl From<RwLayer> for LayerHandle {
    fn from(layer: RwLayer) -> Self {
        Self::ReadWrite(layer)
    }
}
