//! # strata-image
//!
//! Image configs for the Strata layer store.
//!
//! Handles:
//! - **Configs**: parsing and validation of image configs.
//! - **Root filesystems**: the diff id list and its chain id.
//! - **Storage**: content-addressed config files with per-image metadata.
//! - **Store**: image lifecycle, layer references, and the parent/child
//!   index between images.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod backend;
pub mod image;
pub mod rootfs;
pub mod store;

pub use backend::{FsBackend, StoreBackend};
pub use image::{History, Image};
pub use rootfs::{RootFs, TYPE_LAYERS};
pub use store::{ImageStore, LayerGetReleaser};
