//! # strata-layer
//!
//! Content-addressed, reference-counted layer store.
//!
//! Read-only layers are registered from tar streams and identified by
//! their chain id, the digest of the whole stack below them. Identical
//! stacks are stored once. Read-write layers are named, mutable devices
//! created on top of a read-only layer.
//!
//! This crate provides:
//! - **Chain ids**: [`compute_chain_id`] and [`create_chain_id`].
//! - **Metadata**: a transactional, crash-consistent on-disk record of
//!   every layer and mount.
//! - **Tar-split**: byte-exact reconstruction of registered tar streams on
//!   drivers that cannot reproduce them.
//! - **[`LayerStore`]**: registration, deduplication, reference counting,
//!   cascading release, and restore after restart.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod chain;
pub mod metadata;
pub mod mounted_layer;
pub mod reference;
pub mod ro_layer;
pub mod store;
pub mod tarsplit;
pub mod verify;

pub use chain::{chain_id_from_parent, compute_chain_id, create_chain_id};
pub use metadata::{Descriptor, FsMetadataStore, MetadataStore, MetadataTransaction};
pub use mounted_layer::{CreateRwLayerOpts, MountInit, MountedLayer, RwLayer};
pub use reference::{LayerHandle, Retainable};
pub use ro_layer::{Layer, Metadata, RoLayer};
pub use store::{LayerStore, log_release_metadata, release_and_log};
