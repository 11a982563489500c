//! # strata-graphdriver
//!
//! Pluggable storage backends for the Strata layer store.
//!
//! A graph driver physically stores layer contents and is addressed only
//! by host-local cache ids. The layer store owns the mapping from content
//! addresses (chain ids) to cache ids; drivers never see a digest.
//!
//! This crate provides:
//! - **[`Driver`]**: the contract every backend implements.
//! - **[`DriverRegistry`]**: name-based backend selection at startup.
//! - **`vfs`**: a portable backend that stores each layer as a full
//!   directory copy and computes diffs by walking trees.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod driver;
pub mod naive;
pub mod registry;
pub mod vfs;

pub use driver::{Capabilities, Change, ChangeKind, CreateOpts, Driver};
pub use registry::{DriverRegistry, InitFn};
