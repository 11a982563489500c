//! # strata-common
//!
//! Shared identifiers, digests, error definitions, configuration models,
//! and constants used across the entire Strata workspace.
//!
//! This crate is the leaf of the dependency graph. It depends on no other
//! internal crate and provides the content-addressing primitives that the
//! graph driver, layer store, and image store build upon.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod config;
pub mod constants;
pub mod error;
pub mod types;
