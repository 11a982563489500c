//! Chain id derivation.
//!
//! A chain id names an ordered stack of layers:
//! `chain(L0) = diff(L0)` and `chain(Ln) = sha256(chain(Ln-1) + " " + diff(Ln))`.

use strata_common::types::{ChainId, DiffId, Digest};

/// Computes the chain id of `diff_id` stacked on `parent`.
#[must_use]
pub fn compute_chain_id(parent: Option<&ChainId>, diff_id: &DiffId) -> ChainId {
    match parent {
        None => ChainId::from(diff_id.clone()),
        Some(parent) => ChainId::new(Digest::from_bytes(
            format!("{parent} {diff_id}").as_bytes(),
        )),
    }
}

/// Folds `diff_ids` on top of `parent`.
///
/// Returns `parent` unchanged when `diff_ids` is empty.
#[must_use]
pub fn chain_id_from_parent(parent: Option<&ChainId>, diff_ids: &[DiffId]) -> Option<ChainId> {
    let mut chain = parent.cloned();
    for diff_id in diff_ids {
        chain = Some(compute_chain_id(chain.as_ref(), diff_id));
    }
    chain
}

/// Returns the chain id of a full stack, or `None` for an empty stack.
#[must_use]
pub fn create_chain_id(diff_ids: &[DiffId]) -> Option<ChainId> {
    chain_id_from_parent(None, diff_ids)
}
