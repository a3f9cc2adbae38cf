//! Operator Selection Policy
//!
//! Greedy least-loaded assignment: eligible operators outside the exclusion
//! set, ordered by pool count and then id, first `count` taken.

use crate::types::Operator;
use thiserror::Error;

/// Errors from operator selection
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SelectionError {
    #[error("Not enough eligible operators: need {needed}, found {available}")]
    NotEnoughOperators { needed: usize, available: usize },
}

/// Select `count` operators from `candidates`, skipping any id in `exclude`.
///
/// The result is deterministic for a given snapshot and exclusion set.
///
/// # Errors
/// Returns [`SelectionError::NotEnoughOperators`] if fewer than `count`
/// operators qualify
pub fn select_operators(
    candidates: &[Operator],
    exclude: &[u64],
    count: usize,
) -> Result<Vec<Operator>, SelectionError> {
    let mut eligible: Vec<&Operator> = candidates
        .iter()
        .filter(|op| op.is_eligible() && !exclude.contains(&op.id))
        .collect();

    eligible.sort_by_key(|op| (op.pool_count, op.id));

    if eligible.len() < count {
        return Err(SelectionError::NotEnoughOperators {
            needed: count,
            available: eligible.len(),
        });
    }

    Ok(eligible.into_iter().take(count).cloned().collect())
}
