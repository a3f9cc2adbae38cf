//! Exit blame assignment.

use crate::types::protocol::CLUSTER_SIZE;
use alloy::primitives::U256;

/// Blame percentages, one per cluster operator in pool order
pub type BlamePercents = [u32; CLUSTER_SIZE];

/// Assign blame for an exited pool.
///
/// A pool that exits below `expected_balance` puts the full penalty on its
/// first listed operator; otherwise nobody is blamed.
#[must_use]
pub fn blame_percents(final_balance: U256, expected_balance: U256) -> BlamePercents {
    let mut blame = [0; CLUSTER_SIZE];
    if final_balance < expected_balance {
        blame[0] = 100;
    }
    blame
}
