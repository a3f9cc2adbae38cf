//! Operator Directory
//!
//! Snapshots the operator registry and applies the selection policy.

use crate::chain::ChainClient;
use anyhow::Result;
use futures::future::try_join_all;
use oracle_core::{select_operators, Operator, RetryPolicy};
use std::sync::Arc;
use tracing::{debug, instrument};

/// Registry reads and operator selection
#[derive(Clone)]
pub struct OperatorDirectory {
    chain: Arc<dyn ChainClient>,
    retry: RetryPolicy,
}

impl OperatorDirectory {
    #[must_use]
    pub fn new(chain: Arc<dyn ChainClient>, retry: RetryPolicy) -> Self {
        Self { chain, retry }
    }

    /// Snapshot of every registered operator, fetched concurrently
    ///
    /// # Errors
    /// Returns error once the read budget is exhausted
    pub async fn snapshot(&self) -> Result<Vec<Operator>> {
        let chain = self.chain.as_ref();
        self.retry
            .run("operator snapshot", move || async move {
                let ids = chain.operator_ids().await?;
                try_join_all(ids.into_iter().map(|id| chain.operator(id))).await
            })
            .await
    }

    /// Pick the 4 least-loaded eligible operators for a new validator
    ///
    /// # Errors
    /// Returns error if the registry read fails or too few operators qualify
    #[instrument(skip(self))]
    pub async fn select_for_keygen(&self) -> Result<Vec<u64>> {
        let snapshot = self.snapshot().await?;
        let selected = select_operators(&snapshot, &[], oracle_core::protocol::CLUSTER_SIZE)?;
        let ids: Vec<u64> = selected.iter().map(|op| op.id).collect();
        debug!(operator_ids = ?ids, "Selected operators for keygen");
        Ok(ids)
    }

    /// Pick one replacement operator, excluding a pool's current cluster
    ///
    /// # Errors
    /// Returns error if the registry read fails or no operator qualifies
    #[instrument(skip(self))]
    pub async fn select_replacement(&self, current: &[u64]) -> Result<u64> {
        let snapshot = self.snapshot().await?;
        let selected = select_operators(&snapshot, current, 1)?;
        let replacement = selected[0].id;
        debug!(replacement, "Selected replacement operator");
        Ok(replacement)
    }
}
