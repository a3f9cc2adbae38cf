//! Lifecycle Orchestrator
//!
//! One handler per protocol event, plus the polled activation check. Every
//! handler is safe to replay: it re-reads chain state and skips work whose
//! effects already landed.

use crate::chain::{
    ChainClient, CompletedExitReport, PoolInitiation, PoolQueue, ReshareSubmission,
};
use crate::events::ProtocolEvent;
use crate::funding::FundingManager;
use crate::operators::OperatorDirectory;
use alloy::primitives::U256;
use anyhow::{Context, Result};
use oracle_core::{
    blame_percents, protocol, BeaconApi, CeremonyClient, FundingAccountKind, Pool, PoolStatus,
    RetryPolicy,
};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Drives pools through their lifecycle
#[derive(Clone)]
pub struct Orchestrator {
    chain: Arc<dyn ChainClient>,
    beacon: Arc<dyn BeaconApi>,
    ceremony: CeremonyClient,
    operators: OperatorDirectory,
    funding: FundingManager,
    retry: RetryPolicy,
}

impl Orchestrator {
    #[must_use]
    pub fn new(
        chain: Arc<dyn ChainClient>,
        beacon: Arc<dyn BeaconApi>,
        ceremony: CeremonyClient,
        operators: OperatorDirectory,
        funding: FundingManager,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            chain,
            beacon,
            ceremony,
            operators,
            funding,
            retry,
        }
    }

    /// Dispatch one event to its handler
    ///
    /// # Errors
    /// Returns the handler's error
    pub async fn handle(&self, event: ProtocolEvent) -> Result<()> {
        match event {
            ProtocolEvent::DepositRequested { pool_id } => self.initiate_pool(pool_id).await,
            ProtocolEvent::OperatorDeactivationRequested { operator_id } => {
                self.deactivate_operator(operator_id).await
            }
            ProtocolEvent::CompletedExitReportsRequested { count } => {
                self.report_completed_exits(count).await
            }
            ProtocolEvent::ForcedExitReportsRequested { count } => {
                self.report_forced_exits(count).await
            }
        }
    }

    async fn read_pool(&self, pool_id: u32) -> Result<Pool> {
        let chain = self.chain.as_ref();
        let pool = self
            .retry
            .run("pool details", move || chain.pool(pool_id))
            .await?;
        pool.check_invariants()?;
        Ok(pool)
    }

    async fn read_pool_ids(&self, queue: PoolQueue) -> Result<Vec<u32>> {
        let chain = self.chain.as_ref();
        let mut ids = self
            .retry
            .run("pool ids", move || chain.pool_ids(queue))
            .await?;
        ids.sort_unstable();
        Ok(ids)
    }

    async fn cluster_fee(&self, operator_ids: &[u64]) -> Result<U256> {
        let chain = self.chain.as_ref();
        self.retry
            .run("cluster fee", move || chain.required_cluster_fee(operator_ids))
            .await
    }

    async fn read_cluster(&self, operator_ids: &[u64]) -> Result<oracle_core::ClusterSnapshot> {
        let chain = self.chain.as_ref();
        self.retry
            .run("cluster snapshot", move || chain.cluster(operator_ids))
            .await
    }

    /// READY → PENDING: run a keygen ceremony and initiate the deposit
    ///
    /// # Errors
    /// Returns error if any step fails after its retry budget
    #[instrument(skip(self))]
    pub async fn initiate_pool(&self, pool_id: u32) -> Result<()> {
        let pool = self.read_pool(pool_id).await?;
        if !pool.public_key.is_empty() {
            info!(pool_id, status = ?pool.status, "Pool already has a validator key, skipping");
            return Ok(());
        }

        let chain = self.chain.as_ref();
        let withdrawal_address = self
            .retry
            .run("next pool address", move || chain.next_pool_address())
            .await?;
        let operator_ids = self.operators.select_for_keygen().await?;

        let validator = self
            .ceremony
            .create_validator(pool_id, &operator_ids, withdrawal_address)
            .await?;

        let fee = self.cluster_fee(&operator_ids).await?;
        let cluster = self.read_cluster(&operator_ids).await?;
        let payment = self
            .funding
            .payment_for(FundingAccountKind::Cluster, fee)
            .await?;

        let tx_hash = self
            .chain
            .initiate_pool(&PoolInitiation {
                pool_id,
                validator,
                cluster,
                payment,
            })
            .await
            .with_context(|| format!("Failed to initiate pool {pool_id}"))?;

        info!(
            pool_id,
            ?operator_ids,
            withdrawal_address = %withdrawal_address,
            tx_hash = %tx_hash,
            "Pool deposit initiated"
        );
        Ok(())
    }

    /// PENDING → STAKED for every pending pool whose validator is active
    ///
    /// Returns the number of pools activated.
    ///
    /// # Errors
    /// Returns error if a read or activation fails after its retry budget
    #[instrument(skip(self))]
    pub async fn check_pending_activations(&self) -> Result<usize> {
        let mut activated = 0;
        for pool_id in self.read_pool_ids(PoolQueue::Pending).await? {
            let pool = self.read_pool(pool_id).await?;
            if pool.status != PoolStatus::Pending {
                continue;
            }

            let beacon = self.beacon.as_ref();
            let public_key = &pool.public_key;
            let validator = self
                .retry
                .run("beacon validator", move || beacon.validator(public_key, None))
                .await?;
            let Some(validator) = validator.filter(|v| v.status.is_active()) else {
                debug!(pool_id, "Validator not active yet");
                continue;
            };

            let fee = self.cluster_fee(&pool.operator_ids).await?;
            self.funding.refill_cluster(&pool.operator_ids, fee).await?;

            let tx_hash = self
                .chain
                .activate_pool(pool_id)
                .await
                .with_context(|| format!("Failed to activate pool {pool_id}"))?;
            info!(
                pool_id,
                validator_index = validator.index,
                tx_hash = %tx_hash,
                "Pool activated"
            );
            activated += 1;
        }
        Ok(activated)
    }

    /// Replace `operator_id` in every live pool it serves
    ///
    /// Pools at the reshare cap are sent to exit instead, without a ceremony.
    ///
    /// # Errors
    /// Returns error if any step fails after its retry budget
    #[instrument(skip(self))]
    pub async fn deactivate_operator(&self, operator_id: u64) -> Result<()> {
        let mut pool_ids = self.read_pool_ids(PoolQueue::Pending).await?;
        pool_ids.extend(self.read_pool_ids(PoolQueue::Staked).await?);
        pool_ids.sort_unstable();
        pool_ids.dedup();

        for pool_id in pool_ids {
            let pool = self.read_pool(pool_id).await?;
            if !pool.status.is_live() || !pool.has_operator(operator_id) {
                continue;
            }

            if pool.can_reshare() {
                self.reshare_pool(&pool, operator_id).await?;
            } else {
                let tx_hash = self
                    .chain
                    .request_pool_exit(pool_id)
                    .await
                    .with_context(|| format!("Failed to request exit for pool {pool_id}"))?;
                warn!(
                    pool_id,
                    operator_id,
                    reshare_count = pool.reshare_count,
                    tx_hash = %tx_hash,
                    "Reshare cap reached, pool exit requested"
                );
            }
        }
        Ok(())
    }

    async fn reshare_pool(&self, pool: &Pool, operator_id: u64) -> Result<()> {
        let replacement = self.operators.select_replacement(&pool.operator_ids).await?;
        let old_operator_ids = pool.operator_ids.clone();
        let operator_ids: Vec<u64> = old_operator_ids
            .iter()
            .map(|&id| if id == operator_id { replacement } else { id })
            .collect();

        let reshare = self
            .ceremony
            .reshare_validator(pool.id, &pool.public_key, &old_operator_ids, &operator_ids)
            .await?;

        let old_fee = self.cluster_fee(&old_operator_ids).await?;
        let new_fee = self.cluster_fee(&operator_ids).await?;
        let payment = self
            .funding
            .payment_for(FundingAccountKind::Cluster, new_fee.saturating_sub(old_fee))
            .await?;
        let old_cluster = self.read_cluster(&old_operator_ids).await?;
        let cluster = self.read_cluster(&operator_ids).await?;

        let tx_hash = self
            .chain
            .reshare_pool(&ReshareSubmission {
                pool_id: pool.id,
                old_operator_id: operator_id,
                new_operator_id: replacement,
                reshare,
                cluster,
                old_cluster,
                payment,
            })
            .await
            .with_context(|| format!("Failed to reshare pool {}", pool.id))?;

        info!(
            pool_id = pool.id,
            old_operator_id = operator_id,
            new_operator_id = replacement,
            reshare_count = pool.reshare_count + 1,
            tx_hash = %tx_hash,
            "Pool reshared"
        );
        Ok(())
    }

    /// Report `count` exiting pools as completed, oldest id first
    ///
    /// Never reports more than the manager still has outstanding, so a
    /// replayed request only covers what earlier runs did not.
    ///
    /// # Errors
    /// Returns error if any step fails after its retry budget
    #[instrument(skip(self))]
    pub async fn report_completed_exits(&self, count: u64) -> Result<()> {
        let chain = self.chain.as_ref();
        let outstanding = self
            .retry
            .run("requested completed exits", move || {
                chain.requested_completed_exits()
            })
            .await?;
        let limit = count.min(outstanding);
        if limit < count {
            info!(requested = count, outstanding, "Completed exits partly reported already");
        }

        let mut reported = 0;
        for pool_id in self.read_pool_ids(PoolQueue::Staked).await? {
            if reported >= limit {
                break;
            }
            let pool = self.read_pool(pool_id).await?;
            if !pool.status.is_exiting() {
                continue;
            }

            let blame = blame_percents(pool.balance, protocol::FULL_STAKE);
            let cluster = self.read_cluster(&pool.operator_ids).await?;
            let tx_hash = self
                .chain
                .report_completed_exit(&CompletedExitReport {
                    pool_id,
                    blame_percents: blame,
                    cluster,
                })
                .await
                .with_context(|| format!("Failed to report exit of pool {pool_id}"))?;

            info!(
                pool_id,
                balance = %pool.balance,
                blame_percents = ?blame,
                tx_hash = %tx_hash,
                "Completed exit reported"
            );
            reported += 1;
        }

        if reported < limit {
            warn!(requested = limit, reported, "Fewer exiting pools than requested");
        }
        Ok(())
    }

    /// Report up to `count` staked pools whose validators the network exited
    ///
    /// # Errors
    /// Returns error if any step fails after its retry budget
    #[instrument(skip(self))]
    pub async fn report_forced_exits(&self, count: u64) -> Result<()> {
        let limit = usize::try_from(count).unwrap_or(usize::MAX);
        let mut forced = Vec::new();
        for pool_id in self.read_pool_ids(PoolQueue::Staked).await? {
            if forced.len() >= limit {
                break;
            }
            let pool = self.read_pool(pool_id).await?;
            if pool.status != PoolStatus::Staked {
                continue;
            }

            let beacon = self.beacon.as_ref();
            let public_key = &pool.public_key;
            let validator = self
                .retry
                .run("beacon validator", move || beacon.validator(public_key, None))
                .await?;
            if validator.is_some_and(|v| v.status.is_exiting_or_exited()) {
                forced.push(pool_id);
            }
        }

        if forced.is_empty() {
            info!(requested = count, "No forced exits to report");
            return Ok(());
        }

        let tx_hash = self
            .chain
            .report_forced_exits(&forced)
            .await
            .context("Failed to report forced exits")?;
        info!(pool_ids = ?forced, tx_hash = %tx_hash, "Forced exits reported");
        Ok(())
    }
}
