//! Execution-layer RPC client
//!
//! [`ChainClient`] over an alloy provider with the oracle's signer attached.

use crate::chain::{
    ChainClient, CompletedExitReport, FundingTarget, Holder, PoolInitiation, PoolQueue,
    ReshareSubmission,
};
use crate::contracts::{Cluster, IManager, IRegistry, ISSVNetwork, ISSVViews, IERC20};
use alloy::{
    network::{Ethereum, EthereumWallet},
    primitives::{Address, B256, U256},
    providers::{DynProvider, PendingTransactionBuilder, Provider, ProviderBuilder},
    rpc::types::{Filter, Log},
    signers::local::{coins_bip39::English, MnemonicBuilder, PrivateKeySigner},
    sol_types::SolEvent,
};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use futures::future::try_join_all;
use oracle_core::{ClusterSnapshot, FeePayment, Operator, Pool, PoolStatus};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// RPC client configuration
#[derive(Debug, Clone)]
pub struct RpcConfig {
    /// Execution-layer RPC URL
    pub rpc_url: String,
    pub manager: Address,
    pub registry: Address,
    pub views: Address,
    pub ssv_network: Address,
    /// Wait for confirmations on every write
    pub confirmations: u64,
    /// First block to scan for SSV cluster events
    pub cluster_scan_from: u64,
    /// Blocks per log query
    pub log_chunk: u64,
}

/// Build a signer from a private key (with or without `0x`)
///
/// # Errors
/// Returns error if the key cannot be parsed
pub fn signer_from_private_key(private_key: &str) -> Result<PrivateKeySigner> {
    let key = private_key.strip_prefix("0x").unwrap_or(private_key);
    key.parse().context("Invalid private key")
}

/// Build a signer from a BIP-39 mnemonic and derivation path
///
/// # Errors
/// Returns error if the phrase or path is invalid
pub fn signer_from_mnemonic(phrase: &str, derivation_path: &str) -> Result<PrivateKeySigner> {
    MnemonicBuilder::<English>::default()
        .phrase(phrase)
        .derivation_path(derivation_path)
        .context("Invalid derivation path")?
        .build()
        .context("Invalid mnemonic")
}

/// Position of a log in chain order
type LogPosition = (u64, u64);

/// Latest SSV cluster per operator set, built up from network events
#[derive(Debug, Default)]
struct ClusterIndex {
    /// Last block already folded in
    scanned_to: Option<u64>,
    clusters: HashMap<Vec<u64>, (LogPosition, ClusterSnapshot)>,
}

impl ClusterIndex {
    fn key(operator_ids: &[u64]) -> Vec<u64> {
        let mut ids = operator_ids.to_vec();
        ids.sort_unstable();
        ids
    }

    /// First block still to scan
    fn resume_from(&self, scan_from: u64) -> u64 {
        self.scanned_to.map_or(scan_from, |block| scan_from.max(block + 1))
    }

    fn mark_scanned(&mut self, block: u64) {
        self.scanned_to = self.scanned_to.max(Some(block));
    }

    /// Keep `cluster` unless a later event for the same set is already known
    fn record(&mut self, position: LogPosition, operator_ids: &[u64], cluster: ClusterSnapshot) {
        let entry = self
            .clusters
            .entry(Self::key(operator_ids))
            .or_insert((position, cluster));
        if entry.0 <= position {
            *entry = (position, cluster);
        }
    }

    fn get(&self, operator_ids: &[u64]) -> Option<ClusterSnapshot> {
        self.clusters
            .get(&Self::key(operator_ids))
            .map(|(_, cluster)| *cluster)
    }
}

/// Alloy-backed chain client
#[derive(Debug, Clone)]
pub struct RpcChainClient {
    config: RpcConfig,
    provider: DynProvider,
    signer: Address,
    clusters: Arc<Mutex<ClusterIndex>>,
}

impl RpcChainClient {
    /// Create a client that signs with `signer`
    ///
    /// # Errors
    /// Returns error if the RPC URL is invalid
    pub fn new(config: RpcConfig, signer: PrivateKeySigner) -> Result<Self> {
        let signer_address = signer.address();
        let url: reqwest::Url = config.rpc_url.parse().context("Invalid RPC URL")?;
        let provider = ProviderBuilder::new()
            .wallet(EthereumWallet::from(signer))
            .connect_http(url)
            .erased();

        info!(address = %signer_address, "Chain client initialized with signer");

        Ok(Self {
            config,
            provider,
            signer: signer_address,
            clusters: Arc::new(Mutex::new(ClusterIndex::default())),
        })
    }

    /// Underlying provider, shared with the event source
    #[must_use]
    pub fn provider(&self) -> DynProvider {
        self.provider.clone()
    }

    fn manager(&self) -> IManager::IManagerInstance<&DynProvider> {
        IManager::new(self.config.manager, &self.provider)
    }

    async fn confirm(&self, label: &str, pending: PendingTransactionBuilder<Ethereum>) -> Result<B256> {
        let tx_hash = *pending.tx_hash();
        info!(tx_hash = %tx_hash, label, "Transaction submitted");

        let receipt = pending
            .with_required_confirmations(self.config.confirmations)
            .get_receipt()
            .await
            .context("Failed to get transaction receipt")?;

        if !receipt.status() {
            bail!("{label} reverted: {tx_hash}");
        }

        info!(
            tx_hash = %tx_hash,
            label,
            gas_used = receipt.gas_used,
            "Transaction confirmed"
        );
        Ok(tx_hash)
    }

    /// Latest SSV cluster event for the manager, by operator set
    ///
    /// Each call only scans blocks added since the previous one.
    async fn scan_cluster(&self, operator_ids: &[u64]) -> Result<Option<ClusterSnapshot>> {
        let head = self.provider.get_block_number().await?;
        let filter = Filter::new()
            .address(self.config.ssv_network)
            .event_signature(vec![
                ISSVNetwork::ValidatorAdded::SIGNATURE_HASH,
                ISSVNetwork::ValidatorRemoved::SIGNATURE_HASH,
                ISSVNetwork::ClusterLiquidated::SIGNATURE_HASH,
                ISSVNetwork::ClusterReactivated::SIGNATURE_HASH,
                ISSVNetwork::ClusterWithdrawn::SIGNATURE_HASH,
                ISSVNetwork::ClusterDeposited::SIGNATURE_HASH,
            ])
            .topic1(self.config.manager.into_word());

        let chunk = self.config.log_chunk.max(1);
        let mut from = self.clusters.lock().resume_from(self.config.cluster_scan_from);
        while from <= head {
            let to = head.min(from + chunk - 1);
            let logs = self
                .provider
                .get_logs(&filter.clone().from_block(from).to_block(to))
                .await?;

            let mut decoded = Vec::with_capacity(logs.len());
            for log in logs.iter().filter(|log| !log.removed) {
                if let Some((ids, cluster)) = decode_cluster_event(log)? {
                    let position = (
                        log.block_number.unwrap_or(to),
                        log.log_index.unwrap_or_default(),
                    );
                    decoded.push((position, ids, cluster));
                }
            }

            {
                let mut index = self.clusters.lock();
                for (position, ids, cluster) in decoded {
                    index.record(position, &ids, ClusterSnapshot::from(cluster));
                }
                index.mark_scanned(to);
            }

            debug!(from, to, "Scanned SSV cluster events");
            from = to + 1;
        }
        Ok(self.clusters.lock().get(operator_ids))
    }
}

fn decode_cluster_event(log: &Log) -> Result<Option<(Vec<u64>, Cluster)>> {
    let Some(topic) = log.topic0().copied() else {
        return Ok(None);
    };
    let decoded = match topic {
        ISSVNetwork::ValidatorAdded::SIGNATURE_HASH => {
            let e = log.log_decode::<ISSVNetwork::ValidatorAdded>()?.inner.data;
            (e.operatorIds, e.cluster)
        }
        ISSVNetwork::ValidatorRemoved::SIGNATURE_HASH => {
            let e = log.log_decode::<ISSVNetwork::ValidatorRemoved>()?.inner.data;
            (e.operatorIds, e.cluster)
        }
        ISSVNetwork::ClusterLiquidated::SIGNATURE_HASH => {
            let e = log.log_decode::<ISSVNetwork::ClusterLiquidated>()?.inner.data;
            (e.operatorIds, e.cluster)
        }
        ISSVNetwork::ClusterReactivated::SIGNATURE_HASH => {
            let e = log.log_decode::<ISSVNetwork::ClusterReactivated>()?.inner.data;
            (e.operatorIds, e.cluster)
        }
        ISSVNetwork::ClusterWithdrawn::SIGNATURE_HASH => {
            let e = log.log_decode::<ISSVNetwork::ClusterWithdrawn>()?.inner.data;
            (e.operatorIds, e.cluster)
        }
        ISSVNetwork::ClusterDeposited::SIGNATURE_HASH => {
            let e = log.log_decode::<ISSVNetwork::ClusterDeposited>()?.inner.data;
            (e.operatorIds, e.cluster)
        }
        _ => return Ok(None),
    };
    Ok(Some(decoded))
}

#[async_trait]
impl ChainClient for RpcChainClient {
    fn signer_address(&self) -> Address {
        self.signer
    }

    async fn pool_ids(&self, queue: PoolQueue) -> Result<Vec<u32>> {
        let manager = self.manager();
        let ids = match queue {
            PoolQueue::Pending => manager.getPendingPoolIds().call().await?,
            PoolQueue::Staked => manager.getStakedPoolIds().call().await?,
        };
        debug!(?queue, count = ids.len(), "Fetched pool ids");
        Ok(ids)
    }

    async fn pool(&self, pool_id: u32) -> Result<Pool> {
        let details = self.manager().getPoolDetails(pool_id).call().await?;
        Ok(Pool {
            id: details.id,
            status: PoolStatus::try_from(details.status)?,
            public_key: details.publicKey,
            operator_ids: details.operatorIds,
            balance: details.balance,
            reshare_count: details.reshares.saturating_to(),
        })
    }

    async fn operator_ids(&self) -> Result<Vec<u64>> {
        let registry = IRegistry::new(self.config.registry, &self.provider);
        Ok(registry.getOperatorIds().call().await?)
    }

    async fn operator(&self, operator_id: u64) -> Result<Operator> {
        let registry = IRegistry::new(self.config.registry, &self.provider);
        let op = registry.getOperator(operator_id).call().await?;
        Ok(Operator {
            id: op.id,
            active: op.active,
            resharing: op.resharing,
            collateral: op.collateral,
            pool_count: op.poolCount.saturating_to(),
        })
    }

    async fn requested_completed_exits(&self) -> Result<u64> {
        let requested = self.manager().getRequestedCompletedExits().call().await?;
        Ok(requested.saturating_to())
    }

    async fn next_pool_address(&self) -> Result<Address> {
        let nonce = self
            .provider
            .get_transaction_count(self.config.manager)
            .await?;
        Ok(self.config.manager.create(nonce))
    }

    #[instrument(skip(self))]
    async fn required_cluster_fee(&self, operator_ids: &[u64]) -> Result<U256> {
        let views = ISSVViews::new(self.config.views, &self.provider);
        let fees = try_join_all(operator_ids.iter().map(|id| {
            let views = &views;
            async move { views.getOperatorFee(*id).call().await }
        }))
        .await?;
        let network_fee = views.getNetworkFee().call().await?;
        let period = views.getLiquidationThresholdPeriod().call().await?;

        let per_block = fees.into_iter().fold(network_fee, |acc, fee| acc + fee);
        Ok(per_block * U256::from(period))
    }

    async fn cluster(&self, operator_ids: &[u64]) -> Result<ClusterSnapshot> {
        Ok(self.scan_cluster(operator_ids).await?.unwrap_or_default())
    }

    async fn cluster_balance(&self, operator_ids: &[u64], cluster: &ClusterSnapshot) -> Result<U256> {
        let views = ISSVViews::new(self.config.views, &self.provider);
        Ok(views
            .getBalance(self.config.manager, operator_ids.to_vec(), Cluster::from(*cluster))
            .call()
            .await?)
    }

    async fn subscription_balance(&self, target: &FundingTarget) -> Result<U256> {
        let manager = self.manager();
        match target {
            FundingTarget::Functions => Ok(manager.getFunctionsBalance().call().await?),
            FundingTarget::Upkeep => Ok(manager.getUpkeepBalance().call().await?),
            FundingTarget::Cluster { .. } => bail!("cluster balances are read per cluster"),
        }
    }

    async fn token_balance(&self, token: Address, holder: Holder) -> Result<U256> {
        let account = match holder {
            Holder::Treasury => self.config.manager,
            Holder::Wallet => self.signer,
        };
        let erc20 = IERC20::new(token, &self.provider);
        Ok(erc20.balanceOf(account).call().await?)
    }

    async fn transfer_to_treasury(&self, token: Address, amount: U256) -> Result<B256> {
        let erc20 = IERC20::new(token, &self.provider);
        let pending = erc20
            .transfer(self.config.manager, amount)
            .send()
            .await
            .context("Failed to send transfer")?;
        self.confirm("transfer", pending).await
    }

    async fn deposit_funding(&self, target: &FundingTarget, payment: FeePayment) -> Result<B256> {
        let manager = self.manager();
        let FeePayment {
            fee_amount,
            min_token_amount,
            processed,
        } = payment;
        let pending = match target {
            FundingTarget::Functions => {
                manager
                    .depositFunctionsBalance(fee_amount, min_token_amount, processed)
                    .send()
                    .await?
            }
            FundingTarget::Upkeep => {
                manager
                    .depositUpkeepBalance(fee_amount, min_token_amount, processed)
                    .send()
                    .await?
            }
            FundingTarget::Cluster { operator_ids } => {
                let cluster = self.cluster(operator_ids).await?;
                manager
                    .depositClusterBalance(
                        operator_ids.clone(),
                        cluster.into(),
                        fee_amount,
                        min_token_amount,
                        processed,
                    )
                    .send()
                    .await?
            }
        };
        self.confirm("deposit funding", pending).await
    }

    #[instrument(skip(self, initiation), fields(pool_id = initiation.pool_id))]
    async fn initiate_pool(&self, initiation: &PoolInitiation) -> Result<B256> {
        let validator = &initiation.validator;
        let deposit = &validator.deposit_data;
        let pending = self
            .manager()
            .initiatePool(
                initiation.pool_id,
                deposit.deposit_data_root,
                deposit.pubkey.clone(),
                deposit.signature.clone(),
                deposit.withdrawal_credentials,
                validator.operator_ids.clone(),
                validator.shares.clone(),
                initiation.cluster.into(),
                initiation.payment.fee_amount,
                initiation.payment.min_token_amount,
                initiation.payment.processed,
            )
            .send()
            .await
            .context("Failed to send initiatePool")?;
        self.confirm("initiatePool", pending).await
    }

    #[instrument(skip(self))]
    async fn activate_pool(&self, pool_id: u32) -> Result<B256> {
        let pending = self
            .manager()
            .activatePool(pool_id)
            .send()
            .await
            .context("Failed to send activatePool")?;
        self.confirm("activatePool", pending).await
    }

    #[instrument(skip(self, submission), fields(pool_id = submission.pool_id))]
    async fn reshare_pool(&self, submission: &ReshareSubmission) -> Result<B256> {
        let pending = self
            .manager()
            .resharePool(
                submission.pool_id,
                submission.reshare.operator_ids.clone(),
                submission.new_operator_id,
                submission.old_operator_id,
                submission.reshare.shares.clone(),
                submission.cluster.into(),
                submission.old_cluster.into(),
                submission.payment.fee_amount,
                submission.payment.min_token_amount,
                submission.payment.processed,
            )
            .send()
            .await
            .context("Failed to send resharePool")?;
        self.confirm("resharePool", pending).await
    }

    #[instrument(skip(self))]
    async fn request_pool_exit(&self, pool_id: u32) -> Result<B256> {
        let pending = self
            .manager()
            .requestPoolExit(pool_id)
            .send()
            .await
            .context("Failed to send requestPoolExit")?;
        self.confirm("requestPoolExit", pending).await
    }

    #[instrument(skip(self, report), fields(pool_id = report.pool_id))]
    async fn report_completed_exit(&self, report: &CompletedExitReport) -> Result<B256> {
        let pending = self
            .manager()
            .reportCompletedExit(report.pool_id, report.blame_percents, report.cluster.into())
            .send()
            .await
            .context("Failed to send reportCompletedExit")?;
        self.confirm("reportCompletedExit", pending).await
    }

    #[instrument(skip(self))]
    async fn report_forced_exits(&self, pool_ids: &[u32]) -> Result<B256> {
        let pending = self
            .manager()
            .reportForcedExits(pool_ids.to_vec())
            .send()
            .await
            .context("Failed to send reportForcedExits")?;
        self.confirm("reportForcedExits", pending).await
    }
}
