//! Chain Client
//!
//! Typed reads and confirmed writes against the protocol contracts. Every
//! write returns only after the configured confirmations are observed.

use alloy::primitives::{Address, B256, U256};
use anyhow::Result;
use async_trait::async_trait;
use oracle_core::{BlamePercents, ClusterSnapshot, FeePayment, Operator, Pool, Reshare, Validator};

/// Pool id lists kept by the manager contract
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolQueue {
    /// Deposit initiated, not yet activated
    Pending,
    /// Activated, including pools that are exiting
    Staked,
}

/// Holder of a token balance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Holder {
    /// The manager contract
    Treasury,
    /// The oracle signer
    Wallet,
}

/// An account the oracle can deposit fee tokens into
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FundingTarget {
    Functions,
    Upkeep,
    Cluster { operator_ids: Vec<u64> },
}

impl FundingTarget {
    #[must_use]
    pub fn kind(&self) -> oracle_core::FundingAccountKind {
        match self {
            Self::Functions => oracle_core::FundingAccountKind::Functions,
            Self::Upkeep => oracle_core::FundingAccountKind::Upkeep,
            Self::Cluster { .. } => oracle_core::FundingAccountKind::Cluster,
        }
    }
}

/// Deposit-initiation transaction for a READY pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolInitiation {
    pub pool_id: u32,
    pub validator: Validator,
    pub cluster: ClusterSnapshot,
    pub payment: FeePayment,
}

/// Operator swap for a live pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReshareSubmission {
    pub pool_id: u32,
    pub old_operator_id: u64,
    pub new_operator_id: u64,
    pub reshare: Reshare,
    pub cluster: ClusterSnapshot,
    pub old_cluster: ClusterSnapshot,
    pub payment: FeePayment,
}

/// Completed exit with blame and the cluster it leaves
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedExitReport {
    pub pool_id: u32,
    pub blame_percents: BlamePercents,
    pub cluster: ClusterSnapshot,
}

#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Address the oracle signs with
    fn signer_address(&self) -> Address;

    async fn pool_ids(&self, queue: PoolQueue) -> Result<Vec<u32>>;

    async fn pool(&self, pool_id: u32) -> Result<Pool>;

    async fn operator_ids(&self) -> Result<Vec<u64>>;

    async fn operator(&self, operator_id: u64) -> Result<Operator>;

    /// Completed exit reports the manager has requested and not yet received
    async fn requested_completed_exits(&self) -> Result<u64>;

    /// Address the next pool contract will be deployed at
    async fn next_pool_address(&self) -> Result<Address>;

    /// SSV fee needed to register a validator with `operator_ids`
    async fn required_cluster_fee(&self, operator_ids: &[u64]) -> Result<U256>;

    /// Current SSV cluster for the manager and `operator_ids`
    async fn cluster(&self, operator_ids: &[u64]) -> Result<ClusterSnapshot>;

    /// Live SSV balance of a cluster
    async fn cluster_balance(&self, operator_ids: &[u64], cluster: &ClusterSnapshot) -> Result<U256>;

    /// LINK balance of the functions subscription or upkeep
    async fn subscription_balance(&self, target: &FundingTarget) -> Result<U256>;

    async fn token_balance(&self, token: Address, holder: Holder) -> Result<U256>;

    async fn transfer_to_treasury(&self, token: Address, amount: U256) -> Result<B256>;

    async fn deposit_funding(&self, target: &FundingTarget, payment: FeePayment) -> Result<B256>;

    async fn initiate_pool(&self, initiation: &PoolInitiation) -> Result<B256>;

    async fn activate_pool(&self, pool_id: u32) -> Result<B256>;

    async fn reshare_pool(&self, submission: &ReshareSubmission) -> Result<B256>;

    async fn request_pool_exit(&self, pool_id: u32) -> Result<B256>;

    async fn report_completed_exit(&self, report: &CompletedExitReport) -> Result<B256>;

    async fn report_forced_exits(&self, pool_ids: &[u32]) -> Result<B256>;
}
