//! Protocol Data Model
//!
//! Pools, operators, key material produced by ceremonies, SSV cluster
//! snapshots and funding accounts, as seen by the oracle.

use alloy::primitives::{Address, Bytes, B256, U256};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Protocol constants
pub mod protocol {
    use alloy::primitives::{uint, U256};

    /// Operators per validator cluster
    pub const CLUSTER_SIZE: usize = 4;
    /// Maximum reshares before a deactivation forces an exit
    pub const MAX_RESHARES: u64 = 2;
    /// One ether in wei
    pub const ETHER: U256 = uint!(1_000_000_000_000_000_000_U256);
    /// Collateral reserved per assigned pool (1 ETH)
    pub const COLLATERAL_PER_POOL: U256 = ETHER;
    /// Full validator stake (32 ETH)
    pub const FULL_STAKE: U256 = uint!(32_000_000_000_000_000_000_U256);
    /// Withdrawal credentials prefix for execution-address credentials
    pub const ETH1_ADDRESS_WITHDRAWAL_PREFIX: u8 = 0x01;
}

/// Violations of the pool invariants
#[derive(Debug, Error, PartialEq, Eq)]
pub enum InvariantError {
    #[error("Pool {0}: public key must be empty iff status is READY (status {1:?})")]
    PublicKeyStatusMismatch(u32, PoolStatus),

    #[error("Pool {pool_id}: expected {expected} operators, found {found}")]
    OperatorCount {
        pool_id: u32,
        expected: usize,
        found: usize,
    },

    #[error("Pool {0}: reshare count {1} exceeds cap")]
    ReshareCap(u32, u64),

    #[error("Unknown pool status code {0}")]
    UnknownStatus(u8),
}

/// Lifecycle status of a pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PoolStatus {
    /// Capital deposited, no validator yet
    Ready,
    /// Deposit initiated, waiting for beacon activation
    Pending,
    /// Validator active on the beacon chain
    Staked,
    /// Exit requested by the protocol or a user
    ExitingRequested,
    /// Exit forced by the network or a policy boundary
    ExitingForced,
    /// Exit reported and funds reconciled
    Withdrawn,
}

impl PoolStatus {
    /// Whether the pool is on its way out
    #[must_use]
    pub fn is_exiting(self) -> bool {
        matches!(self, Self::ExitingRequested | Self::ExitingForced)
    }

    /// Whether the pool still backs a live validator
    #[must_use]
    pub fn is_live(self) -> bool {
        matches!(self, Self::Pending | Self::Staked)
    }
}

impl TryFrom<u8> for PoolStatus {
    type Error = InvariantError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(Self::Ready),
            1 => Ok(Self::Pending),
            2 => Ok(Self::Staked),
            3 => Ok(Self::ExitingRequested),
            4 => Ok(Self::ExitingForced),
            5 => Ok(Self::Withdrawn),
            other => Err(InvariantError::UnknownStatus(other)),
        }
    }
}

/// One staking unit bound to at most one validator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pool {
    /// Contract-assigned pool id
    pub id: u32,
    /// Lifecycle status
    pub status: PoolStatus,
    /// Validator public key (empty while READY)
    pub public_key: Bytes,
    /// Cluster operators, in contract order
    pub operator_ids: Vec<u64>,
    /// Pool balance in wei
    pub balance: U256,
    /// Reshares performed so far
    pub reshare_count: u64,
}

impl Pool {
    /// Check the pool invariants against a snapshot read from chain.
    ///
    /// READY pools carry no key and no operators; every other status carries
    /// a key and exactly [`protocol::CLUSTER_SIZE`] operators.
    ///
    /// # Errors
    /// Returns the first violated invariant
    pub fn check_invariants(&self) -> Result<(), InvariantError> {
        let ready = self.status == PoolStatus::Ready;
        if ready != self.public_key.is_empty() {
            return Err(InvariantError::PublicKeyStatusMismatch(self.id, self.status));
        }

        let expected = if ready { 0 } else { protocol::CLUSTER_SIZE };
        if self.operator_ids.len() != expected {
            return Err(InvariantError::OperatorCount {
                pool_id: self.id,
                expected,
                found: self.operator_ids.len(),
            });
        }

        if self.reshare_count > protocol::MAX_RESHARES {
            return Err(InvariantError::ReshareCap(self.id, self.reshare_count));
        }

        Ok(())
    }

    /// Whether another reshare is allowed
    #[must_use]
    pub fn can_reshare(&self) -> bool {
        self.reshare_count < protocol::MAX_RESHARES
    }

    /// Whether the pool's cluster includes the operator
    #[must_use]
    pub fn has_operator(&self, operator_id: u64) -> bool {
        self.operator_ids.contains(&operator_id)
    }
}

/// A registered node operator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operator {
    pub id: u64,
    pub active: bool,
    pub resharing: bool,
    /// Collateral in wei
    pub collateral: U256,
    pub pool_count: u64,
}

impl Operator {
    /// Collateral not yet reserved by assigned pools
    #[must_use]
    pub fn available_collateral(&self) -> U256 {
        let reserved = protocol::COLLATERAL_PER_POOL.saturating_mul(U256::from(self.pool_count));
        self.collateral.saturating_sub(reserved)
    }

    /// Whether the operator can take on another pool
    #[must_use]
    pub fn is_eligible(&self) -> bool {
        self.active && !self.resharing && !self.available_collateral().is_zero()
    }
}

/// Deposit data produced by a keygen ceremony
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepositData {
    pub pubkey: Bytes,
    pub withdrawal_credentials: B256,
    pub signature: Bytes,
    pub deposit_data_root: B256,
}

/// Encrypted key shares for a cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyShares {
    /// Validator public key the shares belong to
    pub public_key: Bytes,
    /// Operators holding a share, in share order
    pub operator_ids: Vec<u64>,
    /// Concatenated share public keys and encrypted shares
    pub shares: Bytes,
}

/// Output of a keygen ceremony, ready for deposit initiation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Validator {
    pub deposit_data: DepositData,
    pub operator_ids: Vec<u64>,
    pub shares: Bytes,
}

/// Output of a reshare ceremony
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reshare {
    pub public_key: Bytes,
    pub old_operator_ids: Vec<u64>,
    pub operator_ids: Vec<u64>,
    pub shares: Bytes,
}

/// SSV cluster snapshot for an owner and operator set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterSnapshot {
    pub validator_count: u32,
    pub network_fee_index: u64,
    pub index: u64,
    pub active: bool,
    pub balance: U256,
}

impl Default for ClusterSnapshot {
    fn default() -> Self {
        Self {
            validator_count: 0,
            network_fee_index: 0,
            index: 0,
            active: true,
            balance: U256::ZERO,
        }
    }
}

/// External balances the oracle keeps topped up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FundingAccountKind {
    /// Oracle (functions) subscription, paid in LINK
    Functions,
    /// Automation upkeep, paid in LINK
    Upkeep,
    /// SSV cluster operating balance, paid in SSV
    Cluster,
}

impl FundingAccountKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Functions => "functions",
            Self::Upkeep => "upkeep",
            Self::Cluster => "cluster",
        }
    }
}

/// A funding account snapshot, re-derived on every check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FundingAccount {
    pub kind: FundingAccountKind,
    pub balance: U256,
    pub minimum_threshold: U256,
    pub refill_target: U256,
}

impl FundingAccount {
    /// Amount needed to bring the balance back to the refill target,
    /// or `None` while the balance is at or above the minimum threshold
    #[must_use]
    pub fn shortfall(&self) -> Option<U256> {
        if self.balance >= self.minimum_threshold {
            return None;
        }
        Some(self.refill_target.saturating_sub(self.balance)).filter(|a| !a.is_zero())
    }
}

/// Execution-address withdrawal credentials for `address`
#[must_use]
pub fn withdrawal_credentials(address: Address) -> B256 {
    let mut credentials = [0u8; 32];
    credentials[0] = protocol::ETH1_ADDRESS_WITHDRAWAL_PREFIX;
    credentials[12..].copy_from_slice(address.as_slice());
    B256::from(credentials)
}
