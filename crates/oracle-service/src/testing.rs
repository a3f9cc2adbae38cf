//! In-memory collaborators for service tests.

use crate::chain::{
    ChainClient, CompletedExitReport, FundingTarget, Holder, PoolInitiation, PoolQueue,
    ReshareSubmission,
};
use crate::events::{into_batches, EventBatch, EventSource, ObservedEvent};
use crate::funding::{FundingConfig, FundingManager};
use crate::operators::OperatorDirectory;
use crate::orchestrator::Orchestrator;
use crate::quoter::SwapQuoter;
use alloy::primitives::{address, keccak256, Address, Bytes, B256, U256};
use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use oracle_core::ceremony::{KeygenRequest, ReshareRequest};
use oracle_core::{
    protocol, withdrawal_credentials, BeaconApi, BeaconValidator, CeremonyClient, CeremonyConfig,
    CeremonyEngine, CeremonyError, ClusterSnapshot, DepositData, FeePayment, KeyShares, Operator,
    Pool, PoolStatus, RetryPolicy, ValidatorStatus,
};
use oracle_core::beacon_client::BeaconClientError;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

pub const SIGNER: Address = address!("00000000000000000000000000000000000000f0");
pub const NEXT_POOL_ADDRESS: Address = address!("00000000000000000000000000000000000000aa");

/// A write the mock chain accepted
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Submitted {
    Transfer(Address, U256),
    Deposit(FundingTarget, FeePayment),
    InitiatePool(PoolInitiation),
    ActivatePool(u32),
    ResharePool(ReshareSubmission),
    RequestExit(u32),
    CompletedExit(CompletedExitReport),
    ForcedExits(Vec<u32>),
}

pub fn operator(id: u64, pool_count: u64) -> Operator {
    Operator {
        id,
        active: true,
        resharing: false,
        collateral: protocol::ETHER * U256::from(10),
        pool_count,
    }
}

pub fn pool_public_key(pool_id: u32) -> Bytes {
    let mut key = vec![0xab; 48];
    key[..4].copy_from_slice(&pool_id.to_be_bytes());
    Bytes::from(key)
}

pub fn staked_pool(id: u32, operator_ids: Vec<u64>, reshare_count: u64) -> Pool {
    Pool {
        id,
        status: PoolStatus::Staked,
        public_key: pool_public_key(id),
        operator_ids,
        balance: protocol::FULL_STAKE,
        reshare_count,
    }
}

pub fn funding_config() -> FundingConfig {
    FundingConfig {
        link_token: address!("0000000000000000000000000000000000001001"),
        ssv_token: address!("0000000000000000000000000000000000001002"),
        weth_token: address!("0000000000000000000000000000000000001003"),
        fee_tier: 3000,
        functions_minimum: U256::from(100),
        functions_target: U256::from(1_000),
        upkeep_minimum: U256::from(100),
        upkeep_target: U256::from(1_000),
    }
}

#[derive(Default)]
struct ChainState {
    pools: BTreeMap<u32, Pool>,
    operators: BTreeMap<u64, Operator>,
    subscription_balances: HashMap<FundingTarget, U256>,
    token_balances: HashMap<(Address, Holder), U256>,
    cluster_balances: HashMap<Vec<u64>, U256>,
    requested_completed_exits: u64,
    submitted: Vec<Submitted>,
    fail_writes: bool,
    fail_subscription_reads: bool,
}

impl ChainState {
    fn pool_mut(&mut self, pool_id: u32) -> Result<&mut Pool> {
        self.pools
            .get_mut(&pool_id)
            .ok_or_else(|| anyhow!("execution reverted: unknown pool {pool_id}"))
    }
}

/// Contract state kept in memory; writes apply their status transitions
#[derive(Default)]
pub struct MockChain {
    state: Mutex<ChainState>,
}

fn sorted(operator_ids: &[u64]) -> Vec<u64> {
    let mut ids = operator_ids.to_vec();
    ids.sort_unstable();
    ids
}

impl MockChain {
    pub fn add_pool(&self, pool: Pool) {
        self.state.lock().pools.insert(pool.id, pool);
    }

    pub fn add_ready_pool(&self, pool_id: u32) {
        self.add_pool(Pool {
            id: pool_id,
            status: PoolStatus::Ready,
            public_key: Bytes::new(),
            operator_ids: Vec::new(),
            balance: protocol::FULL_STAKE,
            reshare_count: 0,
        });
    }

    pub fn add_operator(&self, operator: Operator) {
        self.state.lock().operators.insert(operator.id, operator);
    }

    pub fn pool_status(&self, pool_id: u32) -> Option<PoolStatus> {
        self.state.lock().pools.get(&pool_id).map(|p| p.status)
    }

    pub fn pool_public_key(&self, pool_id: u32) -> Bytes {
        self.state
            .lock()
            .pools
            .get(&pool_id)
            .map(|p| p.public_key.clone())
            .unwrap_or_default()
    }

    pub fn set_subscription_balance(&self, target: FundingTarget, balance: U256) {
        self.state
            .lock()
            .subscription_balances
            .insert(target, balance);
    }

    pub fn set_token_balance(&self, token: Address, holder: Holder, balance: U256) {
        self.state
            .lock()
            .token_balances
            .insert((token, holder), balance);
    }

    pub fn set_cluster_balance(&self, operator_ids: &[u64], balance: U256) {
        self.state
            .lock()
            .cluster_balances
            .insert(sorted(operator_ids), balance);
    }

    /// Record a `CompletedExitReportsRequested(count)` on the manager
    pub fn request_completed_exits(&self, count: u64) {
        self.state.lock().requested_completed_exits += count;
    }

    pub fn fail_writes(&self, fail: bool) {
        self.state.lock().fail_writes = fail;
    }

    pub fn fail_subscription_reads(&self, fail: bool) {
        self.state.lock().fail_subscription_reads = fail;
    }

    pub fn submitted(&self) -> Vec<Submitted> {
        self.state.lock().submitted.clone()
    }

    fn write(&self, submitted: Submitted, apply: impl FnOnce(&mut ChainState) -> Result<()>) -> Result<B256> {
        let mut state = self.state.lock();
        if state.fail_writes {
            bail!("execution reverted");
        }
        apply(&mut state)?;
        state.submitted.push(submitted);
        let count = state.submitted.len() as u64;
        Ok(B256::left_padding_from(&count.to_be_bytes()))
    }
}

#[async_trait]
impl ChainClient for MockChain {
    fn signer_address(&self) -> Address {
        SIGNER
    }

    async fn pool_ids(&self, queue: PoolQueue) -> Result<Vec<u32>> {
        let state = self.state.lock();
        Ok(state
            .pools
            .values()
            .filter(|p| match queue {
                PoolQueue::Pending => p.status == PoolStatus::Pending,
                PoolQueue::Staked => p.status == PoolStatus::Staked || p.status.is_exiting(),
            })
            .map(|p| p.id)
            .collect())
    }

    async fn pool(&self, pool_id: u32) -> Result<Pool> {
        self.state
            .lock()
            .pools
            .get(&pool_id)
            .cloned()
            .ok_or_else(|| anyhow!("unknown pool {pool_id}"))
    }

    async fn operator_ids(&self) -> Result<Vec<u64>> {
        Ok(self.state.lock().operators.keys().copied().collect())
    }

    async fn operator(&self, operator_id: u64) -> Result<Operator> {
        self.state
            .lock()
            .operators
            .get(&operator_id)
            .cloned()
            .ok_or_else(|| anyhow!("unknown operator {operator_id}"))
    }

    async fn requested_completed_exits(&self) -> Result<u64> {
        Ok(self.state.lock().requested_completed_exits)
    }

    async fn next_pool_address(&self) -> Result<Address> {
        Ok(NEXT_POOL_ADDRESS)
    }

    async fn required_cluster_fee(&self, operator_ids: &[u64]) -> Result<U256> {
        Ok(U256::from(operator_ids.iter().sum::<u64>()))
    }

    async fn cluster(&self, _operator_ids: &[u64]) -> Result<ClusterSnapshot> {
        Ok(ClusterSnapshot::default())
    }

    async fn cluster_balance(&self, operator_ids: &[u64], _cluster: &ClusterSnapshot) -> Result<U256> {
        Ok(self
            .state
            .lock()
            .cluster_balances
            .get(&sorted(operator_ids))
            .copied()
            .unwrap_or_default())
    }

    async fn subscription_balance(&self, target: &FundingTarget) -> Result<U256> {
        let state = self.state.lock();
        if state.fail_subscription_reads {
            bail!("rpc unavailable");
        }
        Ok(state
            .subscription_balances
            .get(target)
            .copied()
            .unwrap_or(U256::from(10_000)))
    }

    async fn token_balance(&self, token: Address, holder: Holder) -> Result<U256> {
        Ok(self
            .state
            .lock()
            .token_balances
            .get(&(token, holder))
            .copied()
            .unwrap_or_default())
    }

    async fn transfer_to_treasury(&self, token: Address, amount: U256) -> Result<B256> {
        self.write(Submitted::Transfer(token, amount), |_| Ok(()))
    }

    async fn deposit_funding(&self, target: &FundingTarget, payment: FeePayment) -> Result<B256> {
        self.write(Submitted::Deposit(target.clone(), payment), |_| Ok(()))
    }

    async fn initiate_pool(&self, initiation: &PoolInitiation) -> Result<B256> {
        self.write(Submitted::InitiatePool(initiation.clone()), |state| {
            let pool = state.pool_mut(initiation.pool_id)?;
            pool.status = PoolStatus::Pending;
            pool.public_key = initiation.validator.deposit_data.pubkey.clone();
            pool.operator_ids = initiation.validator.operator_ids.clone();
            Ok(())
        })
    }

    async fn activate_pool(&self, pool_id: u32) -> Result<B256> {
        self.write(Submitted::ActivatePool(pool_id), |state| {
            state.pool_mut(pool_id)?.status = PoolStatus::Staked;
            Ok(())
        })
    }

    async fn reshare_pool(&self, submission: &ReshareSubmission) -> Result<B256> {
        self.write(Submitted::ResharePool(submission.clone()), |state| {
            let pool = state.pool_mut(submission.pool_id)?;
            pool.operator_ids = submission.reshare.operator_ids.clone();
            pool.reshare_count += 1;
            Ok(())
        })
    }

    async fn request_pool_exit(&self, pool_id: u32) -> Result<B256> {
        self.write(Submitted::RequestExit(pool_id), |state| {
            state.pool_mut(pool_id)?.status = PoolStatus::ExitingRequested;
            Ok(())
        })
    }

    async fn report_completed_exit(&self, report: &CompletedExitReport) -> Result<B256> {
        self.write(Submitted::CompletedExit(report.clone()), |state| {
            if state.requested_completed_exits == 0 {
                bail!("execution reverted: no completed exit reports requested");
            }
            state.pool_mut(report.pool_id)?.status = PoolStatus::Withdrawn;
            state.requested_completed_exits -= 1;
            Ok(())
        })
    }

    async fn report_forced_exits(&self, pool_ids: &[u32]) -> Result<B256> {
        self.write(Submitted::ForcedExits(pool_ids.to_vec()), |state| {
            for &pool_id in pool_ids {
                state.pool_mut(pool_id)?.status = PoolStatus::ExitingForced;
            }
            Ok(())
        })
    }
}

/// Beacon node answering from a status table
#[derive(Default)]
pub struct MockBeacon {
    statuses: Mutex<HashMap<Bytes, ValidatorStatus>>,
}

impl MockBeacon {
    pub fn set_status(&self, public_key: &Bytes, status: ValidatorStatus) {
        self.statuses.lock().insert(public_key.clone(), status);
    }
}

#[async_trait]
impl BeaconApi for MockBeacon {
    async fn validator(
        &self,
        public_key: &Bytes,
        _slot: Option<u64>,
    ) -> Result<Option<BeaconValidator>, BeaconClientError> {
        Ok(self
            .statuses
            .lock()
            .get(public_key)
            .map(|&status| BeaconValidator {
                index: 1,
                balance_gwei: 32_000_000_000,
                status,
            }))
    }
}

/// Quotes at a fixed rate of base units per fee token
pub struct MockQuoter {
    rate: u64,
}

impl MockQuoter {
    pub fn new(rate: u64) -> Self {
        Self { rate }
    }
}

#[async_trait]
impl SwapQuoter for MockQuoter {
    async fn quote_exact_output(
        &self,
        _token_in: Address,
        _token_out: Address,
        _fee_tier: u32,
        amount_out: U256,
    ) -> Result<U256> {
        Ok(amount_out * U256::from(self.rate))
    }
}

/// Ceremony engine producing a distinct key per keygen request
#[derive(Default)]
pub struct MockEngine {
    keygens: Mutex<Vec<KeygenRequest>>,
    reshares: Mutex<Vec<ReshareRequest>>,
}

impl MockEngine {
    pub fn keygens(&self) -> usize {
        self.keygens.lock().len()
    }

    pub fn reshares(&self) -> usize {
        self.reshares.lock().len()
    }

    fn key_for(request_id: &str) -> Bytes {
        let hash = keccak256(request_id.as_bytes());
        let mut key = hash.to_vec();
        key.extend_from_slice(&hash[..16]);
        Bytes::from(key)
    }
}

#[async_trait]
impl CeremonyEngine for MockEngine {
    async fn ping(&self) -> Result<(), CeremonyError> {
        Ok(())
    }

    async fn start_keygen(&self, request: &KeygenRequest) -> Result<(), CeremonyError> {
        self.keygens.lock().push(request.clone());
        Ok(())
    }

    async fn start_reshare(&self, request: &ReshareRequest) -> Result<(), CeremonyError> {
        self.reshares.lock().push(request.clone());
        Ok(())
    }

    async fn shares(&self, request_id: &str) -> Result<KeyShares, CeremonyError> {
        let shares = Bytes::from(request_id.as_bytes().to_vec());
        if let Some(request) = self.keygens.lock().iter().find(|r| r.request_id == request_id) {
            return Ok(KeyShares {
                public_key: Self::key_for(request_id),
                operator_ids: request.operator_ids.clone(),
                shares,
            });
        }
        if let Some(request) = self.reshares.lock().iter().find(|r| r.request_id == request_id) {
            return Ok(KeyShares {
                public_key: request.public_key.clone(),
                operator_ids: request.operator_ids.clone(),
                shares,
            });
        }
        Err(CeremonyError::InvalidOutput(format!("unknown request {request_id}")))
    }

    async fn deposit_data(&self, request_id: &str) -> Result<DepositData, CeremonyError> {
        let keygens = self.keygens.lock();
        let request = keygens
            .iter()
            .find(|r| r.request_id == request_id)
            .ok_or_else(|| CeremonyError::InvalidOutput(format!("unknown request {request_id}")))?;
        Ok(DepositData {
            pubkey: Self::key_for(request_id),
            withdrawal_credentials: withdrawal_credentials(request.withdrawal_address),
            signature: Bytes::from(vec![0xcd; 96]),
            deposit_data_root: keccak256(request_id.as_bytes()),
        })
    }
}

/// Event source replaying a fixed list once, as one scan up to the head
pub struct MockEventSource {
    pending: Option<Vec<ObservedEvent>>,
    head: u64,
}

impl MockEventSource {
    pub fn new(events: Vec<ObservedEvent>) -> Self {
        let head = events.iter().map(|e| e.block).max().unwrap_or_default();
        Self {
            pending: Some(events),
            head,
        }
    }

    /// Chain head beyond the last event
    pub fn with_head(mut self, head: u64) -> Self {
        self.head = self.head.max(head);
        self
    }
}

#[async_trait]
impl EventSource for MockEventSource {
    async fn next_batches(&mut self) -> Result<Vec<EventBatch>> {
        Ok(self.pending.take().map(into_batches).unwrap_or_default())
    }

    async fn head_block(&self) -> Result<u64> {
        Ok(self.head)
    }

    fn scanned_through(&self) -> Option<u64> {
        self.pending.is_none().then_some(self.head)
    }
}

/// Orchestrator wired to mocks, with a registry of eight operators.
///
/// Operators 1-4 carry no pools, 5-7 carry one to three, 8 is inactive.
pub struct Harness {
    pub chain: Arc<MockChain>,
    pub beacon: Arc<MockBeacon>,
    pub engine: Arc<MockEngine>,
    pub funding: FundingManager,
    pub orchestrator: Orchestrator,
}

impl Harness {
    pub fn new() -> Self {
        let chain = Arc::new(MockChain::default());
        for id in 1..=4 {
            chain.add_operator(operator(id, 0));
        }
        for (id, pools) in [(5, 1), (6, 2), (7, 3)] {
            chain.add_operator(operator(id, pools));
        }
        let mut inactive = operator(8, 0);
        inactive.active = false;
        chain.add_operator(inactive);

        let beacon = Arc::new(MockBeacon::default());
        let engine = Arc::new(MockEngine::default());
        let retry = RetryPolicy::once();

        let ceremony = CeremonyClient::new(
            engine.clone(),
            CeremonyConfig {
                call_retry: retry,
                ceremony_retry: retry,
                settle_delay: Duration::ZERO,
            },
        );
        let funding = FundingManager::new(
            chain.clone(),
            Arc::new(MockQuoter::new(3)),
            funding_config(),
            retry,
        );
        let orchestrator = Orchestrator::new(
            chain.clone(),
            beacon.clone(),
            ceremony,
            OperatorDirectory::new(chain.clone(), retry),
            funding.clone(),
            retry,
        );

        Self {
            chain,
            beacon,
            engine,
            funding,
            orchestrator,
        }
    }
}
