//! Funding Manager
//!
//! Keeps the functions subscription, the automation upkeep and SSV cluster
//! balances above their thresholds. Fee tokens come from the treasury, the
//! oracle wallet, or a swap quoted from the base asset, in that order.

use crate::chain::{ChainClient, FundingTarget, Holder};
use crate::quoter::SwapQuoter;
use alloy::primitives::{Address, B256, U256};
use anyhow::{bail, Result};
use oracle_core::{
    choose_funding_source, FeePayment, FundingAccount, FundingAccountKind, FundingSource,
    RetryPolicy,
};
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// Tokens, swap route and thresholds
#[derive(Debug, Clone)]
pub struct FundingConfig {
    /// Fee token of the functions subscription and upkeep
    pub link_token: Address,
    /// Fee token of SSV clusters
    pub ssv_token: Address,
    /// Base asset swapped into fee tokens
    pub weth_token: Address,
    /// Swap pool fee tier (hundredths of a bip)
    pub fee_tier: u32,
    pub functions_minimum: U256,
    pub functions_target: U256,
    pub upkeep_minimum: U256,
    pub upkeep_target: U256,
}

/// Funding decisions over the chain client and swap quoter
#[derive(Clone)]
pub struct FundingManager {
    chain: Arc<dyn ChainClient>,
    quoter: Arc<dyn SwapQuoter>,
    config: FundingConfig,
    retry: RetryPolicy,
}

impl FundingManager {
    #[must_use]
    pub fn new(
        chain: Arc<dyn ChainClient>,
        quoter: Arc<dyn SwapQuoter>,
        config: FundingConfig,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            chain,
            quoter,
            config,
            retry,
        }
    }

    fn fee_token(&self, kind: FundingAccountKind) -> Address {
        match kind {
            FundingAccountKind::Functions | FundingAccountKind::Upkeep => self.config.link_token,
            FundingAccountKind::Cluster => self.config.ssv_token,
        }
    }

    /// Current state of a subscription account
    ///
    /// # Errors
    /// Returns error for cluster targets or once the read budget is spent
    pub async fn account(&self, target: &FundingTarget) -> Result<FundingAccount> {
        let (minimum_threshold, refill_target) = match target {
            FundingTarget::Functions => (self.config.functions_minimum, self.config.functions_target),
            FundingTarget::Upkeep => (self.config.upkeep_minimum, self.config.upkeep_target),
            FundingTarget::Cluster { .. } => bail!("cluster accounts are sized per fee"),
        };
        let chain = self.chain.as_ref();
        let balance = self
            .retry
            .run("subscription balance", move || chain.subscription_balance(target))
            .await?;
        Ok(FundingAccount {
            kind: target.kind(),
            balance,
            minimum_threshold,
            refill_target,
        })
    }

    /// Refill a subscription account if it is below its threshold
    ///
    /// Returns the deposit transaction, `None` if no refill was needed.
    ///
    /// # Errors
    /// Returns error if a read, quote or deposit fails
    #[instrument(skip(self))]
    pub async fn check_and_refill(&self, target: &FundingTarget) -> Result<Option<B256>> {
        let account = self.account(target).await?;
        self.refill(target, &account).await
    }

    /// Refill the functions subscription and the upkeep
    ///
    /// # Errors
    /// Returns the first refill failure
    pub async fn check_and_refill_all(&self) -> Result<()> {
        for target in [FundingTarget::Functions, FundingTarget::Upkeep] {
            self.check_and_refill(&target).await?;
        }
        Ok(())
    }

    /// Top up the SSV cluster of `operator_ids` to `required_fee`
    ///
    /// # Errors
    /// Returns error if a read, quote or deposit fails
    #[instrument(skip(self, required_fee))]
    pub async fn refill_cluster(&self, operator_ids: &[u64], required_fee: U256) -> Result<Option<B256>> {
        let chain = self.chain.as_ref();
        let balance = self
            .retry
            .run("cluster balance", move || async move {
                let cluster = chain.cluster(operator_ids).await?;
                chain.cluster_balance(operator_ids, &cluster).await
            })
            .await?;
        let account = FundingAccount {
            kind: FundingAccountKind::Cluster,
            balance,
            minimum_threshold: required_fee,
            refill_target: required_fee,
        };
        let target = FundingTarget::Cluster {
            operator_ids: operator_ids.to_vec(),
        };
        self.refill(&target, &account).await
    }

    async fn refill(&self, target: &FundingTarget, account: &FundingAccount) -> Result<Option<B256>> {
        let Some(amount) = account.shortfall() else {
            debug!(
                account = account.kind.as_str(),
                balance = %account.balance,
                "Funding account above threshold"
            );
            return Ok(None);
        };

        let payment = self.payment_for(account.kind, amount).await?;
        let tx_hash = self.chain.deposit_funding(target, payment).await?;
        info!(
            account = account.kind.as_str(),
            amount = %amount,
            processed = payment.processed,
            tx_hash = %tx_hash,
            "Funding account refilled"
        );
        Ok(Some(tx_hash))
    }

    /// Payment covering `amount` of the fee token for `kind`
    ///
    /// A zero amount needs no payment. Otherwise the treasury is used if it
    /// already holds the amount, then the oracle wallet (transferred to the
    /// treasury first), and finally a swap quote from the base asset.
    ///
    /// # Errors
    /// Returns error if a balance read, transfer or quote fails
    pub async fn payment_for(&self, kind: FundingAccountKind, amount: U256) -> Result<FeePayment> {
        if amount.is_zero() {
            return Ok(FeePayment::none());
        }

        let token = self.fee_token(kind);
        let chain = self.chain.as_ref();
        let treasury = self
            .retry
            .run("treasury balance", move || chain.token_balance(token, Holder::Treasury))
            .await?;
        let wallet = self
            .retry
            .run("wallet balance", move || chain.token_balance(token, Holder::Wallet))
            .await?;

        let source = choose_funding_source(treasury, wallet, amount);
        let payment = match source {
            FundingSource::Treasury => FeePayment::in_hand(amount),
            FundingSource::Wallet => {
                self.chain.transfer_to_treasury(token, amount).await?;
                FeePayment::in_hand(amount)
            }
            FundingSource::Swap => {
                let quoter = self.quoter.as_ref();
                let (base, fee_tier) = (self.config.weth_token, self.config.fee_tier);
                let amount_in = self
                    .retry
                    .run("swap quote", move || {
                        quoter.quote_exact_output(base, token, fee_tier, amount)
                    })
                    .await?;
                FeePayment::swap(amount_in, amount)
            }
        };

        debug!(
            account = kind.as_str(),
            source = source.as_str(),
            amount = %amount,
            "Funding source chosen"
        );
        metrics::counter!(
            "oracle_funding_refills_total",
            "account" => kind.as_str(),
            "source" => source.as_str()
        )
        .increment(1);
        Ok(payment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{funding_config, MockChain, MockQuoter, Submitted};

    fn manager(chain: &Arc<MockChain>) -> FundingManager {
        FundingManager::new(
            chain.clone(),
            Arc::new(MockQuoter::new(3)),
            funding_config(),
            RetryPolicy::once(),
        )
    }

    #[tokio::test]
    async fn test_no_refill_above_threshold() {
        let chain = Arc::new(MockChain::default());
        chain.set_subscription_balance(FundingTarget::Functions, U256::from(500));

        let result = manager(&chain)
            .check_and_refill(&FundingTarget::Functions)
            .await
            .unwrap();

        assert_eq!(result, None);
        assert!(chain.submitted().is_empty());
    }

    #[tokio::test]
    async fn test_refill_from_treasury() {
        let chain = Arc::new(MockChain::default());
        chain.set_subscription_balance(FundingTarget::Upkeep, U256::from(40));
        chain.set_token_balance(funding_config().link_token, Holder::Treasury, U256::from(1_000));

        manager(&chain)
            .check_and_refill(&FundingTarget::Upkeep)
            .await
            .unwrap();

        assert_eq!(
            chain.submitted(),
            vec![Submitted::Deposit(
                FundingTarget::Upkeep,
                FeePayment::in_hand(U256::from(960))
            )]
        );
    }

    #[tokio::test]
    async fn test_refill_from_wallet_transfers_first() {
        let chain = Arc::new(MockChain::default());
        let link = funding_config().link_token;
        chain.set_subscription_balance(FundingTarget::Functions, U256::ZERO);
        chain.set_token_balance(link, Holder::Treasury, U256::from(10));
        chain.set_token_balance(link, Holder::Wallet, U256::from(5_000));

        manager(&chain)
            .check_and_refill(&FundingTarget::Functions)
            .await
            .unwrap();

        assert_eq!(
            chain.submitted(),
            vec![
                Submitted::Transfer(link, U256::from(1_000)),
                Submitted::Deposit(FundingTarget::Functions, FeePayment::in_hand(U256::from(1_000))),
            ]
        );
    }

    #[tokio::test]
    async fn test_refill_by_swap_is_unprocessed() {
        let chain = Arc::new(MockChain::default());
        chain.set_subscription_balance(FundingTarget::Functions, U256::from(99));

        manager(&chain)
            .check_and_refill(&FundingTarget::Functions)
            .await
            .unwrap();

        // 901 LINK short, quoted at 3 base units per token
        assert_eq!(
            chain.submitted(),
            vec![Submitted::Deposit(
                FundingTarget::Functions,
                FeePayment::swap(U256::from(2_703), U256::from(901))
            )]
        );
    }

    #[tokio::test]
    async fn test_cluster_refill_covers_fee_shortfall() {
        let chain = Arc::new(MockChain::default());
        chain.set_cluster_balance(&[1, 2, 3, 4], U256::from(30));
        chain.set_token_balance(funding_config().ssv_token, Holder::Treasury, U256::from(1_000));

        manager(&chain)
            .refill_cluster(&[1, 2, 3, 4], U256::from(100))
            .await
            .unwrap();

        assert_eq!(
            chain.submitted(),
            vec![Submitted::Deposit(
                FundingTarget::Cluster {
                    operator_ids: vec![1, 2, 3, 4]
                },
                FeePayment::in_hand(U256::from(70))
            )]
        );
    }

    #[tokio::test]
    async fn test_zero_amount_needs_no_payment() {
        let chain = Arc::new(MockChain::default());
        let payment = manager(&chain)
            .payment_for(FundingAccountKind::Cluster, U256::ZERO)
            .await
            .unwrap();
        assert!(payment.is_none());
    }
}
