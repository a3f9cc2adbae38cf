//! Swap Quoter
//!
//! Prices an exact-output swap against a Uniswap V3 style quoter.

use crate::contracts::IQuoterV2;
use alloy::{
    primitives::{
        aliases::{U160, U24},
        Address, U256,
    },
    providers::DynProvider,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::debug;

/// Price source for token swaps
#[async_trait]
pub trait SwapQuoter: Send + Sync {
    /// Amount of `token_in` needed to receive exactly `amount_out` of `token_out`
    async fn quote_exact_output(
        &self,
        token_in: Address,
        token_out: Address,
        fee_tier: u32,
        amount_out: U256,
    ) -> Result<U256>;
}

/// Quoter contract reached over RPC
#[derive(Debug, Clone)]
pub struct UniswapQuoter {
    address: Address,
    provider: DynProvider,
}

impl UniswapQuoter {
    #[must_use]
    pub fn new(address: Address, provider: DynProvider) -> Self {
        Self { address, provider }
    }
}

#[async_trait]
impl SwapQuoter for UniswapQuoter {
    async fn quote_exact_output(
        &self,
        token_in: Address,
        token_out: Address,
        fee_tier: u32,
        amount_out: U256,
    ) -> Result<U256> {
        let quoter = IQuoterV2::new(self.address, &self.provider);
        let params = IQuoterV2::QuoteExactOutputSingleParams {
            tokenIn: token_in,
            tokenOut: token_out,
            amount: amount_out,
            fee: U24::try_from(fee_tier).context("Fee tier out of range")?,
            sqrtPriceLimitX96: U160::ZERO,
        };
        let quote = quoter
            .quoteExactOutputSingle(params)
            .call()
            .await
            .context("Swap quote failed")?;

        debug!(
            token_in = %token_in,
            token_out = %token_out,
            fee_tier,
            amount_out = %amount_out,
            amount_in = %quote.amountIn,
            "Swap quoted"
        );
        Ok(quote.amountIn)
    }
}
