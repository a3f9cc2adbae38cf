//! Funding Decision Table
//!
//! Picks where the tokens for a refill or fee come from. Treasury funds are
//! preferred, then the oracle wallet, and only then a swap from the base asset.

use alloy::primitives::U256;
use serde::Serialize;

/// Where the tokens for a payment come from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FundingSource {
    /// The protocol treasury already holds the tokens
    Treasury,
    /// The oracle wallet holds the tokens and transfers them to the treasury
    Wallet,
    /// The contract swaps the base asset for the tokens during the call
    Swap,
}

impl FundingSource {
    /// Whether the tokens are in the treasury by the time the contract is called.
    ///
    /// This is the `processed` flag passed on chain: `false` asks the contract
    /// to swap before crediting.
    #[must_use]
    pub fn processed(self) -> bool {
        !matches!(self, Self::Swap)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Treasury => "treasury",
            Self::Wallet => "wallet",
            Self::Swap => "swap",
        }
    }
}

/// Choose the funding source for `required` tokens
#[must_use]
pub fn choose_funding_source(treasury: U256, wallet: U256, required: U256) -> FundingSource {
    if treasury >= required {
        FundingSource::Treasury
    } else if wallet >= required {
        FundingSource::Wallet
    } else {
        FundingSource::Swap
    }
}

/// Amounts passed to a contract call that spends or credits fee tokens
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FeePayment {
    /// Tokens in hand, or base asset to swap when not processed
    pub fee_amount: U256,
    /// Minimum fee tokens the contract must end up crediting
    pub min_token_amount: U256,
    pub processed: bool,
}

impl FeePayment {
    /// Nothing owed
    #[must_use]
    pub fn none() -> Self {
        Self {
            fee_amount: U256::ZERO,
            min_token_amount: U256::ZERO,
            processed: true,
        }
    }

    /// Tokens already in the treasury
    #[must_use]
    pub fn in_hand(amount: U256) -> Self {
        Self {
            fee_amount: amount,
            min_token_amount: amount,
            processed: true,
        }
    }

    /// Base asset the contract swaps for at least `amount_out` tokens
    #[must_use]
    pub fn swap(amount_in: U256, amount_out: U256) -> Self {
        Self {
            fee_amount: amount_in,
            min_token_amount: amount_out,
            processed: false,
        }
    }

    #[must_use]
    pub fn is_none(&self) -> bool {
        self.fee_amount.is_zero() && self.min_token_amount.is_zero()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_decision_table() {
        let cases = [
            // (treasury, wallet, required, expected)
            (10, 0, 10, FundingSource::Treasury),
            (10, 50, 5, FundingSource::Treasury),
            (9, 10, 10, FundingSource::Wallet),
            (0, 100, 100, FundingSource::Wallet),
            (9, 9, 10, FundingSource::Swap),
            (0, 0, 1, FundingSource::Swap),
        ];
        for (treasury, wallet, required, expected) in cases {
            assert_eq!(
                choose_funding_source(U256::from(treasury), U256::from(wallet), U256::from(required)),
                expected,
                "treasury={treasury} wallet={wallet} required={required}"
            );
        }
    }

    #[test]
    fn test_processed_flag() {
        assert!(FundingSource::Treasury.processed());
        assert!(FundingSource::Wallet.processed());
        assert!(!FundingSource::Swap.processed());
    }

    #[test]
    fn test_fee_payment_constructors() {
        assert!(FeePayment::none().is_none());
        assert!(FeePayment::none().processed);

        let swap = FeePayment::swap(U256::from(3), U256::from(40));
        assert_eq!(swap.fee_amount, U256::from(3));
        assert_eq!(swap.min_token_amount, U256::from(40));
        assert!(!swap.processed);

        let held = FeePayment::in_hand(U256::from(40));
        assert!(held.processed);
        assert_eq!(held.fee_amount, held.min_token_amount);
    }

    proptest! {
        #[test]
        fn prop_priority_order(treasury in 0u64..1000, wallet in 0u64..1000, required in 1u64..1000) {
            let source = choose_funding_source(
                U256::from(treasury),
                U256::from(wallet),
                U256::from(required),
            );
            let expected = if treasury >= required {
                FundingSource::Treasury
            } else if wallet >= required {
                FundingSource::Wallet
            } else {
                FundingSource::Swap
            };
            prop_assert_eq!(source, expected);
            prop_assert_eq!(source.processed(), treasury >= required || wallet >= required);
        }
    }
}
