//! Service Configuration
//!
//! Everything the daemon needs, read once from flags or the environment.

use crate::funding::FundingConfig;
use crate::rpc::{signer_from_mnemonic, signer_from_private_key, RpcConfig};
use alloy::primitives::{Address, U256};
use alloy::signers::local::PrivateKeySigner;
use anyhow::{Context, Result};
use clap::{ArgGroup, Parser};
use oracle_core::ceremony::{
    parse_operator_endpoints, CliCeremonyEngine, CliEngineConfig, HttpCeremonyEngine,
};
use oracle_core::{CeremonyConfig, CeremonyEngine, RetryPolicy};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug, Clone)]
#[command(name = "oracle-service")]
#[command(about = "Event-driven oracle for the staking protocol")]
#[command(group(ArgGroup::new("signer").required(true).args(["mnemonic", "private_key"])))]
#[command(group(ArgGroup::new("ceremony").required(true).args(["ceremony_url", "ceremony_cli"])))]
pub struct Args {
    /// Execution-layer RPC URL
    #[arg(long, env = "RPC_URL")]
    pub rpc_url: String,

    /// Beacon node URL, optionally with `user:pass@`
    #[arg(long, env = "BEACON_URL")]
    pub beacon_url: String,

    /// Timeout for one beacon API request
    #[arg(long, env = "BEACON_TIMEOUT_SECS", default_value_t = 30)]
    pub beacon_timeout_secs: u64,

    /// Staking manager contract
    #[arg(long, env = "MANAGER_ADDRESS")]
    pub manager_address: Address,

    /// Operator registry contract
    #[arg(long, env = "REGISTRY_ADDRESS")]
    pub registry_address: Address,

    /// SSV views contract
    #[arg(long, env = "VIEWS_ADDRESS")]
    pub views_address: Address,

    /// SSV network contract
    #[arg(long, env = "SSV_NETWORK_ADDRESS")]
    pub ssv_network_address: Address,

    #[arg(long, env = "LINK_TOKEN_ADDRESS")]
    pub link_token_address: Address,

    #[arg(long, env = "SSV_TOKEN_ADDRESS")]
    pub ssv_token_address: Address,

    #[arg(long, env = "WETH_TOKEN_ADDRESS")]
    pub weth_token_address: Address,

    /// Uniswap V3 quoter contract
    #[arg(long, env = "SWAP_QUOTER_ADDRESS")]
    pub swap_quoter_address: Address,

    /// Signer mnemonic
    #[arg(long, env = "MNEMONIC", hide_env_values = true)]
    pub mnemonic: Option<String>,

    /// Derivation path for the mnemonic
    #[arg(long, env = "MNEMONIC_PATH", default_value = "m/44'/60'/0'/0/0")]
    pub mnemonic_path: String,

    /// Signer private key (hex)
    #[arg(long, env = "PRIVATE_KEY", hide_env_values = true)]
    pub private_key: Option<String>,

    /// HTTP ceremony engine URL
    #[arg(long, env = "CEREMONY_URL")]
    pub ceremony_url: Option<String>,

    /// DKG CLI executable
    #[arg(long, env = "CEREMONY_CLI")]
    pub ceremony_cli: Option<PathBuf>,

    /// Operator DKG endpoints for the CLI, as `id=url,id=url`
    #[arg(long, env = "CEREMONY_OPERATORS", default_value = "")]
    pub ceremony_operators: String,

    /// Directory CLI ceremonies write their output under
    #[arg(long, env = "CEREMONY_OUTPUT_DIR", default_value = "./ceremonies")]
    pub ceremony_output_dir: PathBuf,

    /// Timeout for one ceremony engine call
    #[arg(long, env = "CEREMONY_TIMEOUT_SECS", default_value_t = 300)]
    pub ceremony_timeout_secs: u64,

    /// Wait between starting a ceremony and collecting its output
    #[arg(long, env = "CEREMONY_SETTLE_MS", default_value_t = 2500)]
    pub ceremony_settle_ms: u64,

    /// File holding the last handled event position
    #[arg(long, env = "CHECKPOINT_FILE")]
    pub checkpoint_file: Option<PathBuf>,

    /// JSON-lines file of handler failures
    #[arg(long, env = "ERROR_LOG_FILE")]
    pub error_log_file: Option<PathBuf>,

    /// First block to read events from when there is no checkpoint
    #[arg(long, env = "START_BLOCK", default_value_t = 0)]
    pub start_block: u64,

    /// First block to scan for SSV cluster events (defaults to START_BLOCK)
    #[arg(long, env = "CLUSTER_SCAN_FROM_BLOCK")]
    pub cluster_scan_from_block: Option<u64>,

    /// Blocks per log query
    #[arg(long, env = "LOG_CHUNK_BLOCKS", default_value_t = 5000)]
    pub log_chunk_blocks: u64,

    /// Confirmations to wait for on every transaction
    #[arg(long, env = "CONFIRMATIONS", default_value_t = 1)]
    pub confirmations: u64,

    /// Idle polling interval once caught up
    #[arg(long, env = "POLL_INTERVAL_SECS", default_value_t = 12)]
    pub poll_interval_secs: u64,

    /// Attempts for reads, quotes and ceremony calls
    #[arg(long, env = "RETRY_ATTEMPTS", default_value_t = 25)]
    pub retry_attempts: u32,

    /// Fixed delay between attempts
    #[arg(long, env = "RETRY_DELAY_MS", default_value_t = 2500)]
    pub retry_delay_ms: u64,

    /// Functions subscription refill threshold (LINK wei)
    #[arg(long, env = "FUNCTIONS_MIN_BALANCE", default_value = "1000000000000000000")]
    pub functions_min_balance: U256,

    /// Functions subscription refill target (LINK wei)
    #[arg(long, env = "FUNCTIONS_TARGET_BALANCE", default_value = "5000000000000000000")]
    pub functions_target_balance: U256,

    /// Upkeep refill threshold (LINK wei)
    #[arg(long, env = "UPKEEP_MIN_BALANCE", default_value = "1000000000000000000")]
    pub upkeep_min_balance: U256,

    /// Upkeep refill target (LINK wei)
    #[arg(long, env = "UPKEEP_TARGET_BALANCE", default_value = "5000000000000000000")]
    pub upkeep_target_balance: U256,

    /// Swap pool fee tier
    #[arg(long, env = "SWAP_FEE_TIER", default_value_t = 3000)]
    pub swap_fee_tier: u32,

    /// API listen address
    #[arg(long, env = "LISTEN", default_value = "0.0.0.0:8080")]
    pub listen: String,

    /// Metrics listen address
    #[arg(long, env = "METRICS_LISTEN", default_value = "0.0.0.0:9090")]
    pub metrics_listen: SocketAddr,

    /// Checkpoint lag before /health reports degraded
    #[arg(long, env = "MAX_LAG_BLOCKS", default_value_t = 64)]
    pub max_lag_blocks: u64,

    /// Log as JSON
    #[arg(long, env = "LOG_JSON")]
    pub log_json: bool,
}

impl Args {
    /// Signer from the mnemonic or the private key
    ///
    /// # Errors
    /// Returns error if the key material is invalid
    pub fn signer(&self) -> Result<PrivateKeySigner> {
        match (&self.mnemonic, &self.private_key) {
            (Some(phrase), _) => signer_from_mnemonic(phrase, &self.mnemonic_path),
            (None, Some(key)) => signer_from_private_key(key),
            (None, None) => anyhow::bail!("MNEMONIC or PRIVATE_KEY is required"),
        }
    }

    #[must_use]
    pub fn retry(&self) -> RetryPolicy {
        RetryPolicy::new(self.retry_attempts, Duration::from_millis(self.retry_delay_ms))
    }

    #[must_use]
    pub fn beacon_timeout(&self) -> Duration {
        Duration::from_secs(self.beacon_timeout_secs)
    }

    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    #[must_use]
    pub fn rpc_config(&self) -> RpcConfig {
        RpcConfig {
            rpc_url: self.rpc_url.clone(),
            manager: self.manager_address,
            registry: self.registry_address,
            views: self.views_address,
            ssv_network: self.ssv_network_address,
            confirmations: self.confirmations,
            cluster_scan_from: self.cluster_scan_from_block.unwrap_or(self.start_block),
            log_chunk: self.log_chunk_blocks,
        }
    }

    #[must_use]
    pub fn funding_config(&self) -> FundingConfig {
        FundingConfig {
            link_token: self.link_token_address,
            ssv_token: self.ssv_token_address,
            weth_token: self.weth_token_address,
            fee_tier: self.swap_fee_tier,
            functions_minimum: self.functions_min_balance,
            functions_target: self.functions_target_balance,
            upkeep_minimum: self.upkeep_min_balance,
            upkeep_target: self.upkeep_target_balance,
        }
    }

    #[must_use]
    pub fn ceremony_config(&self) -> CeremonyConfig {
        CeremonyConfig {
            call_retry: self.retry(),
            ceremony_retry: self.retry(),
            settle_delay: Duration::from_millis(self.ceremony_settle_ms),
        }
    }

    /// The configured ceremony engine, HTTP preferred over CLI
    ///
    /// # Errors
    /// Returns error if the engine configuration is invalid
    pub fn ceremony_engine(&self) -> Result<Arc<dyn CeremonyEngine>> {
        let timeout = Duration::from_secs(self.ceremony_timeout_secs);
        if let Some(url) = &self.ceremony_url {
            let engine = HttpCeremonyEngine::new(url.as_str(), timeout)?;
            return Ok(Arc::new(engine));
        }

        let program = self
            .ceremony_cli
            .clone()
            .context("CEREMONY_URL or CEREMONY_CLI is required")?;
        let operator_endpoints = parse_operator_endpoints(&self.ceremony_operators)?;
        Ok(Arc::new(CliCeremonyEngine::new(CliEngineConfig {
            program,
            output_dir: self.ceremony_output_dir.clone(),
            timeout,
            operator_endpoints,
        })))
    }
}
