//! DKG Ceremony Client
//!
//! Drives keygen and reshare ceremonies on an external DKG engine and turns
//! their output into [`Validator`] and [`Reshare`] records.
//!
//! Every engine call is retried with the sub-call budget. The high-level
//! operations ([`CeremonyClient::create_validator`] and
//! [`CeremonyClient::reshare_validator`]) are retried as a whole with the
//! ceremony budget: a failed step restarts the ceremony under a fresh request
//! id instead of resuming the old one.

mod cli;
mod http;

pub use cli::{parse_operator_endpoints, CliCeremonyEngine, CliEngineConfig};
pub use http::HttpCeremonyEngine;

use crate::retry::RetryPolicy;
use crate::types::{withdrawal_credentials, DepositData, KeyShares, Reshare, Validator};
use alloy::primitives::{Address, Bytes};
use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, info, instrument, warn};

/// Errors from the ceremony engine or its output
#[derive(Debug, Error)]
pub enum CeremonyError {
    #[error("Ceremony engine unavailable: {0}")]
    Unavailable(String),

    #[error("Ceremony engine returned {status}: {message}")]
    Engine { status: String, message: String },

    #[error("Ceremony engine timed out after {0:?}")]
    Timeout(Duration),

    #[error("Invalid ceremony output: {0}")]
    InvalidOutput(String),

    #[error("Invalid ceremony engine configuration: {0}")]
    InvalidConfig(String),

    #[error("No endpoint configured for operator {0}")]
    UnknownOperator(u64),

    #[error("Ceremony {kind} for pool {pool_id} failed after {attempts} attempts: {last}")]
    Exhausted {
        kind: CeremonyKind,
        pool_id: u32,
        attempts: u32,
        last: String,
    },
}

impl From<reqwest::Error> for CeremonyError {
    fn from(e: reqwest::Error) -> Self {
        Self::Unavailable(e.to_string())
    }
}

impl From<std::io::Error> for CeremonyError {
    fn from(e: std::io::Error) -> Self {
        Self::Unavailable(e.to_string())
    }
}

/// Kind of ceremony
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CeremonyKind {
    Keygen,
    Reshare,
}

impl CeremonyKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Keygen => "keygen",
            Self::Reshare => "reshare",
        }
    }
}

impl fmt::Display for CeremonyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Progress of a ceremony
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CeremonyStatus {
    Started,
    SharesReady,
    DepositReady,
    Failed,
}

/// One in-flight or completed DKG interaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Ceremony {
    pub request_id: String,
    pub kind: CeremonyKind,
    pub operator_ids: Vec<u64>,
    pub old_operator_ids: Vec<u64>,
    pub status: CeremonyStatus,
}

impl Ceremony {
    /// Mark the ceremony failed if collecting its output did not succeed
    pub fn record_outcome<T>(&mut self, result: &Result<T, CeremonyError>) {
        if result.is_err() {
            self.status = CeremonyStatus::Failed;
        }
    }
}

static REQUEST_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Build a request id unique to this attempt: pool, kind, wall-clock
/// nanoseconds and a process-wide sequence number.
#[must_use]
pub fn new_request_id(pool_id: u32, kind: CeremonyKind) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_nanos());
    let seq = REQUEST_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    format!("{pool_id}-{kind}-{nanos}-{seq}")
}

/// Byzantine threshold for `n` operators (3 of 4)
#[must_use]
pub fn threshold(operator_count: usize) -> usize {
    operator_count - operator_count.saturating_sub(1) / 3
}

/// Parameters of a keygen ceremony
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeygenRequest {
    pub request_id: String,
    pub operator_ids: Vec<u64>,
    pub threshold: usize,
    pub withdrawal_address: Address,
}

/// Parameters of a reshare ceremony
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReshareRequest {
    pub request_id: String,
    pub public_key: Bytes,
    pub old_operator_ids: Vec<u64>,
    pub operator_ids: Vec<u64>,
    pub threshold: usize,
}

/// An external DKG engine
#[async_trait]
pub trait CeremonyEngine: Send + Sync {
    /// Check that the engine is reachable
    async fn ping(&self) -> Result<(), CeremonyError>;

    async fn start_keygen(&self, request: &KeygenRequest) -> Result<(), CeremonyError>;

    async fn start_reshare(&self, request: &ReshareRequest) -> Result<(), CeremonyError>;

    async fn shares(&self, request_id: &str) -> Result<KeyShares, CeremonyError>;

    async fn deposit_data(&self, request_id: &str) -> Result<DepositData, CeremonyError>;

    /// Release anything held for a consumed ceremony
    async fn cleanup(&self, _request_id: &str) -> Result<(), CeremonyError> {
        Ok(())
    }
}

/// Ceremony client timing and retry budgets
#[derive(Debug, Clone, Copy)]
pub struct CeremonyConfig {
    /// Budget for each engine call
    pub call_retry: RetryPolicy,
    /// Budget for a whole ceremony
    pub ceremony_retry: RetryPolicy,
    /// Wait between starting a ceremony and collecting its output
    pub settle_delay: Duration,
}

impl Default for CeremonyConfig {
    fn default() -> Self {
        Self {
            call_retry: RetryPolicy::default(),
            ceremony_retry: RetryPolicy::default(),
            settle_delay: Duration::from_millis(2500),
        }
    }
}

/// High-level ceremony operations over a [`CeremonyEngine`]
#[derive(Clone)]
pub struct CeremonyClient {
    engine: Arc<dyn CeremonyEngine>,
    config: CeremonyConfig,
}

impl CeremonyClient {
    #[must_use]
    pub fn new(engine: Arc<dyn CeremonyEngine>, config: CeremonyConfig) -> Self {
        Self { engine, config }
    }

    /// Check the engine is reachable, with the sub-call budget
    ///
    /// # Errors
    /// Returns the last engine error once retries are exhausted
    pub async fn ping(&self) -> Result<(), CeremonyError> {
        let engine = &self.engine;
        self.config
            .call_retry
            .run("ceremony ping", move || engine.ping())
            .await
    }

    /// Start a keygen ceremony and return its request id
    ///
    /// # Errors
    /// Returns the last engine error once retries are exhausted
    pub async fn start_keygen(
        &self,
        pool_id: u32,
        operator_ids: &[u64],
        withdrawal_address: Address,
    ) -> Result<String, CeremonyError> {
        let request = KeygenRequest {
            request_id: new_request_id(pool_id, CeremonyKind::Keygen),
            operator_ids: operator_ids.to_vec(),
            threshold: threshold(operator_ids.len()),
            withdrawal_address,
        };
        let engine = &self.engine;
        let req = &request;
        self.config
            .call_retry
            .run("start keygen", move || engine.start_keygen(req))
            .await?;
        metrics::counter!("oracle_ceremonies_started_total", "kind" => "keygen").increment(1);
        Ok(request.request_id)
    }

    /// Start a reshare ceremony and return its request id
    ///
    /// # Errors
    /// Returns the last engine error once retries are exhausted
    pub async fn start_reshare(
        &self,
        pool_id: u32,
        old_operator_ids: &[u64],
        operator_ids: &[u64],
        public_key: &Bytes,
    ) -> Result<String, CeremonyError> {
        let request = ReshareRequest {
            request_id: new_request_id(pool_id, CeremonyKind::Reshare),
            public_key: public_key.clone(),
            old_operator_ids: old_operator_ids.to_vec(),
            operator_ids: operator_ids.to_vec(),
            threshold: threshold(operator_ids.len()),
        };
        let engine = &self.engine;
        let req = &request;
        self.config
            .call_retry
            .run("start reshare", move || engine.start_reshare(req))
            .await?;
        metrics::counter!("oracle_ceremonies_started_total", "kind" => "reshare").increment(1);
        Ok(request.request_id)
    }

    /// Collect key shares for a ceremony
    ///
    /// # Errors
    /// Returns the last engine error once retries are exhausted
    pub async fn get_shares(&self, request_id: &str) -> Result<KeyShares, CeremonyError> {
        let engine = &self.engine;
        self.config
            .call_retry
            .run("get shares", move || engine.shares(request_id))
            .await
    }

    /// Collect deposit data for a keygen ceremony
    ///
    /// # Errors
    /// Returns the last engine error once retries are exhausted
    pub async fn get_deposit_data(&self, request_id: &str) -> Result<DepositData, CeremonyError> {
        let engine = &self.engine;
        self.config
            .call_retry
            .run("get deposit data", move || engine.deposit_data(request_id))
            .await
    }

    /// Run a full keygen ceremony for `pool_id`
    ///
    /// # Errors
    /// Returns [`CeremonyError::Exhausted`] once the ceremony budget is spent
    #[instrument(skip(self))]
    pub async fn create_validator(
        &self,
        pool_id: u32,
        operator_ids: &[u64],
        withdrawal_address: Address,
    ) -> Result<Validator, CeremonyError> {
        self.config
            .ceremony_retry
            .run("create validator", || {
                self.keygen_once(pool_id, operator_ids, withdrawal_address)
            })
            .await
            .map_err(|e| CeremonyError::Exhausted {
                kind: CeremonyKind::Keygen,
                pool_id,
                attempts: self.config.ceremony_retry.max_attempts,
                last: e.to_string(),
            })
    }

    /// Run a full reshare ceremony replacing `old_operator_ids` with
    /// `operator_ids` for the validator `public_key`
    ///
    /// # Errors
    /// Returns [`CeremonyError::Exhausted`] once the ceremony budget is spent
    #[instrument(skip(self, public_key))]
    pub async fn reshare_validator(
        &self,
        pool_id: u32,
        public_key: &Bytes,
        old_operator_ids: &[u64],
        operator_ids: &[u64],
    ) -> Result<Reshare, CeremonyError> {
        self.config
            .ceremony_retry
            .run("reshare validator", || {
                self.reshare_once(pool_id, public_key, old_operator_ids, operator_ids)
            })
            .await
            .map_err(|e| CeremonyError::Exhausted {
                kind: CeremonyKind::Reshare,
                pool_id,
                attempts: self.config.ceremony_retry.max_attempts,
                last: e.to_string(),
            })
    }

    async fn keygen_once(
        &self,
        pool_id: u32,
        operator_ids: &[u64],
        withdrawal_address: Address,
    ) -> Result<Validator, CeremonyError> {
        let request_id = self
            .start_keygen(pool_id, operator_ids, withdrawal_address)
            .await?;
        let mut ceremony = Ceremony {
            request_id,
            kind: CeremonyKind::Keygen,
            operator_ids: operator_ids.to_vec(),
            old_operator_ids: Vec::new(),
            status: CeremonyStatus::Started,
        };
        info!(pool_id, request_id = %ceremony.request_id, ?operator_ids, "Keygen ceremony started");

        sleep(self.config.settle_delay).await;

        let result = self
            .collect_keygen(&mut ceremony, withdrawal_address)
            .await;
        self.finish(&mut ceremony, result).await
    }

    /// Record the outcome and release engine output once it has been collected.
    /// A failed cleanup leaves files behind but keeps the key material.
    async fn finish<T>(
        &self,
        ceremony: &mut Ceremony,
        result: Result<T, CeremonyError>,
    ) -> Result<T, CeremonyError> {
        ceremony.record_outcome(&result);
        if result.is_ok() {
            if let Err(e) = self.engine.cleanup(&ceremony.request_id).await {
                warn!(request_id = %ceremony.request_id, error = %e, "Ceremony cleanup failed");
            }
        }
        debug!(
            request_id = %ceremony.request_id,
            kind = %ceremony.kind,
            status = ?ceremony.status,
            "Ceremony finished"
        );
        result
    }

    async fn collect_keygen(
        &self,
        ceremony: &mut Ceremony,
        withdrawal_address: Address,
    ) -> Result<Validator, CeremonyError> {
        let shares = self.get_shares(&ceremony.request_id).await?;
        ceremony.status = CeremonyStatus::SharesReady;

        let deposit_data = self.get_deposit_data(&ceremony.request_id).await?;
        ceremony.status = CeremonyStatus::DepositReady;

        let expected = withdrawal_credentials(withdrawal_address);
        if deposit_data.withdrawal_credentials != expected {
            return Err(CeremonyError::InvalidOutput(format!(
                "withdrawal credentials {} do not match {expected}",
                deposit_data.withdrawal_credentials
            )));
        }
        if deposit_data.pubkey != shares.public_key {
            return Err(CeremonyError::InvalidOutput(
                "deposit data public key does not match key shares".to_string(),
            ));
        }
        check_share_operators(&shares, &ceremony.operator_ids)?;

        Ok(Validator {
            deposit_data,
            operator_ids: ceremony.operator_ids.clone(),
            shares: shares.shares,
        })
    }

    async fn reshare_once(
        &self,
        pool_id: u32,
        public_key: &Bytes,
        old_operator_ids: &[u64],
        operator_ids: &[u64],
    ) -> Result<Reshare, CeremonyError> {
        let request_id = self
            .start_reshare(pool_id, old_operator_ids, operator_ids, public_key)
            .await?;
        let mut ceremony = Ceremony {
            request_id,
            kind: CeremonyKind::Reshare,
            operator_ids: operator_ids.to_vec(),
            old_operator_ids: old_operator_ids.to_vec(),
            status: CeremonyStatus::Started,
        };
        info!(
            pool_id,
            request_id = %ceremony.request_id,
            ?old_operator_ids,
            ?operator_ids,
            "Reshare ceremony started"
        );

        sleep(self.config.settle_delay).await;

        let result = self.collect_reshare(&mut ceremony, public_key).await;
        self.finish(&mut ceremony, result).await
    }

    async fn collect_reshare(
        &self,
        ceremony: &mut Ceremony,
        public_key: &Bytes,
    ) -> Result<Reshare, CeremonyError> {
        let shares = self.get_shares(&ceremony.request_id).await?;
        ceremony.status = CeremonyStatus::SharesReady;

        if shares.public_key != *public_key {
            return Err(CeremonyError::InvalidOutput(
                "reshare produced shares for a different public key".to_string(),
            ));
        }
        check_share_operators(&shares, &ceremony.operator_ids)?;

        Ok(Reshare {
            public_key: public_key.clone(),
            old_operator_ids: ceremony.old_operator_ids.clone(),
            operator_ids: ceremony.operator_ids.clone(),
            shares: shares.shares,
        })
    }
}

fn check_share_operators(shares: &KeyShares, operator_ids: &[u64]) -> Result<(), CeremonyError> {
    if shares.operator_ids != operator_ids {
        return Err(CeremonyError::InvalidOutput(format!(
            "shares cover operators {:?}, expected {operator_ids:?}",
            shares.operator_ids
        )));
    }
    Ok(())
}
