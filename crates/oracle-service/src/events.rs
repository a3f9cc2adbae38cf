//! Protocol Events
//!
//! Decoding of manager/registry logs into a closed event enum, and the
//! block-ordered event source the loop consumes.

use crate::contracts::{IManager, IRegistry};
use alloy::{
    primitives::{Address, B256},
    providers::{DynProvider, Provider},
    rpc::types::{Filter, Log},
    sol_types::SolEvent,
};
use anyhow::Result;
use async_trait::async_trait;
use oracle_core::RetryPolicy;
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, instrument};

/// Errors turning a log into a [`ProtocolEvent`]
#[derive(Debug, Error)]
pub enum EventError {
    #[error("No handler for event topic {topic} at block {block} log {log_index}")]
    UnknownEvent {
        topic: B256,
        block: u64,
        log_index: u64,
    },

    #[error("Log without block number or log index")]
    MissingPosition,

    #[error("Failed to decode log: {0}")]
    Decode(#[from] alloy::sol_types::Error),
}

/// Events the orchestrator handles
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolEvent {
    DepositRequested { pool_id: u32 },
    OperatorDeactivationRequested { operator_id: u64 },
    CompletedExitReportsRequested { count: u64 },
    ForcedExitReportsRequested { count: u64 },
}

impl ProtocolEvent {
    /// Topics of every handled event
    pub const SIGNATURES: [B256; 4] = [
        IManager::DepositRequested::SIGNATURE_HASH,
        IRegistry::OperatorDeactivationRequested::SIGNATURE_HASH,
        IManager::CompletedExitReportsRequested::SIGNATURE_HASH,
        IManager::ForcedExitReportsRequested::SIGNATURE_HASH,
    ];

    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::DepositRequested { .. } => "DepositRequested",
            Self::OperatorDeactivationRequested { .. } => "OperatorDeactivationRequested",
            Self::CompletedExitReportsRequested { .. } => "CompletedExitReportsRequested",
            Self::ForcedExitReportsRequested { .. } => "ForcedExitReportsRequested",
        }
    }
}

/// An event with its position in chain order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObservedEvent {
    pub block: u64,
    pub log_index: u64,
    pub event: ProtocolEvent,
}

impl ObservedEvent {
    /// Decode a log
    ///
    /// # Errors
    /// Returns [`EventError::UnknownEvent`] for a topic without a handler
    pub fn decode(log: &Log) -> Result<Self, EventError> {
        let (Some(block), Some(log_index)) = (log.block_number, log.log_index) else {
            return Err(EventError::MissingPosition);
        };
        let topic = log.topic0().copied().unwrap_or_default();

        let event = match topic {
            IManager::DepositRequested::SIGNATURE_HASH => {
                let e = log.log_decode::<IManager::DepositRequested>()?.inner.data;
                ProtocolEvent::DepositRequested { pool_id: e.poolId }
            }
            IRegistry::OperatorDeactivationRequested::SIGNATURE_HASH => {
                let e = log
                    .log_decode::<IRegistry::OperatorDeactivationRequested>()?
                    .inner
                    .data;
                ProtocolEvent::OperatorDeactivationRequested {
                    operator_id: e.operatorId,
                }
            }
            IManager::CompletedExitReportsRequested::SIGNATURE_HASH => {
                let e = log
                    .log_decode::<IManager::CompletedExitReportsRequested>()?
                    .inner
                    .data;
                ProtocolEvent::CompletedExitReportsRequested {
                    count: e.count.saturating_to(),
                }
            }
            IManager::ForcedExitReportsRequested::SIGNATURE_HASH => {
                let e = log
                    .log_decode::<IManager::ForcedExitReportsRequested>()?
                    .inner
                    .data;
                ProtocolEvent::ForcedExitReportsRequested {
                    count: e.count.saturating_to(),
                }
            }
            topic => {
                return Err(EventError::UnknownEvent {
                    topic,
                    block,
                    log_index,
                })
            }
        };

        Ok(Self {
            block,
            log_index,
            event,
        })
    }
}

/// All handled events of one block, in emission order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventBatch {
    pub block: u64,
    pub events: Vec<ObservedEvent>,
}

/// Group events into per-block batches ordered by block, then log index
#[must_use]
pub fn into_batches(events: impl IntoIterator<Item = ObservedEvent>) -> Vec<EventBatch> {
    let mut by_block: BTreeMap<u64, Vec<ObservedEvent>> = BTreeMap::new();
    for event in events {
        by_block.entry(event.block).or_default().push(event);
    }
    by_block
        .into_iter()
        .map(|(block, mut events)| {
            events.sort_by_key(|e| e.log_index);
            EventBatch { block, events }
        })
        .collect()
}

/// Block-ordered, restartable stream of event batches
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Next batches up to the current head. Empty once caught up.
    async fn next_batches(&mut self) -> Result<Vec<EventBatch>>;

    /// Current chain head
    async fn head_block(&self) -> Result<u64>;

    /// Last block covered by the batches returned so far
    fn scanned_through(&self) -> Option<u64>;
}

/// Event source polling `eth_getLogs` in block ranges
pub struct LogEventSource {
    provider: DynProvider,
    filter: Filter,
    next_block: u64,
    chunk: u64,
    retry: RetryPolicy,
}

impl LogEventSource {
    /// Source over the manager and registry contracts, starting at `from_block`
    #[must_use]
    pub fn new(
        provider: DynProvider,
        manager: Address,
        registry: Address,
        from_block: u64,
        chunk: u64,
        retry: RetryPolicy,
    ) -> Self {
        let filter = Filter::new()
            .address(vec![manager, registry])
            .event_signature(ProtocolEvent::SIGNATURES.to_vec());
        Self {
            provider,
            filter,
            next_block: from_block,
            chunk: chunk.max(1),
            retry,
        }
    }
}

#[async_trait]
impl EventSource for LogEventSource {
    #[instrument(skip(self), fields(from = self.next_block))]
    async fn next_batches(&mut self) -> Result<Vec<EventBatch>> {
        let head = self.head_block().await?;
        if self.next_block > head {
            return Ok(Vec::new());
        }

        let to = head.min(self.next_block + self.chunk - 1);
        let filter = self.filter.clone().from_block(self.next_block).to_block(to);
        let provider = &self.provider;
        let filter_ref = &filter;
        let logs = self
            .retry
            .run("get_logs", move || async move {
                provider.get_logs(filter_ref).await
            })
            .await?;

        let events = logs
            .iter()
            .filter(|log| !log.removed)
            .map(ObservedEvent::decode)
            .collect::<Result<Vec<_>, _>>()?;

        debug!(from = self.next_block, to, count = events.len(), "Fetched event logs");
        self.next_block = to + 1;
        Ok(into_batches(events))
    }

    async fn head_block(&self) -> Result<u64> {
        let provider = &self.provider;
        Ok(self
            .retry
            .run("get_block_number", move || async move {
                provider.get_block_number().await
            })
            .await?)
    }

    fn scanned_through(&self) -> Option<u64> {
        self.next_block.checked_sub(1)
    }
}
