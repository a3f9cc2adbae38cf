//! Shared Application State
//!
//! Progress of the event loop, read by the status API.

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Shared application state
#[derive(Debug, Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

#[derive(Debug)]
struct AppStateInner {
    /// Block of the last handled event
    checkpoint_block: AtomicU64,
    /// Log index of the last handled event
    checkpoint_log_index: AtomicU64,
    has_checkpoint: AtomicBool,
    /// Last block the event source has scanned and the loop fully handled
    scanned_block: AtomicU64,
    has_scanned: AtomicBool,
    /// Latest chain head seen by the event source
    head_block: AtomicU64,
    /// Allowed checkpoint lag before the service reports degraded
    max_lag_blocks: u64,
    /// Handled events by name
    handled: DashMap<&'static str, u64>,
    /// Service start time
    start_time: std::time::Instant,
    /// Last pre-handler funding failure
    last_funding_error: RwLock<Option<String>>,
    /// Last handler failure
    last_error: RwLock<Option<String>>,
}

impl AppState {
    /// Create new application state
    #[must_use]
    pub fn new(max_lag_blocks: u64) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                checkpoint_block: AtomicU64::new(0),
                checkpoint_log_index: AtomicU64::new(0),
                has_checkpoint: AtomicBool::new(false),
                scanned_block: AtomicU64::new(0),
                has_scanned: AtomicBool::new(false),
                head_block: AtomicU64::new(0),
                max_lag_blocks,
                handled: DashMap::new(),
                start_time: std::time::Instant::now(),
                last_funding_error: RwLock::new(None),
                last_error: RwLock::new(None),
            }),
        }
    }

    /// Record the position of the last handled event
    pub fn set_checkpoint(&self, block: u64, log_index: u64) {
        self.inner.checkpoint_block.store(block, Ordering::Relaxed);
        self.inner
            .checkpoint_log_index
            .store(log_index, Ordering::Relaxed);
        self.inner.has_checkpoint.store(true, Ordering::Relaxed);
    }

    /// Block and log index of the last handled event
    #[must_use]
    pub fn checkpoint(&self) -> Option<(u64, u64)> {
        self.inner.has_checkpoint.load(Ordering::Relaxed).then(|| {
            (
                self.inner.checkpoint_block.load(Ordering::Relaxed),
                self.inner.checkpoint_log_index.load(Ordering::Relaxed),
            )
        })
    }

    /// Record that every event up to `block` has been handled
    pub fn set_scanned_block(&self, block: u64) {
        self.inner.scanned_block.fetch_max(block, Ordering::Relaxed);
        self.inner.has_scanned.store(true, Ordering::Relaxed);
    }

    #[must_use]
    pub fn scanned_block(&self) -> Option<u64> {
        self.inner
            .has_scanned
            .load(Ordering::Relaxed)
            .then(|| self.inner.scanned_block.load(Ordering::Relaxed))
    }

    #[must_use]
    pub fn head_block(&self) -> u64 {
        self.inner.head_block.load(Ordering::Relaxed)
    }

    pub fn set_head_block(&self, block: u64) {
        self.inner.head_block.store(block, Ordering::Relaxed);
    }

    /// Blocks between the loop's progress and the chain head
    ///
    /// Progress is the later of the last handled event and the last block
    /// scanned, so blocks without events count. Without either the loop is
    /// caught up once it has seen the head.
    #[must_use]
    pub fn lag_blocks(&self) -> u64 {
        let checkpoint = self.checkpoint().map(|(block, _)| block);
        match checkpoint.max(self.scanned_block()) {
            Some(block) => self.head_block().saturating_sub(block),
            None => 0,
        }
    }

    /// Check if service is healthy (checkpoint within the allowed lag)
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.lag_blocks() <= self.inner.max_lag_blocks
    }

    /// Get uptime in seconds
    #[must_use]
    pub fn uptime_secs(&self) -> u64 {
        self.inner.start_time.elapsed().as_secs()
    }

    /// Count a handled event
    pub fn record_handled(&self, event: &'static str) {
        *self.inner.handled.entry(event).or_insert(0) += 1;
    }

    /// Handled events by name
    #[must_use]
    pub fn handled_counts(&self) -> BTreeMap<&'static str, u64> {
        self.inner
            .handled
            .iter()
            .map(|entry| (*entry.key(), *entry.value()))
            .collect()
    }

    pub fn set_funding_error(&self, error: Option<String>) {
        *self.inner.last_funding_error.write() = error;
    }

    #[must_use]
    pub fn last_funding_error(&self) -> Option<String> {
        self.inner.last_funding_error.read().clone()
    }

    /// Set last error
    pub fn set_error(&self, error: Option<String>) {
        *self.inner.last_error.write() = error;
    }

    /// Get last error
    #[must_use]
    pub fn last_error(&self) -> Option<String> {
        self.inner.last_error.read().clone()
    }
}

/// Snapshot served by `GET /status`
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub checkpoint_block: Option<u64>,
    pub checkpoint_log_index: Option<u64>,
    pub scanned_block: Option<u64>,
    pub head_block: u64,
    pub lag_blocks: u64,
    pub uptime_secs: u64,
    pub events_handled: BTreeMap<&'static str, u64>,
    pub last_funding_error: Option<String>,
    pub last_error: Option<String>,
}

impl AppState {
    #[must_use]
    pub fn snapshot(&self) -> StatusSnapshot {
        let checkpoint = self.checkpoint();
        StatusSnapshot {
            checkpoint_block: checkpoint.map(|(block, _)| block),
            checkpoint_log_index: checkpoint.map(|(_, log_index)| log_index),
            scanned_block: self.scanned_block(),
            head_block: self.head_block(),
            lag_blocks: self.lag_blocks(),
            uptime_secs: self.uptime_secs(),
            events_handled: self.handled_counts(),
            last_funding_error: self.last_funding_error(),
            last_error: self.last_error(),
        }
    }
}
