//! Event Loop
//!
//! Consumes event batches in chain order, one event at a time. Funding is
//! checked before each handler, the checkpoint advances after each success,
//! and a handler failure stops the loop after it is written to the error log.

use crate::events::{EventSource, ObservedEvent};
use crate::funding::FundingManager;
use crate::orchestrator::Orchestrator;
use crate::state::AppState;
use anyhow::{Context, Result};
use oracle_core::{Checkpoint, CheckpointStore, ErrorEntry, ErrorLog};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, info, instrument, warn};

/// Sequential event processor
pub struct EventLoop<S> {
    source: S,
    orchestrator: Orchestrator,
    funding: FundingManager,
    checkpoints: CheckpointStore,
    errors: ErrorLog,
    state: AppState,
    checkpoint: Option<Checkpoint>,
    poll_interval: Duration,
}

impl<S: EventSource> EventLoop<S> {
    /// Create a loop resuming after `checkpoint`
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        source: S,
        orchestrator: Orchestrator,
        funding: FundingManager,
        checkpoints: CheckpointStore,
        errors: ErrorLog,
        state: AppState,
        checkpoint: Option<Checkpoint>,
        poll_interval: Duration,
    ) -> Self {
        if let Some(cp) = checkpoint {
            state.set_checkpoint(cp.block, cp.log_index);
        }
        Self {
            source,
            orchestrator,
            funding,
            checkpoints,
            errors,
            state,
            checkpoint,
            poll_interval,
        }
    }

    /// Last handled position
    #[must_use]
    pub fn checkpoint(&self) -> Option<Checkpoint> {
        self.checkpoint
    }

    /// Run until a handler or the activation check fails
    ///
    /// # Errors
    /// Returns the first fatal error
    pub async fn run(&mut self) -> Result<()> {
        info!(checkpoint = ?self.checkpoint, "Event loop started");
        loop {
            self.drain().await?;
            self.idle().await?;
            sleep(self.poll_interval).await;
        }
    }

    /// Handle every available batch until the source is caught up
    ///
    /// Returns the number of events handled.
    ///
    /// # Errors
    /// Returns the first handler failure
    pub async fn drain(&mut self) -> Result<usize> {
        let mut handled = 0;
        loop {
            let batches = self.source.next_batches().await?;
            let caught_up = batches.is_empty();
            for batch in batches {
                debug!(block = batch.block, events = batch.events.len(), "Processing batch");
                for observed in batch.events {
                    if self.process(observed).await? {
                        handled += 1;
                    }
                }
            }
            if let Some(block) = self.source.scanned_through() {
                self.state.set_scanned_block(block);
                #[allow(clippy::cast_precision_loss)]
                metrics::gauge!("oracle_scanned_block").set(block as f64);
            }
            if caught_up {
                return Ok(handled);
            }
        }
    }

    /// Caught-up work: refresh the head and activate pending pools
    async fn idle(&mut self) -> Result<()> {
        let head = self.source.head_block().await?;
        self.state.set_head_block(head);

        if let Err(e) = self.orchestrator.check_pending_activations().await {
            let entry = ErrorEntry::now("ValidatorActivationCheck", head, 0, format!("{e:#}"));
            self.fail(&entry);
            return Err(e.context("Validator activation check failed"));
        }
        Ok(())
    }

    /// Handle one event. Returns `false` if it was already covered by the
    /// checkpoint.
    ///
    /// # Errors
    /// Returns the handler failure, after recording it in the error log
    #[instrument(skip(self), fields(event = observed.event.name(), block = observed.block, log_index = observed.log_index))]
    pub async fn process(&mut self, observed: ObservedEvent) -> Result<bool> {
        if self
            .checkpoint
            .is_some_and(|cp| cp.covers(observed.block, observed.log_index))
        {
            debug!("Event already handled, skipping");
            return Ok(false);
        }

        self.refill_before_handler().await;

        let name = observed.event.name();
        if let Err(e) = self.orchestrator.handle(observed.event).await {
            let entry = ErrorEntry::now(name, observed.block, observed.log_index, format!("{e:#}"));
            self.fail(&entry);
            return Err(e.context(format!(
                "{name} handler failed at block {} log {}",
                observed.block, observed.log_index
            )));
        }

        let checkpoint = Checkpoint::new(observed.block, observed.log_index);
        self.checkpoints
            .save(checkpoint)
            .context("Failed to persist checkpoint")?;
        self.checkpoint = Some(checkpoint);
        self.state.set_checkpoint(checkpoint.block, checkpoint.log_index);
        self.state.record_handled(name);

        metrics::counter!("oracle_events_handled_total", "event" => name).increment(1);
        #[allow(clippy::cast_precision_loss)]
        metrics::gauge!("oracle_checkpoint_block").set(checkpoint.block as f64);

        info!("Event handled");
        Ok(true)
    }

    async fn refill_before_handler(&self) {
        match self.funding.check_and_refill_all().await {
            Ok(()) => self.state.set_funding_error(None),
            Err(e) => {
                warn!(error = %format!("{e:#}"), "Funding check failed, continuing with handler");
                self.state.set_funding_error(Some(format!("{e:#}")));
            }
        }
    }

    fn fail(&self, entry: &ErrorEntry) {
        metrics::counter!("oracle_handler_failures_total").increment(1);
        self.state.set_error(Some(entry.error.clone()));
        if let Err(e) = self.errors.append(entry) {
            error!(error = %e, "Failed to write error log");
        }
    }
}
