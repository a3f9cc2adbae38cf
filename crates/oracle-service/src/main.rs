//! Staking Oracle Service
//!
//! Follows protocol events in chain order and drives pools through key
//! generation, activation, reshares and exit reporting.

mod api;
mod chain;
mod config;
mod contracts;
mod event_loop;
mod events;
mod funding;
mod operators;
mod orchestrator;
mod quoter;
mod rpc;
mod state;
#[cfg(test)]
mod testing;

use anyhow::{Context, Result};
use chain::ChainClient;
use clap::Parser;
use config::Args;
use event_loop::EventLoop;
use events::LogEventSource;
use funding::FundingManager;
use metrics_exporter_prometheus::PrometheusBuilder;
use operators::OperatorDirectory;
use oracle_core::{BeaconClient, CeremonyClient, CheckpointStore, ErrorLog};
use orchestrator::Orchestrator;
use quoter::UniswapQuoter;
use rpc::RpcChainClient;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn init_tracing(json: bool) {
    let registry = tracing_subscriber::registry().with(tracing_subscriber::EnvFilter::from_default_env());
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment from .env if present
    let _ = dotenvy::dotenv();

    let args = Args::parse();
    init_tracing(args.log_json);

    tracing::info!("Starting staking oracle service");
    tracing::info!(manager = %args.manager_address, registry = %args.registry_address, "Contracts");
    tracing::info!(beacon_url = %args.beacon_url, "Beacon node");

    PrometheusBuilder::new()
        .with_http_listener(args.metrics_listen)
        .install()
        .context("Failed to install metrics exporter")?;

    let retry = args.retry();
    let chain = Arc::new(RpcChainClient::new(args.rpc_config(), args.signer()?)?);
    let provider = chain.provider();
    tracing::info!(signer = %chain.signer_address(), "Oracle signer");
    let beacon = Arc::new(BeaconClient::with_timeout(&args.beacon_url, args.beacon_timeout()).context("Invalid beacon URL")?);

    let ceremony = CeremonyClient::new(args.ceremony_engine()?, args.ceremony_config());
    ceremony.ping().await.context("Ceremony engine unreachable")?;

    let quoter = Arc::new(UniswapQuoter::new(args.swap_quoter_address, provider.clone()));
    let funding = FundingManager::new(chain.clone(), quoter, args.funding_config(), retry);
    let orchestrator = Orchestrator::new(
        chain.clone(),
        beacon,
        ceremony,
        OperatorDirectory::new(chain.clone(), retry),
        funding.clone(),
        retry,
    );

    let checkpoints = CheckpointStore::new(args.checkpoint_file.clone());
    let checkpoint = checkpoints.load()?;
    let from_block = checkpoint.map_or(args.start_block, |cp| cp.block);
    tracing::info!(from_block, ?checkpoint, "Resuming event processing");

    let source = LogEventSource::new(
        provider,
        args.manager_address,
        args.registry_address,
        from_block,
        args.log_chunk_blocks,
        retry,
    );

    // Initialize application state
    let app_state = state::AppState::new(args.max_lag_blocks);

    // Start API server
    let api_handle = tokio::spawn(api::run_server(args.listen.clone(), app_state.clone()));

    let mut event_loop = EventLoop::new(
        source,
        orchestrator,
        funding,
        checkpoints,
        ErrorLog::new(args.error_log_file.clone()),
        app_state,
        checkpoint,
        args.poll_interval(),
    );

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal");
            Ok(())
        }
        result = event_loop.run() => {
            result.context("Event loop stopped")
        }
        result = api_handle => {
            match result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(e.context("API server error")),
                Err(e) => Err(anyhow::Error::new(e).context("API server task failed")),
            }
        }
    }
}
