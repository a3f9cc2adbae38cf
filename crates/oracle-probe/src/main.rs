//! Oracle Probe
//!
//! Checks the ceremony engine and the beacon node by hand, with the same
//! clients the service uses.

use alloy::primitives::Bytes;
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use oracle_core::ceremony::HttpCeremonyEngine;
use oracle_core::{BeaconApi, BeaconClient, BeaconValidator, CeremonyEngine};
use std::time::Duration;

const PUBLIC_KEY_LEN: usize = 48;

#[derive(Parser, Debug)]
#[command(name = "oracle-probe")]
#[command(about = "Check the oracle's ceremony engine and beacon node")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Ping an HTTP ceremony engine
    Ping {
        #[arg(long, env = "CEREMONY_URL")]
        ceremony_url: String,

        #[arg(long, default_value_t = 10)]
        timeout_secs: u64,
    },
    /// Look up a validator by public key
    Validator {
        #[arg(long, env = "BEACON_URL")]
        beacon_url: String,

        /// Validator public key (hex)
        public_key: String,

        /// Slot to query instead of head
        #[arg(long)]
        slot: Option<u64>,

        #[arg(long, default_value_t = 30)]
        timeout_secs: u64,
    },
}

fn parse_public_key(raw: &str) -> Result<Bytes> {
    let raw = raw.strip_prefix("0x").unwrap_or(raw);
    let key = hex::decode(raw).context("Public key is not hex")?;
    if key.len() != PUBLIC_KEY_LEN {
        bail!("Public key must be {PUBLIC_KEY_LEN} bytes, got {}", key.len());
    }
    Ok(Bytes::from(key))
}

async fn ping(ceremony_url: &str, timeout: Duration) -> Result<()> {
    let engine = HttpCeremonyEngine::new(ceremony_url, timeout)?;
    engine
        .ping()
        .await
        .with_context(|| format!("Ceremony engine at {ceremony_url} is unreachable"))?;
    Ok(())
}

async fn lookup(
    beacon_url: &str,
    public_key: &Bytes,
    slot: Option<u64>,
    timeout: Duration,
) -> Result<Option<BeaconValidator>> {
    let client = BeaconClient::with_timeout(beacon_url, timeout).context("Invalid beacon URL")?;
    let validator = client
        .validator(public_key, slot)
        .await
        .context("Beacon lookup failed")?;
    Ok(validator)
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    match Args::parse().command {
        Command::Ping {
            ceremony_url,
            timeout_secs,
        } => {
            ping(&ceremony_url, Duration::from_secs(timeout_secs)).await?;
            println!("Ceremony engine at {ceremony_url} is up");
        }
        Command::Validator {
            beacon_url,
            public_key,
            slot,
            timeout_secs,
        } => {
            let public_key = parse_public_key(&public_key)?;
            match lookup(&beacon_url, &public_key, slot, Duration::from_secs(timeout_secs)).await? {
                Some(validator) => println!("{}", serde_json::to_string_pretty(&validator)?),
                None => println!("Validator {public_key} not found"),
            }
        }
    }

    Ok(())
}
