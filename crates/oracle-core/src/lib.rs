//! # Staking Oracle Core
//!
//! Chain-agnostic pieces of the staking oracle:
//! - pool, operator and funding data model with its invariants
//! - operator selection, exit blame and funding source policies
//! - the DKG ceremony client over HTTP or CLI engines
//! - beacon API lookups
//! - bounded retries and restart state (checkpoint, error log)

pub mod beacon_client;
pub mod blame;
pub mod ceremony;
pub mod checkpoint;
pub mod funding;
pub mod retry;
pub mod selection;
pub mod types;

pub use beacon_client::{BeaconApi, BeaconClient, BeaconValidator, ValidatorStatus};
pub use blame::{blame_percents, BlamePercents};
pub use ceremony::{CeremonyClient, CeremonyConfig, CeremonyEngine, CeremonyError, CeremonyKind};
pub use checkpoint::{Checkpoint, CheckpointStore, ErrorEntry, ErrorLog};
pub use funding::{choose_funding_source, FeePayment, FundingSource};
pub use retry::RetryPolicy;
pub use selection::{select_operators, SelectionError};
pub use types::*;
