//! Ceremony engine run as a child process.
//!
//! Each ceremony writes `keyshares.json` and, for keygen, `deposit_data.json`
//! into `<output_dir>/<request_id>`.

use super::{CeremonyEngine, CeremonyError, KeygenRequest, ReshareRequest};
use crate::types::{withdrawal_credentials, DepositData, KeyShares};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, instrument};

const KEYSHARES_FILE: &str = "keyshares.json";
const DEPOSIT_DATA_FILE: &str = "deposit_data.json";

/// CLI engine settings
#[derive(Debug, Clone)]
pub struct CliEngineConfig {
    /// DKG CLI executable
    pub program: PathBuf,
    /// Directory ceremonies write their output under
    pub output_dir: PathBuf,
    /// Per-invocation timeout
    pub timeout: Duration,
    /// Operator id to DKG endpoint
    pub operator_endpoints: BTreeMap<u64, String>,
}

/// Parse `id=url` pairs separated by commas
///
/// # Errors
/// Returns error on a malformed pair or operator id
pub fn parse_operator_endpoints(raw: &str) -> Result<BTreeMap<u64, String>, CeremonyError> {
    raw.split(',')
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (id, url) = pair.split_once('=').ok_or_else(|| {
                CeremonyError::InvalidConfig(format!("operator endpoint `{pair}` is not id=url"))
            })?;
            let id = id.trim().parse::<u64>().map_err(|e| {
                CeremonyError::InvalidConfig(format!("operator id `{id}`: {e}"))
            })?;
            Ok((id, url.trim().to_string()))
        })
        .collect()
}

/// DKG engine invoked as `<program> keygen|reshare ...`
#[derive(Debug, Clone)]
pub struct CliCeremonyEngine {
    config: CliEngineConfig,
}

impl CliCeremonyEngine {
    #[must_use]
    pub fn new(config: CliEngineConfig) -> Self {
        Self { config }
    }

    fn output_path(&self, request_id: &str) -> PathBuf {
        self.config.output_dir.join(request_id)
    }

    fn operator_args(&self, flag: &str, operator_ids: &[u64]) -> Result<Vec<String>, CeremonyError> {
        let mut args = Vec::with_capacity(operator_ids.len() * 2);
        for id in operator_ids {
            let url = self
                .config
                .operator_endpoints
                .get(id)
                .ok_or(CeremonyError::UnknownOperator(*id))?;
            args.push(flag.to_string());
            args.push(format!("{id}={url}"));
        }
        Ok(args)
    }

    /// Arguments for a keygen invocation
    ///
    /// # Errors
    /// Returns error if an operator has no configured endpoint
    pub fn keygen_args(&self, request: &KeygenRequest) -> Result<Vec<String>, CeremonyError> {
        let mut args = vec![
            "keygen".to_string(),
            "--request-id".to_string(),
            request.request_id.clone(),
        ];
        args.extend(self.operator_args("--operator", &request.operator_ids)?);
        args.extend([
            "--threshold".to_string(),
            request.threshold.to_string(),
            "--withdrawal-credentials".to_string(),
            withdrawal_credentials(request.withdrawal_address).to_string(),
            "--output-path".to_string(),
            self.output_path(&request.request_id).display().to_string(),
        ]);
        Ok(args)
    }

    /// Arguments for a reshare invocation
    ///
    /// # Errors
    /// Returns error if an operator has no configured endpoint
    pub fn reshare_args(&self, request: &ReshareRequest) -> Result<Vec<String>, CeremonyError> {
        let mut args = vec![
            "reshare".to_string(),
            "--request-id".to_string(),
            request.request_id.clone(),
            "--public-key".to_string(),
            request.public_key.to_string(),
        ];
        args.extend(self.operator_args("--old-operator", &request.old_operator_ids)?);
        args.extend(self.operator_args("--operator", &request.operator_ids)?);
        args.extend([
            "--threshold".to_string(),
            request.threshold.to_string(),
            "--output-path".to_string(),
            self.output_path(&request.request_id).display().to_string(),
        ]);
        Ok(args)
    }

    #[instrument(skip(self, args))]
    async fn invoke(&self, args: Vec<String>) -> Result<(), CeremonyError> {
        debug!(program = %self.config.program.display(), ?args, "Running ceremony CLI");

        let child = Command::new(&self.config.program)
            .args(&args)
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(self.config.timeout, child)
            .await
            .map_err(|_| CeremonyError::Timeout(self.config.timeout))??;

        if !output.status.success() {
            return Err(CeremonyError::Engine {
                status: output.status.to_string(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }

    async fn read_output<T: DeserializeOwned>(&self, request_id: &str, file: &str) -> Result<T, CeremonyError> {
        read_json(&self.output_path(request_id).join(file)).await
    }
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, CeremonyError> {
    let raw = tokio::fs::read(path).await?;
    serde_json::from_slice(&raw)
        .map_err(|e| CeremonyError::InvalidOutput(format!("{}: {e}", path.display())))
}

#[async_trait]
impl CeremonyEngine for CliCeremonyEngine {
    async fn ping(&self) -> Result<(), CeremonyError> {
        if tokio::fs::metadata(&self.config.program).await.is_err() {
            return Err(CeremonyError::Unavailable(format!(
                "{} not found",
                self.config.program.display()
            )));
        }
        tokio::fs::create_dir_all(&self.config.output_dir).await?;
        Ok(())
    }

    async fn start_keygen(&self, request: &KeygenRequest) -> Result<(), CeremonyError> {
        let args = self.keygen_args(request)?;
        self.invoke(args).await
    }

    async fn start_reshare(&self, request: &ReshareRequest) -> Result<(), CeremonyError> {
        let args = self.reshare_args(request)?;
        self.invoke(args).await
    }

    async fn shares(&self, request_id: &str) -> Result<KeyShares, CeremonyError> {
        self.read_output(request_id, KEYSHARES_FILE).await
    }

    async fn deposit_data(&self, request_id: &str) -> Result<DepositData, CeremonyError> {
        let entries: Vec<DepositData> = self.read_output(request_id, DEPOSIT_DATA_FILE).await?;
        entries
            .into_iter()
            .next()
            .ok_or_else(|| CeremonyError::InvalidOutput("empty deposit data file".to_string()))
    }

    async fn cleanup(&self, request_id: &str) -> Result<(), CeremonyError> {
        match tokio::fs::remove_dir_all(self.output_path(request_id)).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::{address, Bytes};

    fn engine(program: &str, output_dir: &Path) -> CliCeremonyEngine {
        CliCeremonyEngine::new(CliEngineConfig {
            program: PathBuf::from(program),
            output_dir: output_dir.to_path_buf(),
            timeout: Duration::from_secs(5),
            operator_endpoints: parse_operator_endpoints(
                "1=http://op1:3030, 2=http://op2:3030,3=http://op3:3030,4=http://op4:3030",
            )
            .unwrap(),
        })
    }

    fn keygen_request(operator_ids: Vec<u64>) -> KeygenRequest {
        KeygenRequest {
            request_id: "7-keygen-1-0".to_string(),
            operator_ids,
            threshold: 3,
            withdrawal_address: address!("00000000000000000000000000000000000000aa"),
        }
    }

    #[test]
    fn test_parse_operator_endpoints() {
        let endpoints = parse_operator_endpoints("1=http://a, 208=http://b,").unwrap();
        assert_eq!(endpoints.len(), 2);
        assert_eq!(endpoints[&208], "http://b");

        assert!(parse_operator_endpoints("1:http://a").is_err());
        assert!(parse_operator_endpoints("x=http://a").is_err());
    }

    #[test]
    fn test_keygen_args() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine("dkgcli", dir.path());
        let args = engine.keygen_args(&keygen_request(vec![1, 2, 3, 4])).unwrap();

        assert_eq!(args[0], "keygen");
        assert_eq!(args.iter().filter(|a| *a == "--operator").count(), 4);
        assert!(args.contains(&"1=http://op1:3030".to_string()));
        let credentials = args
            .iter()
            .position(|a| a == "--withdrawal-credentials")
            .map(|i| &args[i + 1])
            .unwrap();
        assert!(credentials.starts_with("0x01"));
        assert!(credentials.ends_with("aa"));
        assert!(args.last().unwrap().ends_with("7-keygen-1-0"));
    }

    #[test]
    fn test_reshare_args() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine("dkgcli", dir.path());
        let request = ReshareRequest {
            request_id: "7-reshare-1-0".to_string(),
            public_key: Bytes::from(vec![0xab; 48]),
            old_operator_ids: vec![1, 2, 3, 4],
            operator_ids: vec![1, 2, 3, 4],
            threshold: 3,
        };
        let args = engine.reshare_args(&request).unwrap();
        assert_eq!(args[0], "reshare");
        assert_eq!(args.iter().filter(|a| *a == "--old-operator").count(), 4);
        assert_eq!(args.iter().filter(|a| *a == "--operator").count(), 4);
    }

    #[test]
    fn test_unknown_operator() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine("dkgcli", dir.path());
        let err = engine.keygen_args(&keygen_request(vec![1, 2, 3, 99])).unwrap_err();
        assert!(matches!(err, CeremonyError::UnknownOperator(99)));
    }

    #[tokio::test]
    async fn test_failing_program_reports_exit_status() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine("false", dir.path());
        let err = engine
            .start_keygen(&keygen_request(vec![1, 2, 3, 4]))
            .await
            .unwrap_err();
        assert!(matches!(err, CeremonyError::Engine { .. }));
    }

    #[tokio::test]
    async fn test_missing_program_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine("/nonexistent/dkgcli", dir.path());
        let err = engine
            .start_keygen(&keygen_request(vec![1, 2, 3, 4]))
            .await
            .unwrap_err();
        assert!(matches!(err, CeremonyError::Unavailable(_)));
        assert!(engine.ping().await.is_err());
    }

    #[tokio::test]
    async fn test_reads_output_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine("dkgcli", dir.path());
        let out = dir.path().join("7-keygen-1-0");
        std::fs::create_dir_all(&out).unwrap();

        let pubkey = "ab".repeat(48);
        std::fs::write(
            out.join(KEYSHARES_FILE),
            format!(r#"{{"public_key":"0x{pubkey}","operator_ids":[1,2,3,4],"shares":"0x0102"}}"#),
        )
        .unwrap();
        std::fs::write(
            out.join(DEPOSIT_DATA_FILE),
            format!(
                r#"[{{"pubkey":"{pubkey}","withdrawal_credentials":"{wc}","amount":32000000000,"signature":"{sig}","deposit_data_root":"{root}"}}]"#,
                wc = format!("01{}", "00".repeat(31)),
                sig = "cd".repeat(96),
                root = "11".repeat(32),
            ),
        )
        .unwrap();

        let shares = engine.shares("7-keygen-1-0").await.unwrap();
        assert_eq!(shares.operator_ids, vec![1, 2, 3, 4]);
        assert_eq!(shares.shares, Bytes::from(vec![1, 2]));

        let deposit = engine.deposit_data("7-keygen-1-0").await.unwrap();
        assert_eq!(deposit.pubkey, shares.public_key);
        assert_eq!(deposit.withdrawal_credentials[0], 0x01);

        engine.cleanup("7-keygen-1-0").await.unwrap();
        assert!(!out.exists());
        engine.cleanup("7-keygen-1-0").await.unwrap();
    }
}
