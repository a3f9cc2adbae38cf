//! Ceremony engine served over HTTP.

use super::{CeremonyEngine, CeremonyError, KeygenRequest, ReshareRequest};
use crate::types::{DepositData, KeyShares};
use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::instrument;

/// Client for a DKG service exposing `/ping`, `/keygen`, `/reshare`,
/// `/data/:id` and `/deposit_data/:id`
#[derive(Debug, Clone)]
pub struct HttpCeremonyEngine {
    client: Client,
    base_url: String,
}

impl HttpCeremonyEngine {
    /// Create an engine client with a per-request timeout
    ///
    /// # Errors
    /// Returns error if the HTTP client cannot be built
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, CeremonyError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, CeremonyError> {
        let response = self
            .client
            .get(format!("{}{path}", self.base_url))
            .send()
            .await?;
        let response = check_status(response).await?;
        response
            .json()
            .await
            .map_err(|e| CeremonyError::InvalidOutput(e.to_string()))
    }
}

async fn check_status(response: Response) -> Result<Response, CeremonyError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response.text().await.unwrap_or_default();
    Err(CeremonyError::Engine {
        status: status.to_string(),
        message,
    })
}

#[async_trait]
impl CeremonyEngine for HttpCeremonyEngine {
    async fn ping(&self) -> Result<(), CeremonyError> {
        let response = self
            .client
            .get(format!("{}/ping", self.base_url))
            .send()
            .await?;
        check_status(response).await.map(|_| ())
    }

    #[instrument(skip(self, request), fields(request_id = %request.request_id))]
    async fn start_keygen(&self, request: &KeygenRequest) -> Result<(), CeremonyError> {
        let response = self
            .client
            .post(format!("{}/keygen", self.base_url))
            .json(request)
            .send()
            .await?;
        check_status(response).await.map(|_| ())
    }

    #[instrument(skip(self, request), fields(request_id = %request.request_id))]
    async fn start_reshare(&self, request: &ReshareRequest) -> Result<(), CeremonyError> {
        let response = self
            .client
            .post(format!("{}/reshare", self.base_url))
            .json(request)
            .send()
            .await?;
        check_status(response).await.map(|_| ())
    }

    #[instrument(skip(self))]
    async fn shares(&self, request_id: &str) -> Result<KeyShares, CeremonyError> {
        self.get_json(&format!("/data/{request_id}")).await
    }

    #[instrument(skip(self))]
    async fn deposit_data(&self, request_id: &str) -> Result<DepositData, CeremonyError> {
        self.get_json(&format!("/deposit_data/{request_id}")).await
    }
}
