//! Beacon API client against a mock beacon node

use alloy::primitives::Bytes;
use oracle_core::beacon_client::BeaconClientError;
use oracle_core::{BeaconApi, BeaconClient, ValidatorStatus};
use serde_json::json;
use std::time::{Duration, Instant};
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn public_key() -> Bytes {
    Bytes::from(vec![0xab; 48])
}

fn validator_body(status: &str, balance: &str) -> serde_json::Value {
    json!({
        "execution_optimistic": false,
        "finalized": false,
        "data": [{
            "index": "1234",
            "balance": balance,
            "status": status,
            "validator": {
                "pubkey": public_key().to_string(),
                "effective_balance": "32000000000",
                "slashed": false
            }
        }]
    })
}

#[tokio::test]
async fn test_validator_at_head() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/eth/v1/beacon/states/head/validators"))
        .and(query_param("id", public_key().to_string()))
        .respond_with(ResponseTemplate::new(200).set_body_json(validator_body("active_ongoing", "32000012345")))
        .expect(1)
        .mount(&server)
        .await;

    let client = BeaconClient::new(&server.uri()).unwrap();
    let validator = client.validator(&public_key(), None).await.unwrap().unwrap();

    assert_eq!(validator.index, 1234);
    assert_eq!(validator.balance_gwei, 32_000_012_345);
    assert_eq!(validator.status, ValidatorStatus::ActiveOngoing);
}

#[tokio::test]
async fn test_validator_at_slot() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/eth/v1/beacon/states/8000/validators"))
        .respond_with(ResponseTemplate::new(200).set_body_json(validator_body("exited_unslashed", "31000000000")))
        .expect(1)
        .mount(&server)
        .await;

    let client = BeaconClient::new(&server.uri()).unwrap();
    let validator = client.validator(&public_key(), Some(8000)).await.unwrap().unwrap();

    assert_eq!(validator.status, ValidatorStatus::ExitedUnslashed);
    assert!(validator.status.is_exiting_or_exited());
}

#[tokio::test]
async fn test_unknown_validator() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/eth/v1/beacon/states/head/validators"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "data": [] })))
        .mount(&server)
        .await;

    let client = BeaconClient::new(&server.uri()).unwrap();
    assert!(client.validator(&public_key(), None).await.unwrap().is_none());
}

#[tokio::test]
async fn test_not_found_is_none() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let client = BeaconClient::new(&server.uri()).unwrap();
    assert!(client.validator(&public_key(), None).await.unwrap().is_none());
}

#[tokio::test]
async fn test_server_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let client = BeaconClient::new(&server.uri()).unwrap();
    assert!(client.validator(&public_key(), None).await.is_err());
}

#[tokio::test]
async fn test_embedded_credentials_sent_as_basic_auth() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(header("authorization", "Basic YWxpY2U6czNjcmV0"))
        .respond_with(ResponseTemplate::new(200).set_body_json(validator_body("pending_queued", "32000000000")))
        .expect(1)
        .mount(&server)
        .await;

    let url = server.uri().replacen("http://", "http://alice:s3cret@", 1);
    let client = BeaconClient::new(&url).unwrap();
    let validator = client.validator(&public_key(), None).await.unwrap().unwrap();

    assert_eq!(validator.status, ValidatorStatus::PendingQueued);
    assert!(!validator.status.is_active());
}

#[tokio::test]
async fn test_hung_beacon_node_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(validator_body("active_ongoing", "32000000000"))
                .set_delay(Duration::from_secs(5)),
        )
        .mount(&server)
        .await;

    let client = BeaconClient::with_timeout(&server.uri(), Duration::from_millis(100)).unwrap();
    let started = Instant::now();
    let result = client.validator(&public_key(), None).await;

    assert!(matches!(result, Err(BeaconClientError::HttpError(e)) if e.is_timeout()));
    assert!(started.elapsed() < Duration::from_secs(5));
}
