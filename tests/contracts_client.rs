use std::time::Duration;

use billable_usage::billing::{
    BillingProvider, ContractClientConfig, ContractQuery, ContractsApi, HttpContractsClient,
};
use billable_usage::BillingError;
use chrono::{TimeZone, Utc};
use httpmock::prelude::*;
use serde_json::json;

const CONTRACTS_PATH: &str = "/api/swatch-contracts/internal/contracts";

fn client(server: &MockServer, max_attempts: u32) -> HttpContractsClient {
    HttpContractsClient::new(ContractClientConfig {
        base_url: server.base_url(),
        timeout: Duration::from_secs(2),
        max_attempts,
        initial_backoff: Duration::from_millis(5),
        backoff_multiplier: 2.0,
        max_backoff: Duration::from_millis(20),
    })
    .unwrap()
}

fn query() -> ContractQuery {
    ContractQuery {
        org_id: "org1".into(),
        product_id: "rosa".into(),
        vendor_product_code: Some("vpc-123".into()),
        billing_provider: BillingProvider::Aws,
        billing_account_id: "acct-1".into(),
        timestamp: Utc.with_ymd_and_hms(2024, 6, 2, 12, 0, 0).unwrap(),
    }
}

#[tokio::test]
async fn contracts_are_fetched_with_usage_context() {
    let server = MockServer::start_async().await;
    let contracts_mock = server.mock(|when, then| {
        when.method(GET)
            .path(CONTRACTS_PATH)
            .query_param("org_id", "org1")
            .query_param("product_tag", "rosa")
            .query_param("vendor_product_code", "vpc-123")
            .query_param("billing_provider", "aws")
            .query_param("billing_account_id", "acct-1");
        then.status(200).json_body(json!([{
            "org_id": "org1",
            "product_id": "rosa",
            "vendor_product_code": "vpc-123",
            "billing_provider": "aws",
            "billing_account_id": "acct-1",
            "start_date": "2024-06-01T00:00:00Z",
            "end_date": null,
            "metrics": [{"metric_id": "four_vcpu_hour", "value": 100.0}]
        }]));
    });

    let contracts = client(&server, 1).get_contracts(&query()).await.unwrap();
    assert_eq!(contracts.len(), 1);
    assert_eq!(contracts[0].metrics[0].metric_id, "four_vcpu_hour");
    assert_eq!(contracts[0].metrics[0].value, 100.0);
    assert!(!contracts[0].gratis);
    contracts_mock.assert();
}

#[tokio::test]
async fn server_errors_are_retried_then_surface_as_external_failures() {
    let server = MockServer::start_async().await;
    let contracts_mock = server.mock(|when, then| {
        when.method(GET).path(CONTRACTS_PATH);
        then.status(503);
    });

    let error = client(&server, 3)
        .get_contracts(&query())
        .await
        .expect_err("lookup should fail while the service is unavailable");

    assert!(matches!(error, BillingError::ExternalService(_)));
    let message = error.to_string();
    assert!(
        message.contains("after 3 attempts"),
        "unexpected error message: {message}"
    );
    contracts_mock.assert_hits(3);
}

#[tokio::test]
async fn client_errors_are_not_retried() {
    let server = MockServer::start_async().await;
    let contracts_mock = server.mock(|when, then| {
        when.method(GET).path(CONTRACTS_PATH);
        then.status(400).body("bad product_tag");
    });

    let error = client(&server, 3)
        .get_contracts(&query())
        .await
        .expect_err("a rejected lookup should not succeed");

    assert!(matches!(error, BillingError::InvalidMessage(_)));
    assert!(error.to_string().contains("bad product_tag"));
    contracts_mock.assert_hits(1);
}

#[tokio::test]
async fn undecodable_bodies_are_external_failures() {
    let server = MockServer::start_async().await;
    server.mock(|when, then| {
        when.method(GET).path(CONTRACTS_PATH);
        then.status(200).body("not json");
    });

    let error = client(&server, 1).get_contracts(&query()).await.unwrap_err();
    assert!(matches!(error, BillingError::ExternalService(_)));
}
