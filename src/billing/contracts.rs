use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::Serialize;
use tracing::{debug, warn};
use url::Url;

use super::catalog::ProductCatalog;
use super::models::{BillableUsage, BillingProvider, Contract, ContractCoverage};
use crate::error::{BillingError, BillingResult};

const CONTRACTS_PATH: &str = "/api/swatch-contracts/internal/contracts";

/// Dimensions used to look up the contracts covering an observation.
#[derive(Debug, Clone, Serialize)]
pub struct ContractQuery {
    pub org_id: String,
    #[serde(rename = "product_tag")]
    pub product_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vendor_product_code: Option<String>,
    pub billing_provider: BillingProvider,
    pub billing_account_id: String,
    pub timestamp: DateTime<Utc>,
}

impl From<&BillableUsage> for ContractQuery {
    fn from(usage: &BillableUsage) -> Self {
        Self {
            org_id: usage.org_id.clone(),
            product_id: usage.product_id.clone(),
            vendor_product_code: usage.vendor_product_code.clone(),
            billing_provider: usage.billing_provider,
            billing_account_id: usage.billing_account_id.clone(),
            timestamp: usage.snapshot_date,
        }
    }
}

/// key: contracts-api -> external contract lookup
#[async_trait]
pub trait ContractsApi: Send + Sync {
    async fn get_contracts(&self, query: &ContractQuery) -> BillingResult<Vec<Contract>>;
}

#[derive(Debug, Clone)]
pub struct ContractClientConfig {
    pub base_url: String,
    pub timeout: Duration,
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub backoff_multiplier: f64,
    pub max_backoff: Duration,
}

impl Default for ContractClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000".to_string(),
            timeout: Duration::from_secs(10),
            max_attempts: 1,
            initial_backoff: Duration::from_millis(1000),
            backoff_multiplier: 2.0,
            max_backoff: Duration::from_secs(64),
        }
    }
}

impl ContractClientConfig {
    pub(crate) fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let millis = self.initial_backoff.as_millis() as f64 * self.backoff_multiplier.powi(exponent);
        Duration::from_millis(millis as u64).min(self.max_backoff)
    }
}

enum AttemptError {
    Retryable(String),
    Fatal(BillingError),
}

/// key: contracts-http-client -> reqwest-backed ContractsApi with bounded backoff
#[derive(Clone)]
pub struct HttpContractsClient {
    client: Client,
    endpoint: Url,
    config: ContractClientConfig,
}

impl HttpContractsClient {
    pub fn new(config: ContractClientConfig) -> BillingResult<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|err| {
                BillingError::Configuration(format!("failed to build contracts client: {err}"))
            })?;
        let endpoint = Url::parse(config.base_url.trim_end_matches('/'))
            .and_then(|base| base.join(CONTRACTS_PATH))
            .map_err(|err| {
                BillingError::Configuration(format!(
                    "invalid contracts base url `{}`: {err}",
                    config.base_url
                ))
            })?;
        Ok(Self {
            client,
            endpoint,
            config,
        })
    }

    async fn attempt(&self, query: &ContractQuery) -> Result<Vec<Contract>, AttemptError> {
        let response = self
            .client
            .get(self.endpoint.clone())
            .query(query)
            .send()
            .await
            .map_err(|err| AttemptError::Retryable(format!("contract lookup failed: {err}")))?;

        let status = response.status();
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            return Err(AttemptError::Retryable(format!(
                "contract service responded with {status}"
            )));
        }
        if status.is_client_error() {
            let body = response.text().await.unwrap_or_default();
            return Err(AttemptError::Fatal(BillingError::InvalidMessage(format!(
                "contract service rejected lookup for org {} with {status}: {body}",
                query.org_id
            ))));
        }

        response.json::<Vec<Contract>>().await.map_err(|err| {
            AttemptError::Fatal(BillingError::ExternalService(format!(
                "undecodable contract response: {err}"
            )))
        })
    }
}

#[async_trait]
impl ContractsApi for HttpContractsClient {
    async fn get_contracts(&self, query: &ContractQuery) -> BillingResult<Vec<Contract>> {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.attempt(query).await {
                Ok(contracts) => return Ok(contracts),
                Err(AttemptError::Fatal(err)) => return Err(err),
                Err(AttemptError::Retryable(reason)) if attempt >= max_attempts => {
                    return Err(BillingError::ExternalService(format!(
                        "{reason} (after {attempt} attempts)"
                    )));
                }
                Err(AttemptError::Retryable(reason)) => {
                    let delay = self.config.backoff_for(attempt);
                    warn!(
                        org_id = %query.org_id,
                        product_id = %query.product_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        %reason,
                        "retrying contract lookup"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

/// Sum coverage for `contract_metric_id` over the contracts active at `date`.
pub fn coverage_from_contracts(
    contracts: &[Contract],
    contract_metric_id: &str,
    date: DateTime<Utc>,
    gratis_capable: bool,
) -> ContractCoverage {
    let active: Vec<&Contract> = contracts
        .iter()
        .filter(|contract| contract.is_active_at(date))
        .collect();

    let total = active
        .iter()
        .flat_map(|contract| contract.metrics.iter())
        .filter(|metric| metric.metric_id == contract_metric_id)
        .map(|metric| metric.value)
        .sum();

    let gratis =
        gratis_capable && !active.is_empty() && active.iter().all(|contract| contract.gratis);

    ContractCoverage {
        metric_id: Some(contract_metric_id.to_string()),
        total,
        gratis,
    }
}

/// key: contract-coverage -> contract lookup, validity filter, summed coverage
#[derive(Clone)]
pub struct ContractCoverageResolver {
    api: Arc<dyn ContractsApi>,
    catalog: Arc<ProductCatalog>,
}

impl ContractCoverageResolver {
    pub fn new(api: Arc<dyn ContractsApi>, catalog: Arc<ProductCatalog>) -> Self {
        Self { api, catalog }
    }

    /// Coverage in billing units; zero for products that are not contract enabled.
    pub async fn resolve(&self, usage: &BillableUsage) -> BillingResult<ContractCoverage> {
        if !self.catalog.is_contract_enabled(&usage.product_id) {
            return Ok(ContractCoverage::none());
        }

        let contract_metric_id = self.catalog.contract_metric_id(
            usage.billing_provider,
            &usage.product_id,
            &usage.metric_id,
        )?;

        let contracts = self.api.get_contracts(&ContractQuery::from(usage)).await?;
        if contracts.is_empty() {
            return Err(BillingError::ContractMissing(format!(
                "no contracts for org {} product {} account {} at {}",
                usage.org_id, usage.product_id, usage.billing_account_id, usage.snapshot_date
            )));
        }

        let gratis_capable = self
            .catalog
            .is_gratis_metric(&usage.product_id, &usage.metric_id);
        let coverage = coverage_from_contracts(
            &contracts,
            &contract_metric_id,
            usage.snapshot_date,
            gratis_capable,
        );
        debug!(
            org_id = %usage.org_id,
            product_id = %usage.product_id,
            metric_id = %contract_metric_id,
            total = coverage.total,
            gratis = coverage.gratis,
            "resolved contract coverage"
        );
        Ok(coverage)
    }
}
