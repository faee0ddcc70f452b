use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use super::models::BillingProvider;
use super::units::Unit;
use crate::error::{BillingError, BillingResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Granularity {
    Hourly,
    Daily,
    Weekly,
    Monthly,
    Quarterly,
    Yearly,
}

impl Default for Granularity {
    fn default() -> Self {
        Granularity::Hourly
    }
}

fn default_billing_factor() -> f64 {
    1.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricDefinition {
    pub metric_id: String,
    #[serde(default = "default_billing_factor")]
    pub billing_factor: f64,
    #[serde(default)]
    pub gratis: bool,
    #[serde(default)]
    pub aws_dimension: Option<String>,
    #[serde(default)]
    pub azure_dimension: Option<String>,
    #[serde(default)]
    pub rhm_metric_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductDefinition {
    pub product_id: String,
    #[serde(default)]
    pub payg_eligible: bool,
    #[serde(default)]
    pub contract_enabled: bool,
    #[serde(default)]
    pub billable_granularity: Granularity,
    #[serde(default)]
    pub metrics: Vec<MetricDefinition>,
}

#[derive(Debug, Deserialize)]
struct CatalogDocument {
    products: Vec<ProductDefinition>,
}

/// key: billing-catalog -> immutable product/metric metadata, built once at startup
#[derive(Debug, Clone, Default)]
pub struct ProductCatalog {
    products: HashMap<String, ProductDefinition>,
}

impl ProductCatalog {
    pub fn new(products: Vec<ProductDefinition>) -> Self {
        Self {
            products: products
                .into_iter()
                .map(|product| (product.product_id.clone(), product))
                .collect(),
        }
    }

    pub fn from_yaml(source: &str) -> Result<Self> {
        let document: CatalogDocument =
            serde_yaml::from_str(source).context("failed to parse product catalog")?;
        let catalog = Self::new(document.products);
        for product in catalog.products.values() {
            for metric in &product.metrics {
                Unit::billing(metric.metric_id.as_str(), metric.billing_factor).with_context(
                    || format!("invalid billing factor for {}", product.product_id),
                )?;
            }
        }
        Ok(catalog)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read product catalog {}", path.display()))?;
        Self::from_yaml(&source)
    }

    pub fn product(&self, product_id: &str) -> Option<&ProductDefinition> {
        self.products.get(product_id)
    }

    pub fn metric(&self, product_id: &str, metric_id: &str) -> BillingResult<&MetricDefinition> {
        self.product(product_id)
            .and_then(|product| {
                product
                    .metrics
                    .iter()
                    .find(|metric| metric.metric_id == metric_id)
            })
            .ok_or_else(|| {
                BillingError::Configuration(format!(
                    "no metric {metric_id} defined for product {product_id}"
                ))
            })
    }

    pub fn is_payg_eligible(&self, product_id: &str) -> bool {
        self.product(product_id)
            .map(|product| product.payg_eligible)
            .unwrap_or(false)
    }

    pub fn is_contract_enabled(&self, product_id: &str) -> bool {
        self.product(product_id)
            .map(|product| product.contract_enabled)
            .unwrap_or(false)
    }

    pub fn is_gratis_metric(&self, product_id: &str, metric_id: &str) -> bool {
        self.metric(product_id, metric_id)
            .map(|metric| metric.gratis)
            .unwrap_or(false)
    }

    pub fn billable_granularity(&self, product_id: &str) -> Option<Granularity> {
        self.product(product_id)
            .map(|product| product.billable_granularity)
    }

    pub fn billing_unit(&self, product_id: &str, metric_id: &str) -> BillingResult<Unit> {
        let metric = self.metric(product_id, metric_id)?;
        Unit::billing(metric.metric_id.as_str(), metric.billing_factor)
    }

    /// Metric identifier the contract service knows for this provider.
    pub fn contract_metric_id(
        &self,
        provider: BillingProvider,
        product_id: &str,
        metric_id: &str,
    ) -> BillingResult<String> {
        let metric = self.metric(product_id, metric_id)?;
        let mapped = match provider {
            BillingProvider::Aws => metric.aws_dimension.clone(),
            BillingProvider::Azure => metric.azure_dimension.clone(),
            BillingProvider::RedHat => metric.rhm_metric_id.clone(),
            BillingProvider::Any => None,
        };
        mapped.ok_or_else(|| {
            BillingError::Configuration(format!(
                "no {provider} metric mapping for {product_id}/{metric_id}"
            ))
        })
    }
}
