use std::fmt;

use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Sentinel used by tally for aggregate (non-billable) dimension values.
pub const ANY: &str = "_ANY";

/// key: billing-models -> provider,observation,remittance,contract
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BillingProvider {
    #[serde(rename = "aws")]
    Aws,
    #[serde(rename = "azure")]
    Azure,
    #[serde(rename = "red hat")]
    RedHat,
    #[serde(rename = "_ANY")]
    Any,
}

impl BillingProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingProvider::Aws => "aws",
            BillingProvider::Azure => "azure",
            BillingProvider::RedHat => "red hat",
            BillingProvider::Any => ANY,
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "aws" => Some(Self::Aws),
            "azure" => Some(Self::Azure),
            "red hat" | "red_hat" | "rhm" => Some(Self::RedHat),
            ANY => Some(Self::Any),
            _ => None,
        }
    }
}

impl fmt::Display for BillingProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Calendar-month billing window, formatted `YYYY-MM`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccumulationPeriod(String);

impl AccumulationPeriod {
    pub fn from_timestamp(timestamp: DateTime<Utc>) -> Self {
        Self(format!("{:04}-{:02}", timestamp.year(), timestamp.month()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for AccumulationPeriod {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for AccumulationPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A normalized usage observation for one billing dimension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BillableUsage {
    pub org_id: String,
    pub tally_id: Uuid,
    pub product_id: String,
    pub metric_id: String,
    pub sla: String,
    pub usage: String,
    pub billing_provider: BillingProvider,
    pub billing_account_id: String,
    #[serde(default)]
    pub vendor_product_code: Option<String>,
    pub value: f64,
    pub current_total: f64,
    pub snapshot_date: DateTime<Utc>,
}

impl BillableUsage {
    pub fn accumulation_period(&self) -> AccumulationPeriod {
        AccumulationPeriod::from_timestamp(self.snapshot_date)
    }

    pub fn remittance_key(&self) -> RemittanceKey {
        RemittanceKey {
            org_id: self.org_id.clone(),
            product_id: self.product_id.clone(),
            metric_id: self.metric_id.clone(),
            sla: self.sla.clone(),
            usage: self.usage.clone(),
            billing_provider: self.billing_provider,
            billing_account_id: self.billing_account_id.clone(),
            accumulation_period: self.accumulation_period(),
        }
    }
}

/// Idempotency boundary: one remittance row per billing dimension per period.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemittanceKey {
    pub org_id: String,
    pub product_id: String,
    pub metric_id: String,
    pub sla: String,
    pub usage: String,
    pub billing_provider: BillingProvider,
    pub billing_account_id: String,
    pub accumulation_period: AccumulationPeriod,
}

impl fmt::Display for RemittanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}/{}/{}/{}/{}",
            self.org_id,
            self.product_id,
            self.metric_id,
            self.sla,
            self.usage,
            self.billing_provider,
            self.billing_account_id,
            self.accumulation_period
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemittanceStatus {
    Pending,
    Succeeded,
    Failed,
    Gratis,
}

impl RemittanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RemittanceStatus::Pending => "pending",
            RemittanceStatus::Succeeded => "succeeded",
            RemittanceStatus::Failed => "failed",
            RemittanceStatus::Gratis => "gratis",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            "gratis" => Some(Self::Gratis),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemittanceErrorCode {
    Inactive,
    SubscriptionNotFound,
    UsageContextLookup,
    MarketplaceRateLimit,
    Redundant,
    Unknown,
}

impl RemittanceErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RemittanceErrorCode::Inactive => "inactive",
            RemittanceErrorCode::SubscriptionNotFound => "subscription_not_found",
            RemittanceErrorCode::UsageContextLookup => "usage_context_lookup",
            RemittanceErrorCode::MarketplaceRateLimit => "marketplace_rate_limit",
            RemittanceErrorCode::Redundant => "redundant",
            RemittanceErrorCode::Unknown => "unknown",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "inactive" => Some(Self::Inactive),
            "subscription_not_found" => Some(Self::SubscriptionNotFound),
            "usage_context_lookup" => Some(Self::UsageContextLookup),
            "marketplace_rate_limit" => Some(Self::MarketplaceRateLimit),
            "redundant" => Some(Self::Redundant),
            "unknown" => Some(Self::Unknown),
            _ => None,
        }
    }
}

/// key: billing-remittance-row -> cumulative remittance per key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemittanceRow {
    pub id: Uuid,
    #[serde(flatten)]
    pub key: RemittanceKey,
    /// Cumulative billed value, in units of `billing_factor`.
    pub remitted_value: f64,
    /// Cumulative usage consumed against gratis contracts, in units of `billing_factor`.
    pub gratis_value: f64,
    pub billing_factor: f64,
    /// Highest period-to-date usage total that advanced this row, in metric units.
    pub last_current_total: f64,
    pub status: RemittanceStatus,
    pub error_code: Option<RemittanceErrorCode>,
    pub billed_on: Option<DateTime<Utc>>,
    pub retry_after: Option<DateTime<Utc>>,
    pub tally_id: Uuid,
    pub remittance_pending_date: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractMetric {
    pub metric_id: String,
    pub value: f64,
}

/// Externally owned contract, read-only to this service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contract {
    pub org_id: String,
    pub product_id: String,
    #[serde(default)]
    pub vendor_product_code: Option<String>,
    #[serde(default)]
    pub billing_provider: Option<String>,
    #[serde(default)]
    pub billing_account_id: Option<String>,
    pub start_date: DateTime<Utc>,
    #[serde(default)]
    pub end_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metrics: Vec<ContractMetric>,
    #[serde(default)]
    pub gratis: bool,
}

impl Contract {
    /// Window is inclusive at both ends; an open end never expires.
    pub fn is_active_at(&self, date: DateTime<Utc>) -> bool {
        self.start_date <= date && self.end_date.map_or(true, |end| end >= date)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContractCoverage {
    pub metric_id: Option<String>,
    /// Covered amount in billing units.
    pub total: f64,
    pub gratis: bool,
}

impl ContractCoverage {
    pub fn none() -> Self {
        Self {
            metric_id: None,
            total: 0.0,
            gratis: false,
        }
    }
}
