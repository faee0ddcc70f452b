use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use super::models::{
    AccumulationPeriod, BillableUsage, BillingProvider, RemittanceErrorCode, RemittanceKey,
    RemittanceRow, RemittanceStatus,
};
use super::store::{RemittanceStore, StatusUpdate};
use crate::error::{BillingError, BillingResult};
use crate::messaging::{OutboundMessage, BILLABLE_USAGE_OUT_TOPIC};

/// Outbound billing message: one per non-zero billable delta.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BillableUsageEvent {
    pub remittance_id: Uuid,
    pub org_id: String,
    pub product_id: String,
    pub metric_id: String,
    pub sla: String,
    pub usage: String,
    pub billing_provider: BillingProvider,
    pub billing_account_id: String,
    pub accumulation_period: AccumulationPeriod,
    #[serde(default)]
    pub vendor_product_code: Option<String>,
    /// Delta in billing units.
    pub billed_value: f64,
    pub billing_factor: f64,
    pub tally_id: Uuid,
    pub snapshot_date: DateTime<Utc>,
}

impl BillableUsageEvent {
    pub fn new(row: &RemittanceRow, billed_value: f64, usage: &BillableUsage) -> Self {
        let key = &row.key;
        Self {
            remittance_id: row.id,
            org_id: key.org_id.clone(),
            product_id: key.product_id.clone(),
            metric_id: key.metric_id.clone(),
            sla: key.sla.clone(),
            usage: key.usage.clone(),
            billing_provider: key.billing_provider,
            billing_account_id: key.billing_account_id.clone(),
            accumulation_period: key.accumulation_period.clone(),
            vendor_product_code: usage.vendor_product_code.clone(),
            billed_value,
            billing_factor: row.billing_factor,
            tally_id: row.tally_id,
            snapshot_date: usage.snapshot_date,
        }
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
            accumulation_period: self.accumulation_period.clone(),
        }
    }

    pub fn into_message(self) -> BillingResult<OutboundMessage> {
        OutboundMessage::new(BILLABLE_USAGE_OUT_TOPIC, &self)
    }
}

/// Asynchronous settlement of one or more remittance rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BillableUsageStatus {
    pub remittance_ids: Vec<Uuid>,
    /// `tally_id` of the emission being acknowledged.
    pub tally_id: Uuid,
    pub status: RemittanceStatus,
    #[serde(default)]
    pub error_code: Option<RemittanceErrorCode>,
    #[serde(default)]
    pub billed_on: Option<DateTime<Utc>>,
}

impl BillableUsageStatus {
    pub fn to_update(&self, now: DateTime<Utc>) -> BillingResult<StatusUpdate> {
        match self.status {
            RemittanceStatus::Succeeded => Ok(StatusUpdate {
                tally_id: self.tally_id,
                status: RemittanceStatus::Succeeded,
                error_code: None,
                billed_on: Some(self.billed_on.unwrap_or(now)),
            }),
            RemittanceStatus::Failed => Ok(StatusUpdate {
                tally_id: self.tally_id,
                status: RemittanceStatus::Failed,
                error_code: Some(self.error_code.unwrap_or(RemittanceErrorCode::Unknown)),
                billed_on: None,
            }),
            other => Err(BillingError::InvalidMessage(format!(
                "status feedback must be terminal, got {}",
                other.as_str()
            ))),
        }
    }
}

/// key: billing-emitter -> status feedback onto remittance rows
#[derive(Clone)]
pub struct BillingEmitter {
    store: Arc<dyn RemittanceStore>,
}

impl BillingEmitter {
    pub fn new(store: Arc<dyn RemittanceStore>) -> Self {
        Self { store }
    }

    pub fn outbound(
        row: &RemittanceRow,
        billed_value: f64,
        usage: &BillableUsage,
    ) -> BillingResult<OutboundMessage> {
        BillableUsageEvent::new(row, billed_value, usage).into_message()
    }

    pub async fn handle_status(&self, status: &BillableUsageStatus) -> BillingResult<u64> {
        if status.remittance_ids.is_empty() {
            return Err(BillingError::InvalidMessage(
                "status feedback without remittance ids".to_string(),
            ));
        }
        let update = status.to_update(Utc::now())?;
        let changed = self
            .store
            .update_status(&status.remittance_ids, &update)
            .await?;

        let requested = status.remittance_ids.len() as u64;
        if changed == 0 {
            warn!(
                requested,
                tally_id = %status.tally_id,
                status = status.status.as_str(),
                "ignoring stale status feedback; rows are settled or were rewritten by a later tally"
            );
            return Ok(0);
        }
        if changed < requested {
            warn!(
                requested,
                changed,
                tally_id = %status.tally_id,
                status = status.status.as_str(),
                "status feedback skipped rows that are missing, settled, or rewritten"
            );
        }
        info!(
            changed,
            status = status.status.as_str(),
            tally_id = %status.tally_id,
            error_code = ?update.error_code,
            "applied billable usage status"
        );
        Ok(changed)
    }
}
