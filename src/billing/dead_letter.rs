use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use super::emitter::BillableUsageEvent;
use super::models::RemittanceRow;
use super::store::RemittanceStore;
use crate::error::{BillingError, BillingResult};
use crate::messaging::RETRY_AFTER_HEADER;

#[derive(Debug, Clone, PartialEq)]
pub enum DeadLetterOutcome {
    /// Row reset to pending and the event scheduled for redelivery.
    Rescheduled(RemittanceRow),
    /// The remittance no longer exists; nothing to redrive.
    Missing,
}

pub fn parse_retry_after(raw: &str) -> BillingResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw.trim())
        .map(|value| value.with_timezone(&Utc))
        .map_err(|err| {
            BillingError::InvalidMessage(format!("invalid {RETRY_AFTER_HEADER} header `{raw}`: {err}"))
        })
}

/// key: dead-letter-consumer -> retry intent onto the row, redelivery via the bus
#[derive(Clone)]
pub struct DeadLetterConsumer {
    store: Arc<dyn RemittanceStore>,
}

impl DeadLetterConsumer {
    pub fn new(store: Arc<dyn RemittanceStore>) -> Self {
        Self { store }
    }

    /// A missing `retry_after` marks a poison message: rejected without touching the row.
    pub async fn handle(
        &self,
        event: &BillableUsageEvent,
        retry_after: Option<&str>,
    ) -> BillingResult<DeadLetterOutcome> {
        let Some(raw) = retry_after else {
            return Err(BillingError::InvalidMessage(format!(
                "dead letter for remittance {} has no {RETRY_AFTER_HEADER} header",
                event.remittance_id
            )));
        };
        let retry_after = parse_retry_after(raw)?;

        let republish = event.clone().into_message()?.deliver_at(retry_after);
        let updated = self
            .store
            .mark_retry(event.remittance_id, retry_after, Some(republish))
            .await?;

        match updated {
            Some(row) => {
                info!(
                    remittance_id = %row.id,
                    org_id = %row.key.org_id,
                    %retry_after,
                    "rescheduled dead-lettered billable usage"
                );
                Ok(DeadLetterOutcome::Rescheduled(row))
            }
            None => {
                warn!(
                    remittance_id = %event.remittance_id,
                    org_id = %event.org_id,
                    "dead-lettered billable usage references a missing remittance"
                );
                Ok(DeadLetterOutcome::Missing)
            }
        }
    }
}
