use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use super::emitter::BillingEmitter;
use super::models::{BillableUsage, ContractCoverage, RemittanceRow, RemittanceStatus};
use super::store::{LedgerDecision, RemittanceStore};
use super::units::{Quantity, Unit};
use crate::error::{BillingError, BillingResult};

/// Slack allowed before a lower period total counts as a regression.
const REGRESSION_TOLERANCE: f64 = 1e-9;

/// Inputs to the remittance arithmetic for one observation.
#[derive(Debug, Clone)]
pub struct RemittanceInput<'a> {
    /// Period-to-date usage in metric units.
    pub current_total: f64,
    pub billing_unit: &'a Unit,
    /// Row for the same key and period, if one exists.
    pub prior: Option<&'a RemittanceRow>,
    /// Present only for contract-enabled products.
    pub coverage: Option<&'a ContractCoverage>,
}

/// key: remittance-calculation -> pure offset/ceil/delta arithmetic
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RemittanceCalculation {
    pub billing_factor: f64,
    /// Usage past contract coverage, metric units.
    pub applicable_metric: f64,
    /// Rounded-up metric usage newly accounted for by this observation.
    pub consumed_metric: f64,
    /// Delta to emit, billing units. Always zero for gratis coverage.
    pub billed_units: f64,
    pub new_remitted: f64,
    pub new_gratis: f64,
    pub gratis: bool,
}

impl RemittanceCalculation {
    pub fn compute(input: &RemittanceInput<'_>) -> BillingResult<Self> {
        let unit = input.billing_unit;

        let (prior_remitted, prior_gratis) = match input.prior {
            Some(row) => {
                if input.current_total + REGRESSION_TOLERANCE < row.last_current_total {
                    return Err(BillingError::UsageRegression {
                        key: row.key.to_string(),
                        previous: row.last_current_total,
                        current: input.current_total,
                    });
                }
                if !row.billing_factor.is_finite() || row.billing_factor <= 0.0 {
                    return Err(BillingError::InvalidUnit(format!(
                        "recorded billing factor {} for {} is not usable",
                        row.billing_factor, row.key
                    )));
                }
                let recorded = Unit {
                    metric_id: unit.metric_id.clone(),
                    billing_factor: row.billing_factor,
                };
                (
                    Quantity::new(row.remitted_value, recorded.clone()),
                    Quantity::new(row.gratis_value, recorded),
                )
            }
            None => (
                Quantity::new(0.0, unit.clone()),
                Quantity::new(0.0, unit.clone()),
            ),
        };

        let contract_offset = match input.coverage {
            Some(coverage) => Quantity::new(coverage.total, unit.clone()).to_metric()?,
            None => Quantity::of(0.0),
        };

        let applicable = Quantity::of(input.current_total)
            .subtract(&contract_offset)?
            .positive_or_zero();
        let already_accounted = prior_remitted.add(&prior_gratis)?;
        let consumed = applicable
            .subtract(&already_accounted)?
            .positive_or_zero()
            .ceil();
        let billable = consumed.to(unit)?;

        let prior_remitted = prior_remitted.to(unit)?;
        let prior_gratis = prior_gratis.to(unit)?;
        let gratis = input.coverage.map_or(false, |coverage| coverage.gratis);

        let (billed_units, new_remitted, new_gratis) = if gratis {
            (
                0.0,
                prior_remitted.value,
                prior_gratis.add(&billable)?.value,
            )
        } else {
            (
                billable.value,
                prior_remitted.add(&billable)?.value,
                prior_gratis.value,
            )
        };

        Ok(Self {
            billing_factor: unit.billing_factor,
            applicable_metric: applicable.value,
            consumed_metric: consumed.value,
            billed_units,
            new_remitted,
            new_gratis,
            gratis,
        })
    }

    /// Whether the row needs to be written at all.
    pub fn advances(&self) -> bool {
        self.consumed_metric > 0.0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LedgerOutcome {
    pub calculation: RemittanceCalculation,
    /// Row as written; `None` when nothing advanced.
    pub row: Option<RemittanceRow>,
}

impl LedgerOutcome {
    pub fn billed_units(&self) -> f64 {
        self.row
            .as_ref()
            .map(|_| self.calculation.billed_units)
            .unwrap_or(0.0)
    }
}

fn next_row(
    usage: &BillableUsage,
    prior: Option<&RemittanceRow>,
    calculation: &RemittanceCalculation,
) -> RemittanceRow {
    let now = Utc::now();
    let status = if calculation.gratis {
        RemittanceStatus::Gratis
    } else {
        RemittanceStatus::Pending
    };
    let last_current_total = prior
        .map(|row| row.last_current_total.max(usage.current_total))
        .unwrap_or(usage.current_total);
    RemittanceRow {
        id: prior.map(|row| row.id).unwrap_or_else(Uuid::new_v4),
        key: usage.remittance_key(),
        remitted_value: calculation.new_remitted,
        gratis_value: calculation.new_gratis,
        billing_factor: calculation.billing_factor,
        last_current_total,
        status,
        error_code: None,
        billed_on: None,
        retry_after: None,
        tally_id: usage.tally_id,
        remittance_pending_date: now,
        updated_at: now,
    }
}

/// key: remittance-ledger -> read/compute/write per key through the store transaction
#[derive(Clone)]
pub struct RemittanceLedger {
    store: Arc<dyn RemittanceStore>,
}

impl RemittanceLedger {
    pub fn new(store: Arc<dyn RemittanceStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn RemittanceStore> {
        &self.store
    }

    pub async fn apply(
        &self,
        usage: &BillableUsage,
        billing_unit: &Unit,
        coverage: Option<&ContractCoverage>,
    ) -> BillingResult<LedgerOutcome> {
        let key = usage.remittance_key();

        let decide = |prior: Option<&RemittanceRow>| -> BillingResult<LedgerDecision> {
            let calculation = RemittanceCalculation::compute(&RemittanceInput {
                current_total: usage.current_total,
                billing_unit,
                prior,
                coverage,
            })?;
            if !calculation.advances() {
                return Ok(LedgerDecision::Unchanged { calculation });
            }
            let row = next_row(usage, prior, &calculation);
            let outbox = if calculation.billed_units > 0.0 {
                Some(BillingEmitter::outbound(&row, calculation.billed_units, usage)?)
            } else {
                None
            };
            Ok(LedgerDecision::Write {
                calculation,
                row,
                outbox,
            })
        };

        let outcome = self.store.reconcile(&key, &decide).await?;
        let calculation = &outcome.calculation;
        debug!(
            %key,
            current_total = usage.current_total,
            applicable = calculation.applicable_metric,
            billed = calculation.billed_units,
            remitted = calculation.new_remitted,
            gratis = calculation.gratis,
            "reconciled remittance"
        );
        Ok(outcome)
    }
}
