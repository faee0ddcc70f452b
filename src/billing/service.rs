use std::sync::Arc;

use chrono::{Duration, Utc};
use tracing::{debug, error, info, warn};

use super::catalog::ProductCatalog;
use super::contracts::ContractCoverageResolver;
use super::ledger::{LedgerOutcome, RemittanceLedger};
use super::mapper::{TallySummary, UsageMapper};
use super::models::{BillableUsage, ContractCoverage};
use super::units::Quantity;
use crate::error::{BillingError, BillingResult, Disposition};
use crate::telemetry::{UsageLabels, BILLABLE_USAGE_METRIC, COVERED_USAGE_METRIC, USAGE_COUNTERS};

/// key: billable-usage-service -> coverage, ledger and emission for one observation
#[derive(Clone)]
pub struct BillableUsageService {
    catalog: Arc<ProductCatalog>,
    mapper: UsageMapper,
    resolver: ContractCoverageResolver,
    ledger: RemittanceLedger,
    contract_grace: Duration,
}

impl BillableUsageService {
    pub fn new(
        catalog: Arc<ProductCatalog>,
        resolver: ContractCoverageResolver,
        ledger: RemittanceLedger,
        contract_grace: Duration,
    ) -> Self {
        Self {
            mapper: UsageMapper::new(catalog.clone()),
            catalog,
            resolver,
            ledger,
            contract_grace,
        }
    }

    /// Process every billable dimension of a summary. All dimensions are attempted; the
    /// returned error, if any, is the first retryable one, else the first fatal one.
    pub async fn process_summary(&self, summary: &TallySummary) -> BillingResult<Vec<LedgerOutcome>> {
        let mut outcomes = Vec::new();
        let mut failure: Option<BillingError> = None;

        for usage in self.mapper.from_tally_summary(summary) {
            match self.process(&usage).await {
                Ok(outcome) => outcomes.push(outcome),
                Err(err) => {
                    let replace = match &failure {
                        None => true,
                        Some(existing) => {
                            existing.disposition() == Disposition::Reject
                                && err.disposition() == Disposition::Retry
                        }
                    };
                    if replace {
                        failure = Some(err);
                    }
                }
            }
        }

        match failure {
            Some(err) => Err(err),
            None => Ok(outcomes),
        }
    }

    pub async fn process(&self, usage: &BillableUsage) -> BillingResult<LedgerOutcome> {
        info!(
            org_id = %usage.org_id,
            product_id = %usage.product_id,
            metric_id = %usage.metric_id,
            billing_provider = %usage.billing_provider,
            billing_account_id = %usage.billing_account_id,
            snapshot_date = %usage.snapshot_date,
            "processing monthly billable usage"
        );

        let unit = self
            .catalog
            .billing_unit(&usage.product_id, &usage.metric_id)?;

        let coverage = if self.catalog.is_contract_enabled(&usage.product_id) {
            let coverage = self.contract_coverage(usage).await?;
            self.record_covered_usage(usage, &coverage, unit.billing_factor);
            Some(coverage)
        } else {
            None
        };

        let outcome = self.ledger.apply(usage, &unit, coverage.as_ref()).await?;
        match &outcome.row {
            Some(row) => {
                let consumed = Quantity::of(outcome.calculation.consumed_metric)
                    .to(&unit)?
                    .value;
                USAGE_COUNTERS.increment(
                    BILLABLE_USAGE_METRIC,
                    UsageLabels::for_usage(usage, row.status.as_str()),
                    consumed,
                );
                info!(
                    org_id = %usage.org_id,
                    product_id = %usage.product_id,
                    metric_id = %usage.metric_id,
                    remittance_id = %row.id,
                    billed = outcome.calculation.billed_units,
                    status = row.status.as_str(),
                    "recorded remittance"
                );
            }
            None => debug!(
                org_id = %usage.org_id,
                product_id = %usage.product_id,
                metric_id = %usage.metric_id,
                "nothing to remit"
            ),
        }
        Ok(outcome)
    }

    async fn contract_coverage(&self, usage: &BillableUsage) -> BillingResult<ContractCoverage> {
        match self.resolver.resolve(usage).await {
            Err(err @ BillingError::ContractMissing(_)) => {
                let grace_minutes = self.contract_grace.num_minutes();
                if usage.snapshot_date > Utc::now() - self.contract_grace {
                    warn!(
                        org_id = %usage.org_id,
                        product_id = %usage.product_id,
                        tally_id = %usage.tally_id,
                        grace_minutes,
                        error = %err,
                        "contract not yet available for recent usage"
                    );
                } else {
                    error!(
                        org_id = %usage.org_id,
                        product_id = %usage.product_id,
                        tally_id = %usage.tally_id,
                        grace_minutes,
                        error = %err,
                        "contract not available for usage past the grace window"
                    );
                }
                Err(err)
            }
            other => other,
        }
    }

    fn record_covered_usage(&self, usage: &BillableUsage, coverage: &ContractCoverage, factor: f64) {
        let previous_total = usage.current_total - usage.value;
        let covered_metric = coverage.total / factor;
        if previous_total > covered_metric {
            return;
        }
        let newly_covered = (covered_metric - previous_total).min(usage.value);
        USAGE_COUNTERS.increment(
            COVERED_USAGE_METRIC,
            UsageLabels::for_usage(usage, "covered"),
            newly_covered,
        );
    }
}
