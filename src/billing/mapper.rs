use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use super::catalog::{Granularity, ProductCatalog};
use super::models::{BillableUsage, BillingProvider, ANY};

/// Hardware measurement type carrying the aggregate of all the others.
pub const TOTAL_MEASUREMENT_TYPE: &str = "TOTAL";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TallyMeasurement {
    pub hardware_measurement_type: String,
    pub metric_id: String,
    pub value: f64,
    /// Period-to-date total for the measurement, metric units.
    pub current_total: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TallySnapshot {
    pub id: Uuid,
    pub product_id: String,
    pub snapshot_date: DateTime<Utc>,
    pub sla: String,
    pub usage: String,
    pub billing_provider: BillingProvider,
    #[serde(default)]
    pub billing_account_id: Option<String>,
    #[serde(default)]
    pub vendor_product_code: Option<String>,
    pub granularity: Granularity,
    #[serde(default)]
    pub tally_measurements: Option<Vec<TallyMeasurement>>,
}

/// Inbound usage summary: one per org per tally run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TallySummary {
    pub org_id: String,
    #[serde(default)]
    pub tally_snapshots: Vec<TallySnapshot>,
}

/// key: usage-mapper -> tally summaries to billable usage candidates
#[derive(Clone)]
pub struct UsageMapper {
    catalog: Arc<ProductCatalog>,
}

impl UsageMapper {
    pub fn new(catalog: Arc<ProductCatalog>) -> Self {
        Self { catalog }
    }

    pub fn from_tally_summary<'a>(
        &'a self,
        summary: &'a TallySummary,
    ) -> impl Iterator<Item = BillableUsage> + 'a {
        summary
            .tally_snapshots
            .iter()
            .filter(move |snapshot| self.is_billable(snapshot))
            .flat_map(move |snapshot| self.snapshot_usages(&summary.org_id, snapshot))
    }

    fn is_billable(&self, snapshot: &TallySnapshot) -> bool {
        let account = snapshot.billing_account_id.as_deref().unwrap_or(ANY);
        let billable = self.catalog.is_payg_eligible(&snapshot.product_id)
            && snapshot.sla != ANY
            && snapshot.usage != ANY
            && snapshot.billing_provider != BillingProvider::Any
            && !account.is_empty()
            && account != ANY
            && self.catalog.billable_granularity(&snapshot.product_id)
                == Some(snapshot.granularity)
            && snapshot
                .tally_measurements
                .as_ref()
                .map_or(false, |measurements| !measurements.is_empty());
        if !billable {
            debug!(
                snapshot_id = %snapshot.id,
                product_id = %snapshot.product_id,
                "skipping non-billable tally snapshot"
            );
        }
        billable
    }

    /// One usage per metric, summing the non-aggregate measurements in first-seen order.
    fn snapshot_usages(&self, org_id: &str, snapshot: &TallySnapshot) -> Vec<BillableUsage> {
        let mut usages: Vec<BillableUsage> = Vec::new();
        let measurements = snapshot.tally_measurements.as_deref().unwrap_or_default();
        for measurement in measurements
            .iter()
            .filter(|m| m.hardware_measurement_type != TOTAL_MEASUREMENT_TYPE)
        {
            match usages
                .iter_mut()
                .find(|usage| usage.metric_id == measurement.metric_id)
            {
                Some(usage) => {
                    usage.value += measurement.value;
                    usage.current_total += measurement.current_total;
                }
                None => usages.push(BillableUsage {
                    org_id: org_id.to_string(),
                    tally_id: snapshot.id,
                    product_id: snapshot.product_id.clone(),
                    metric_id: measurement.metric_id.clone(),
                    sla: snapshot.sla.clone(),
                    usage: snapshot.usage.clone(),
                    billing_provider: snapshot.billing_provider,
                    billing_account_id: snapshot
                        .billing_account_id
                        .clone()
                        .unwrap_or_default(),
                    vendor_product_code: snapshot.vendor_product_code.clone(),
                    value: measurement.value,
                    current_total: measurement.current_total,
                    snapshot_date: snapshot.snapshot_date,
                }),
            }
        }
        usages
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> Arc<ProductCatalog> {
        Arc::new(
            ProductCatalog::from_yaml(
                r#"
products:
  - product_id: rhosak
    payg_eligible: true
    metrics:
      - metric_id: Storage-gibibytes
  - product_id: rhel
    metrics:
      - metric_id: Sockets
"#,
            )
            .unwrap(),
        )
    }

    fn measurement(kind: &str, metric: &str, value: f64) -> TallyMeasurement {
        TallyMeasurement {
            hardware_measurement_type: kind.into(),
            metric_id: metric.into(),
            value,
            current_total: value * 10.0,
        }
    }

    fn summary(product: &str, granularity: Granularity, sla: &str, account: Option<&str>) -> TallySummary {
        TallySummary {
            org_id: "org123".into(),
            tally_snapshots: vec![TallySnapshot {
                id: Uuid::new_v4(),
                product_id: product.into(),
                snapshot_date: Utc::now(),
                sla: sla.into(),
                usage: "Production".into(),
                billing_provider: BillingProvider::Aws,
                billing_account_id: account.map(str::to_string),
                vendor_product_code: None,
                granularity,
                tally_measurements: Some(vec![
                    measurement("PHYSICAL", "Storage-gibibytes", 42.0),
                    measurement("TOTAL", "Storage-gibibytes", 42.0),
                ]),
            }],
        }
    }

    #[test]
    fn produces_usage_without_aggregate_measurement() {
        let mapper = UsageMapper::new(catalog());
        let input = summary("rhosak", Granularity::Hourly, "Standard", Some("bill123"));
        let usages: Vec<_> = mapper.from_tally_summary(&input).collect();
        assert_eq!(usages.len(), 1);
        assert_eq!(usages[0].value, 42.0);
        assert_eq!(usages[0].current_total, 420.0);
        assert_eq!(usages[0].billing_account_id, "bill123");
        assert_eq!(usages[0].tally_id, input.tally_snapshots[0].id);
    }

    #[test]
    fn merges_measurements_for_the_same_metric() {
        let mapper = UsageMapper::new(catalog());
        let mut input = summary("rhosak", Granularity::Hourly, "Standard", Some("bill123"));
        input.tally_snapshots[0].tally_measurements = Some(vec![
            measurement("PHYSICAL", "Storage-gibibytes", 2.0),
            measurement("VIRTUAL", "Storage-gibibytes", 3.0),
        ]);
        let usages: Vec<_> = mapper.from_tally_summary(&input).collect();
        assert_eq!(usages.len(), 1);
        assert_eq!(usages[0].value, 5.0);
        assert_eq!(usages[0].current_total, 50.0);
    }

    #[test]
    fn skips_non_billable_snapshots() {
        let mapper = UsageMapper::new(catalog());
        let cases = vec![
            summary("rhel", Granularity::Hourly, "Standard", Some("bill123")),
            summary("rhosak", Granularity::Yearly, "Standard", Some("bill123")),
            summary("rhosak", Granularity::Hourly, ANY, Some("bill123")),
            summary("rhosak", Granularity::Hourly, "Standard", Some(ANY)),
            summary("rhosak", Granularity::Hourly, "Standard", None),
        ];
        for input in &cases {
            assert_eq!(mapper.from_tally_summary(input).count(), 0);
        }

        let mut any_provider = summary("rhosak", Granularity::Hourly, "Standard", Some("b"));
        any_provider.tally_snapshots[0].billing_provider = BillingProvider::Any;
        assert_eq!(mapper.from_tally_summary(&any_provider).count(), 0);

        let mut empty = summary("rhosak", Granularity::Hourly, "Standard", Some("b"));
        empty.tally_snapshots[0].tally_measurements = None;
        assert_eq!(mapper.from_tally_summary(&empty).count(), 0);
    }
}
