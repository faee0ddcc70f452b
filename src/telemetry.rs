use std::fmt::Write;

use dashmap::DashMap;
use once_cell::sync::Lazy;
use tracing_subscriber::{fmt, EnvFilter};

use crate::billing::models::BillableUsage;

pub const BILLABLE_USAGE_METRIC: &str = "billable_usage_total";
pub const COVERED_USAGE_METRIC: &str = "contract_usage_total";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UsageLabels {
    pub product: String,
    pub metric_id: String,
    pub billing_provider: String,
    pub status: String,
}

impl UsageLabels {
    pub fn for_usage(usage: &BillableUsage, status: &str) -> Self {
        Self {
            product: usage.product_id.clone(),
            metric_id: usage.metric_id.clone(),
            billing_provider: usage.billing_provider.as_str().to_string(),
            status: status.to_string(),
        }
    }
}

/// key: usage-counters -> process-local usage totals rendered next to HTTP metrics
#[derive(Debug, Default)]
pub struct UsageCounters {
    counters: DashMap<(&'static str, UsageLabels), f64>,
}

impl UsageCounters {
    pub fn increment(&self, name: &'static str, labels: UsageLabels, value: f64) {
        if !value.is_finite() || value <= 0.0 {
            return;
        }
        *self.counters.entry((name, labels)).or_insert(0.0) += value;
    }

    pub fn get(&self, name: &'static str, labels: &UsageLabels) -> f64 {
        self.counters
            .get(&(name, labels.clone()))
            .map(|value| *value)
            .unwrap_or(0.0)
    }

    /// Prometheus text exposition of every counter.
    pub fn render(&self) -> String {
        let mut entries: Vec<((&'static str, UsageLabels), f64)> = self
            .counters
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));

        let mut out = String::new();
        let mut current = "";
        for ((name, labels), value) in entries {
            if name != current {
                let _ = writeln!(out, "# TYPE {name} counter");
                current = name;
            }
            let _ = writeln!(
                out,
                "{name}{{product=\"{}\",metric_id=\"{}\",billing_provider=\"{}\",status=\"{}\"}} {value}",
                labels.product, labels.metric_id, labels.billing_provider, labels.status
            );
        }
        out
    }
}

pub static USAGE_COUNTERS: Lazy<UsageCounters> = Lazy::new(UsageCounters::default);

/// Install the JSON tracing subscriber, filtered by `RUST_LOG`.
pub fn init_tracing() {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(status: &str) -> UsageLabels {
        UsageLabels {
            product: "rosa".into(),
            metric_id: "Cores".into(),
            billing_provider: "aws".into(),
            status: status.into(),
        }
    }

    #[test]
    fn counters_accumulate_and_render() {
        let counters = UsageCounters::default();
        counters.increment(BILLABLE_USAGE_METRIC, labels("pending"), 2.0);
        counters.increment(BILLABLE_USAGE_METRIC, labels("pending"), 3.5);
        counters.increment(BILLABLE_USAGE_METRIC, labels("pending"), -1.0);
        assert_eq!(counters.get(BILLABLE_USAGE_METRIC, &labels("pending")), 5.5);

        let rendered = counters.render();
        assert!(rendered.contains("# TYPE billable_usage_total counter"));
        assert!(rendered.contains(
            "billable_usage_total{product=\"rosa\",metric_id=\"Cores\",billing_provider=\"aws\",status=\"pending\"} 5.5"
        ));
    }
}
