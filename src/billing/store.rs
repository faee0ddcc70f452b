use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::{mapref::entry::Entry, DashMap};
use serde::Deserialize;
use uuid::Uuid;

use super::ledger::{LedgerOutcome, RemittanceCalculation};
use super::models::{
    BillingProvider, RemittanceErrorCode, RemittanceKey, RemittanceRow, RemittanceStatus,
};
use crate::error::BillingResult;
use crate::messaging::{MemoryMessageBus, OutboundMessage};

/// Result of the ledger's read-compute step for one key.
#[derive(Debug, Clone, PartialEq)]
pub enum LedgerDecision {
    Unchanged {
        calculation: RemittanceCalculation,
    },
    /// Persist `row` and enqueue `outbox` atomically with it.
    Write {
        calculation: RemittanceCalculation,
        row: RemittanceRow,
        outbox: Option<OutboundMessage>,
    },
}

pub type DecideFn<'a> =
    &'a (dyn Fn(Option<&RemittanceRow>) -> BillingResult<LedgerDecision> + Send + Sync);

#[derive(Debug, Clone, PartialEq)]
pub struct StatusUpdate {
    /// Tally the acknowledged emission came from; rows rewritten since then are left alone.
    pub tally_id: Uuid,
    pub status: RemittanceStatus,
    pub error_code: Option<RemittanceErrorCode>,
    pub billed_on: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RemittanceFilter {
    pub org_id: String,
    #[serde(default)]
    pub product_id: Option<String>,
    #[serde(default)]
    pub metric_id: Option<String>,
    #[serde(default)]
    pub billing_provider: Option<BillingProvider>,
    #[serde(default)]
    pub billing_account_id: Option<String>,
    #[serde(default)]
    pub beginning: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ending: Option<DateTime<Utc>>,
}

impl RemittanceFilter {
    pub fn for_org(org_id: impl Into<String>) -> Self {
        Self {
            org_id: org_id.into(),
            ..Self::default()
        }
    }

    pub fn matches(&self, row: &RemittanceRow) -> bool {
        let key = &row.key;
        key.org_id == self.org_id
            && self.product_id.as_ref().map_or(true, |p| &key.product_id == p)
            && self.metric_id.as_ref().map_or(true, |m| &key.metric_id == m)
            && self
                .billing_provider
                .map_or(true, |p| key.billing_provider == p)
            && self
                .billing_account_id
                .as_ref()
                .map_or(true, |a| &key.billing_account_id == a)
            && self
                .beginning
                .map_or(true, |b| row.remittance_pending_date >= b)
            && self.ending.map_or(true, |e| row.remittance_pending_date <= e)
    }
}

/// Zero out remitted values for a product over a pending-date range.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResetRequest {
    pub product_id: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    #[serde(default)]
    pub org_ids: Vec<String>,
    #[serde(default)]
    pub billing_account_ids: Vec<String>,
}

impl ResetRequest {
    pub fn matches(&self, row: &RemittanceRow) -> bool {
        row.key.product_id == self.product_id
            && row.remittance_pending_date >= self.start
            && row.remittance_pending_date <= self.end
            && (self.org_ids.contains(&row.key.org_id)
                || self.billing_account_ids.contains(&row.key.billing_account_id))
    }
}

/// key: remittance-store -> repository over remittance rows
#[async_trait]
pub trait RemittanceStore: Send + Sync {
    /// Read the row for `key`, decide, and write in one atomic unit. The outcome carries the
    /// decided calculation and the row as written.
    async fn reconcile(
        &self,
        key: &RemittanceKey,
        decide: DecideFn<'_>,
    ) -> BillingResult<LedgerOutcome>;

    async fn find_by_key(&self, key: &RemittanceKey) -> BillingResult<Option<RemittanceRow>>;

    async fn find(&self, filter: &RemittanceFilter) -> BillingResult<Vec<RemittanceRow>>;

    async fn find_by_tally(&self, tally_id: Uuid) -> BillingResult<Vec<RemittanceRow>>;

    /// Apply `update` to every listed row still `Pending` and still carrying `update.tally_id`.
    /// Returns the number of rows changed.
    async fn update_status(&self, ids: &[Uuid], update: &StatusUpdate) -> BillingResult<u64>;

    /// Put the row back to `Pending` awaiting redelivery and enqueue `republish` with it.
    async fn mark_retry(
        &self,
        id: Uuid,
        retry_after: DateTime<Utc>,
        republish: Option<OutboundMessage>,
    ) -> BillingResult<Option<RemittanceRow>>;

    async fn delete_older_than(&self, org_id: &str, cutoff: DateTime<Utc>) -> BillingResult<u64>;

    async fn delete_by_org(&self, org_id: &str) -> BillingResult<u64>;

    async fn reset_remitted_value(&self, request: &ResetRequest) -> BillingResult<u64>;

    /// Fail rows stuck in `Pending` since before `cutoff`.
    async fn fail_stuck_pending(&self, cutoff: DateTime<Utc>) -> BillingResult<u64>;
}

/// key: memory-remittance-store -> DashMap rows, per-key entry locks as the transaction
pub struct MemoryRemittanceStore {
    rows: DashMap<RemittanceKey, RemittanceRow>,
    outbox: Arc<MemoryMessageBus>,
}

impl MemoryRemittanceStore {
    pub fn new(outbox: Arc<MemoryMessageBus>) -> Self {
        Self {
            rows: DashMap::new(),
            outbox,
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn insert(&self, row: RemittanceRow) {
        self.rows.insert(row.key.clone(), row);
    }

    fn collect(&self, predicate: impl Fn(&RemittanceRow) -> bool) -> Vec<RemittanceRow> {
        let mut rows: Vec<RemittanceRow> = self
            .rows
            .iter()
            .filter(|entry| predicate(entry.value()))
            .map(|entry| entry.value().clone())
            .collect();
        rows.sort_by_key(|row| row.remittance_pending_date);
        rows
    }

    fn flush_outbox(&self, outbox: Option<OutboundMessage>) {
        if let Some(message) = outbox {
            self.outbox.enqueue(message);
        }
    }

    fn remove_where(&self, predicate: impl Fn(&RemittanceRow) -> bool) -> u64 {
        let before = self.rows.len();
        self.rows.retain(|_, row| !predicate(row));
        (before - self.rows.len()) as u64
    }
}

#[async_trait]
impl RemittanceStore for MemoryRemittanceStore {
    async fn reconcile(
        &self,
        key: &RemittanceKey,
        decide: DecideFn<'_>,
    ) -> BillingResult<LedgerOutcome> {
        let outcome = match self.rows.entry(key.clone()) {
            Entry::Occupied(mut entry) => match decide(Some(entry.get()))? {
                LedgerDecision::Unchanged { calculation } => LedgerOutcome {
                    calculation,
                    row: None,
                },
                LedgerDecision::Write {
                    calculation,
                    row,
                    outbox,
                } => {
                    entry.insert(row.clone());
                    self.flush_outbox(outbox);
                    LedgerOutcome {
                        calculation,
                        row: Some(row),
                    }
                }
            },
            Entry::Vacant(entry) => match decide(None)? {
                LedgerDecision::Unchanged { calculation } => LedgerOutcome {
                    calculation,
                    row: None,
                },
                LedgerDecision::Write {
                    calculation,
                    row,
                    outbox,
                } => {
                    entry.insert(row.clone());
                    self.flush_outbox(outbox);
                    LedgerOutcome {
                        calculation,
                        row: Some(row),
                    }
                }
            },
        };
        Ok(outcome)
    }

    async fn find_by_key(&self, key: &RemittanceKey) -> BillingResult<Option<RemittanceRow>> {
        Ok(self.rows.get(key).map(|row| row.value().clone()))
    }

    async fn find(&self, filter: &RemittanceFilter) -> BillingResult<Vec<RemittanceRow>> {
        Ok(self.collect(|row| filter.matches(row)))
    }

    async fn find_by_tally(&self, tally_id: Uuid) -> BillingResult<Vec<RemittanceRow>> {
        Ok(self.collect(|row| row.tally_id == tally_id))
    }

    async fn update_status(&self, ids: &[Uuid], update: &StatusUpdate) -> BillingResult<u64> {
        let now = Utc::now();
        let mut changed = 0;
        for mut entry in self.rows.iter_mut() {
            let row = entry.value_mut();
            if ids.contains(&row.id)
                && row.tally_id == update.tally_id
                && row.status == RemittanceStatus::Pending
            {
                row.status = update.status;
                row.error_code = update.error_code;
                row.billed_on = update.billed_on;
                row.updated_at = now;
                changed += 1;
            }
        }
        Ok(changed)
    }

    async fn mark_retry(
        &self,
        id: Uuid,
        retry_after: DateTime<Utc>,
        republish: Option<OutboundMessage>,
    ) -> BillingResult<Option<RemittanceRow>> {
        let updated = self
            .rows
            .iter_mut()
            .find(|entry| entry.value().id == id)
            .map(|mut entry| {
                let row = entry.value_mut();
                row.status = RemittanceStatus::Pending;
                row.retry_after = Some(retry_after);
                row.billed_on = None;
                row.error_code = None;
                row.updated_at = Utc::now();
                let updated = row.clone();
                self.flush_outbox(republish);
                updated
            });
        Ok(updated)
    }

    async fn delete_older_than(&self, org_id: &str, cutoff: DateTime<Utc>) -> BillingResult<u64> {
        Ok(self.remove_where(|row| row.key.org_id == org_id && row.remittance_pending_date < cutoff))
    }

    async fn delete_by_org(&self, org_id: &str) -> BillingResult<u64> {
        Ok(self.remove_where(|row| row.key.org_id == org_id))
    }

    async fn reset_remitted_value(&self, request: &ResetRequest) -> BillingResult<u64> {
        let now = Utc::now();
        let mut changed = 0;
        for mut entry in self.rows.iter_mut() {
            let row = entry.value_mut();
            if request.matches(row) {
                row.remitted_value = 0.0;
                row.gratis_value = 0.0;
                row.last_current_total = 0.0;
                row.updated_at = now;
                changed += 1;
            }
        }
        Ok(changed)
    }

    async fn fail_stuck_pending(&self, cutoff: DateTime<Utc>) -> BillingResult<u64> {
        let now = Utc::now();
        let mut changed = 0;
        for mut entry in self.rows.iter_mut() {
            let row = entry.value_mut();
            if row.status == RemittanceStatus::Pending && row.remittance_pending_date < cutoff {
                row.status = RemittanceStatus::Failed;
                row.error_code = Some(RemittanceErrorCode::Unknown);
                row.updated_at = now;
                changed += 1;
            }
        }
        Ok(changed)
    }
}
