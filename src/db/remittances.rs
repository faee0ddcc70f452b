use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use sqlx::{postgres::PgRow, Executor, PgPool, Postgres, Row, Transaction};
use tracing::warn;
use uuid::Uuid;

use crate::billing::ledger::LedgerOutcome;
use crate::billing::models::{
    AccumulationPeriod, BillingProvider, RemittanceErrorCode, RemittanceKey, RemittanceRow,
    RemittanceStatus,
};
use crate::billing::store::{
    DecideFn, LedgerDecision, RemittanceFilter, RemittanceStore, ResetRequest, StatusUpdate,
};
use crate::error::{BillingError, BillingResult};
use crate::messaging::{self, OutboundMessage};

const SERIALIZATION_FAILURE: &str = "40001";
const UNIQUE_VIOLATION: &str = "23505";

pub type PgTransaction = Transaction<'static, Postgres>;

fn is_retryable_conflict(err: &BillingError) -> bool {
    match err {
        BillingError::Persistence(err) => err
            .as_database_error()
            .and_then(|db| db.code())
            .map(|code| code == SERIALIZATION_FAILURE || code == UNIQUE_VIOLATION)
            .unwrap_or(false),
        _ => false,
    }
}

/// Run `work` inside a SERIALIZABLE transaction, retrying the whole transaction on
/// serialization failures and unique violations. `work` receives the transaction by value
/// and hands it back with its result.
pub async fn within_transaction<'a, T, F>(
    pool: &PgPool,
    max_attempts: u32,
    mut work: F,
) -> BillingResult<T>
where
    F: FnMut(PgTransaction) -> BoxFuture<'a, (PgTransaction, BillingResult<T>)>,
{
    let max_attempts = max_attempts.max(1);
    let mut attempt = 1;
    loop {
        let mut tx = pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
            .execute(&mut tx)
            .await?;

        let (tx, result) = work(tx).await;
        let outcome = match result {
            Ok(value) => tx.commit().await.map(|_| value).map_err(BillingError::from),
            Err(err) => {
                if let Err(rollback) = tx.rollback().await {
                    warn!(?rollback, "failed to roll back remittance transaction");
                }
                Err(err)
            }
        };

        match outcome {
            Err(err) if attempt < max_attempts && is_retryable_conflict(&err) => {
                warn!(attempt, error = %err, "retrying conflicting remittance transaction");
                attempt += 1;
            }
            other => return other,
        }
    }
}

const SELECT_COLUMNS: &str = r#"
    id, org_id, product_id, metric_id, sla, usage, billing_provider, billing_account_id,
    accumulation_period, remitted_value, gratis_value, billing_factor, last_current_total,
    status, error_code, billed_on, retry_after, tally_id, remittance_pending_date, updated_at
"#;

fn map_row(row: &PgRow) -> BillingResult<RemittanceRow> {
    let provider: String = row.get("billing_provider");
    let status: String = row.get("status");
    let error_code: Option<String> = row.get("error_code");
    let period: String = row.get("accumulation_period");

    let billing_provider = BillingProvider::from_str(&provider).ok_or_else(|| {
        BillingError::InvalidMessage(format!("unknown billing provider `{provider}` in ledger"))
    })?;
    let status = RemittanceStatus::from_str(&status).ok_or_else(|| {
        BillingError::InvalidMessage(format!("unknown remittance status `{status}` in ledger"))
    })?;
    let error_code = match error_code {
        Some(code) => Some(RemittanceErrorCode::from_str(&code).ok_or_else(|| {
            BillingError::InvalidMessage(format!("unknown error code `{code}` in ledger"))
        })?),
        None => None,
    };

    Ok(RemittanceRow {
        id: row.get("id"),
        key: RemittanceKey {
            org_id: row.get("org_id"),
            product_id: row.get("product_id"),
            metric_id: row.get("metric_id"),
            sla: row.get("sla"),
            usage: row.get("usage"),
            billing_provider,
            billing_account_id: row.get("billing_account_id"),
            accumulation_period: AccumulationPeriod::from(period),
        },
        remitted_value: row.get("remitted_value"),
        gratis_value: row.get("gratis_value"),
        billing_factor: row.get("billing_factor"),
        last_current_total: row.get("last_current_total"),
        status,
        error_code,
        billed_on: row.get("billed_on"),
        retry_after: row.get("retry_after"),
        tally_id: row.get("tally_id"),
        remittance_pending_date: row.get("remittance_pending_date"),
        updated_at: row.get("updated_at"),
    })
}

fn map_rows(rows: Vec<PgRow>) -> BillingResult<Vec<RemittanceRow>> {
    rows.iter().map(map_row).collect()
}

pub async fn get_for_update<'c, E>(
    executor: E,
    key: &RemittanceKey,
) -> BillingResult<Option<RemittanceRow>>
where
    E: Executor<'c, Database = Postgres>,
{
    let sql = format!(
        r#"
        SELECT {SELECT_COLUMNS}
        FROM billable_usage_remittance
        WHERE org_id = $1
          AND product_id = $2
          AND metric_id = $3
          AND sla = $4
          AND usage = $5
          AND billing_provider = $6
          AND billing_account_id = $7
          AND accumulation_period = $8
        FOR UPDATE
        "#
    );
    let row = sqlx::query(&sql)
        .bind(&key.org_id)
        .bind(&key.product_id)
        .bind(&key.metric_id)
        .bind(&key.sla)
        .bind(&key.usage)
        .bind(key.billing_provider.as_str())
        .bind(&key.billing_account_id)
        .bind(key.accumulation_period.as_str())
        .fetch_optional(executor)
        .await?;
    row.as_ref().map(map_row).transpose()
}

pub async fn upsert<'c, E>(executor: E, row: &RemittanceRow) -> BillingResult<RemittanceRow>
where
    E: Executor<'c, Database = Postgres>,
{
    let sql = format!(
        r#"
        INSERT INTO billable_usage_remittance (
            id, org_id, product_id, metric_id, sla, usage, billing_provider,
            billing_account_id, accumulation_period, remitted_value, gratis_value,
            billing_factor, last_current_total, status, error_code, billed_on, retry_after,
            tally_id, remittance_pending_date, updated_at
        ) VALUES (
            $1, $2, $3, $4, $5, $6, $7, $8, $9, $10,
            $11, $12, $13, $14, $15, $16, $17, $18, $19, $20
        )
        ON CONFLICT (
            org_id, product_id, metric_id, sla, usage, billing_provider,
            billing_account_id, accumulation_period
        ) DO UPDATE SET
            remitted_value = EXCLUDED.remitted_value,
            gratis_value = EXCLUDED.gratis_value,
            billing_factor = EXCLUDED.billing_factor,
            last_current_total = EXCLUDED.last_current_total,
            status = EXCLUDED.status,
            error_code = EXCLUDED.error_code,
            billed_on = EXCLUDED.billed_on,
            retry_after = EXCLUDED.retry_after,
            tally_id = EXCLUDED.tally_id,
            remittance_pending_date = EXCLUDED.remittance_pending_date,
            updated_at = EXCLUDED.updated_at
        RETURNING {SELECT_COLUMNS}
        "#
    );
    let key = &row.key;
    let written = sqlx::query(&sql)
        .bind(row.id)
        .bind(&key.org_id)
        .bind(&key.product_id)
        .bind(&key.metric_id)
        .bind(&key.sla)
        .bind(&key.usage)
        .bind(key.billing_provider.as_str())
        .bind(&key.billing_account_id)
        .bind(key.accumulation_period.as_str())
        .bind(row.remitted_value)
        .bind(row.gratis_value)
        .bind(row.billing_factor)
        .bind(row.last_current_total)
        .bind(row.status.as_str())
        .bind(row.error_code.map(|code| code.as_str()))
        .bind(row.billed_on)
        .bind(row.retry_after)
        .bind(row.tally_id)
        .bind(row.remittance_pending_date)
        .bind(row.updated_at)
        .fetch_one(executor)
        .await?;
    map_row(&written)
}

async fn reconcile_in(
    tx: &mut PgTransaction,
    key: &RemittanceKey,
    decide: DecideFn<'_>,
) -> BillingResult<LedgerOutcome> {
    let existing = get_for_update(&mut *tx, key).await?;
    match decide(existing.as_ref())? {
        LedgerDecision::Unchanged { calculation } => Ok(LedgerOutcome {
            calculation,
            row: None,
        }),
        LedgerDecision::Write {
            calculation,
            row,
            outbox,
        } => {
            let written = upsert(&mut *tx, &row).await?;
            if let Some(message) = outbox {
                messaging::enqueue(&mut *tx, &message).await?;
            }
            Ok(LedgerOutcome {
                calculation,
                row: Some(written),
            })
        }
    }
}

async fn mark_retry_in(
    tx: &mut PgTransaction,
    id: Uuid,
    retry_after: DateTime<Utc>,
    republish: Option<&OutboundMessage>,
) -> BillingResult<Option<RemittanceRow>> {
    let sql = format!(
        r#"
        UPDATE billable_usage_remittance
        SET status = 'pending',
            retry_after = $2,
            billed_on = NULL,
            error_code = NULL,
            updated_at = NOW()
        WHERE id = $1
        RETURNING {SELECT_COLUMNS}
        "#
    );
    let row = sqlx::query(&sql)
        .bind(id)
        .bind(retry_after)
        .fetch_optional(&mut *tx)
        .await?;
    let Some(row) = row else {
        return Ok(None);
    };
    if let Some(message) = republish {
        messaging::enqueue(&mut *tx, message).await?;
    }
    map_row(&row).map(Some)
}

/// key: pg-remittance-store -> billable_usage_remittance table
#[derive(Clone)]
pub struct PgRemittanceStore {
    pool: PgPool,
    max_transaction_attempts: u32,
}

impl PgRemittanceStore {
    pub fn new(pool: PgPool, max_transaction_attempts: u32) -> Self {
        Self {
            pool,
            max_transaction_attempts,
        }
    }
}

#[async_trait]
impl RemittanceStore for PgRemittanceStore {
    async fn reconcile(
        &self,
        key: &RemittanceKey,
        decide: DecideFn<'_>,
    ) -> BillingResult<LedgerOutcome> {
        within_transaction(&self.pool, self.max_transaction_attempts, |mut tx| {
            Box::pin(async move {
                let result = reconcile_in(&mut tx, key, decide).await;
                (tx, result)
            })
        })
        .await
    }

    async fn find_by_key(&self, key: &RemittanceKey) -> BillingResult<Option<RemittanceRow>> {
        let sql = format!(
            r#"
            SELECT {SELECT_COLUMNS}
            FROM billable_usage_remittance
            WHERE org_id = $1 AND product_id = $2 AND metric_id = $3 AND sla = $4
              AND usage = $5 AND billing_provider = $6 AND billing_account_id = $7
              AND accumulation_period = $8
            "#
        );
        let row = sqlx::query(&sql)
            .bind(&key.org_id)
            .bind(&key.product_id)
            .bind(&key.metric_id)
            .bind(&key.sla)
            .bind(&key.usage)
            .bind(key.billing_provider.as_str())
            .bind(&key.billing_account_id)
            .bind(key.accumulation_period.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(map_row).transpose()
    }

    async fn find(&self, filter: &RemittanceFilter) -> BillingResult<Vec<RemittanceRow>> {
        let sql = format!(
            r#"
            SELECT {SELECT_COLUMNS}
            FROM billable_usage_remittance
            WHERE org_id = $1
              AND ($2::text IS NULL OR product_id = $2)
              AND ($3::text IS NULL OR metric_id = $3)
              AND ($4::text IS NULL OR billing_provider = $4)
              AND ($5::text IS NULL OR billing_account_id = $5)
              AND ($6::timestamptz IS NULL OR remittance_pending_date >= $6)
              AND ($7::timestamptz IS NULL OR remittance_pending_date <= $7)
            ORDER BY remittance_pending_date
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(&filter.org_id)
            .bind(filter.product_id.as_deref())
            .bind(filter.metric_id.as_deref())
            .bind(filter.billing_provider.map(|provider| provider.as_str()))
            .bind(filter.billing_account_id.as_deref())
            .bind(filter.beginning)
            .bind(filter.ending)
            .fetch_all(&self.pool)
            .await?;
        map_rows(rows)
    }

    async fn find_by_tally(&self, tally_id: Uuid) -> BillingResult<Vec<RemittanceRow>> {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM billable_usage_remittance WHERE tally_id = $1 ORDER BY remittance_pending_date"
        );
        let rows = sqlx::query(&sql)
            .bind(tally_id)
            .fetch_all(&self.pool)
            .await?;
        map_rows(rows)
    }

    async fn update_status(&self, ids: &[Uuid], update: &StatusUpdate) -> BillingResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE billable_usage_remittance
            SET status = $2, error_code = $3, billed_on = $4, updated_at = NOW()
            WHERE id = ANY($1) AND tally_id = $5 AND status = 'pending'
            "#,
        )
        .bind(ids)
        .bind(update.status.as_str())
        .bind(update.error_code.map(|code| code.as_str()))
        .bind(update.billed_on)
        .bind(update.tally_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn mark_retry(
        &self,
        id: Uuid,
        retry_after: DateTime<Utc>,
        republish: Option<OutboundMessage>,
    ) -> BillingResult<Option<RemittanceRow>> {
        let republish = republish.as_ref();
        within_transaction(&self.pool, self.max_transaction_attempts, |mut tx| {
            Box::pin(async move {
                let result = mark_retry_in(&mut tx, id, retry_after, republish).await;
                (tx, result)
            })
        })
        .await
    }

    async fn delete_older_than(&self, org_id: &str, cutoff: DateTime<Utc>) -> BillingResult<u64> {
        let result = sqlx::query(
            "DELETE FROM billable_usage_remittance WHERE org_id = $1 AND remittance_pending_date < $2",
        )
        .bind(org_id)
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn delete_by_org(&self, org_id: &str) -> BillingResult<u64> {
        let result = sqlx::query("DELETE FROM billable_usage_remittance WHERE org_id = $1")
            .bind(org_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn reset_remitted_value(&self, request: &ResetRequest) -> BillingResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE billable_usage_remittance
            SET remitted_value = 0, gratis_value = 0, last_current_total = 0, updated_at = NOW()
            WHERE product_id = $1
              AND remittance_pending_date BETWEEN $2 AND $3
              AND (org_id = ANY($4) OR billing_account_id = ANY($5))
            "#,
        )
        .bind(&request.product_id)
        .bind(request.start)
        .bind(request.end)
        .bind(&request.org_ids)
        .bind(&request.billing_account_ids)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn fail_stuck_pending(&self, cutoff: DateTime<Utc>) -> BillingResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE billable_usage_remittance
            SET status = 'failed', error_code = 'unknown', updated_at = NOW()
            WHERE status = 'pending' AND remittance_pending_date < $1
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
