use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use sqlx::{postgres::PgRow, Executor, PgPool, Postgres, Row};

use crate::error::{BillingError, BillingResult};

pub const BILLABLE_USAGE_OUT_TOPIC: &str = "billable-usage-out";
pub const BILLABLE_USAGE_STATUS_TOPIC: &str = "billable-usage-status";
pub const BILLABLE_USAGE_DEAD_LETTER_TOPIC: &str = "billable-usage-dead-letter";
pub const ENABLED_ORGS_TOPIC: &str = "enabled-orgs";
pub const TALLY_SUMMARY_TOPIC: &str = "tally-summary";

pub const RETRY_AFTER_HEADER: &str = "retry_after";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Queued,
    Processing,
    Poisoned,
    Dead,
    Acked,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Queued => "queued",
            MessageStatus::Processing => "processing",
            MessageStatus::Poisoned => "poisoned",
            MessageStatus::Dead => "dead",
            MessageStatus::Acked => "acked",
        }
    }
}

/// A message waiting to be written to a topic.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub topic: String,
    pub payload: Value,
    pub headers: HashMap<String, String>,
    pub available_at: Option<DateTime<Utc>>,
}

impl OutboundMessage {
    pub fn new<T: Serialize>(topic: &str, payload: &T) -> BillingResult<Self> {
        Ok(Self {
            topic: topic.to_string(),
            payload: serde_json::to_value(payload)?,
            headers: HashMap::new(),
            available_at: None,
        })
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_string(), value.into());
        self
    }

    pub fn deliver_at(mut self, at: DateTime<Utc>) -> Self {
        self.available_at = Some(at);
        self
    }
}

/// A claimed message. `attempts` counts this delivery.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub id: i64,
    pub topic: String,
    pub payload: Value,
    pub headers: HashMap<String, String>,
    pub attempts: i32,
}

impl Delivery {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }
}

#[derive(Debug, Clone)]
pub struct MessageBusConfig {
    pub max_attempts: i32,
    pub visibility_timeout: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for MessageBusConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            visibility_timeout: Duration::from_secs(300),
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(300),
        }
    }
}

impl MessageBusConfig {
    /// Redelivery delay after the given (1-based) attempt.
    pub fn backoff_for(&self, attempts: i32) -> Duration {
        let exponent = attempts.saturating_sub(1).clamp(0, 20) as u32;
        self.initial_backoff
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(self.max_backoff)
    }
}

fn chrono_duration(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::seconds(0))
}

/// key: message-bus -> at-least-once topic delivery (publish/claim/ack/retry/poison)
#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn publish(&self, message: OutboundMessage) -> BillingResult<i64>;

    async fn publish_at(
        &self,
        message: OutboundMessage,
        at: DateTime<Utc>,
    ) -> BillingResult<i64> {
        self.publish(message.deliver_at(at)).await
    }

    /// Claim the next available message on `topic`, if any.
    async fn claim(&self, topic: &str) -> BillingResult<Option<Delivery>>;

    async fn ack(&self, delivery: &Delivery) -> BillingResult<()>;

    /// Release for redelivery with backoff; dead once attempts are exhausted.
    async fn retry(&self, delivery: &Delivery, error: &str) -> BillingResult<()>;

    /// Acknowledge without processing and keep the message for manual remediation.
    async fn poison(&self, delivery: &Delivery, error: &str) -> BillingResult<()>;
}

/// Write a message through any executor, so callers can enqueue inside their own transaction.
pub async fn enqueue<'c, E>(executor: E, message: &OutboundMessage) -> BillingResult<i64>
where
    E: Executor<'c, Database = Postgres>,
{
    let headers = serde_json::to_value(&message.headers)?;
    let id: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO message_queue (topic, payload, headers, available_at)
        VALUES ($1, $2, $3, COALESCE($4, NOW()))
        RETURNING id
        "#,
    )
    .bind(&message.topic)
    .bind(&message.payload)
    .bind(headers)
    .bind(message.available_at)
    .fetch_one(executor)
    .await?;
    Ok(id)
}

fn map_delivery(row: &PgRow) -> BillingResult<Delivery> {
    let headers: Value = row.get("headers");
    Ok(Delivery {
        id: row.get("id"),
        topic: row.get("topic"),
        payload: row.get("payload"),
        headers: serde_json::from_value(headers)?,
        attempts: row.get("attempts"),
    })
}

/// key: pg-message-bus -> message_queue table with SKIP LOCKED claims
#[derive(Clone)]
pub struct PgMessageBus {
    pool: PgPool,
    config: MessageBusConfig,
}

impl PgMessageBus {
    pub fn new(pool: PgPool, config: MessageBusConfig) -> Self {
        Self { pool, config }
    }
}

#[async_trait]
impl MessageBus for PgMessageBus {
    async fn publish(&self, message: OutboundMessage) -> BillingResult<i64> {
        enqueue(&self.pool, &message).await
    }

    async fn claim(&self, topic: &str) -> BillingResult<Option<Delivery>> {
        let stale_before = Utc::now() - chrono_duration(self.config.visibility_timeout);

        sqlx::query(
            r#"
            UPDATE message_queue
            SET status = 'dead', locked_at = NULL, last_error = 'visibility timeout exceeded'
            WHERE topic = $1 AND status = 'processing' AND locked_at < $2 AND attempts >= $3
            "#,
        )
        .bind(topic)
        .bind(stale_before)
        .bind(self.config.max_attempts)
        .execute(&self.pool)
        .await?;

        let row = sqlx::query(
            r#"
            UPDATE message_queue
            SET status = 'processing', locked_at = NOW(), attempts = attempts + 1
            WHERE id = (
                SELECT id FROM message_queue
                WHERE topic = $1
                  AND available_at <= NOW()
                  AND (status = 'queued' OR (status = 'processing' AND locked_at < $2))
                ORDER BY available_at, id
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING id, topic, payload, headers, attempts
            "#,
        )
        .bind(topic)
        .bind(stale_before)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(map_delivery).transpose()
    }

    async fn ack(&self, delivery: &Delivery) -> BillingResult<()> {
        sqlx::query("DELETE FROM message_queue WHERE id = $1")
            .bind(delivery.id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn retry(&self, delivery: &Delivery, error: &str) -> BillingResult<()> {
        let available_at = Utc::now() + chrono_duration(self.config.backoff_for(delivery.attempts));
        sqlx::query(
            r#"
            UPDATE message_queue
            SET status = CASE WHEN attempts >= $2 THEN 'dead' ELSE 'queued' END,
                available_at = $3,
                locked_at = NULL,
                last_error = $4
            WHERE id = $1
            "#,
        )
        .bind(delivery.id)
        .bind(self.config.max_attempts)
        .bind(available_at)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn poison(&self, delivery: &Delivery, error: &str) -> BillingResult<()> {
        sqlx::query(
            "UPDATE message_queue SET status = 'poisoned', locked_at = NULL, last_error = $2 WHERE id = $1",
        )
        .bind(delivery.id)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MessageRecord {
    pub id: i64,
    pub topic: String,
    pub payload: Value,
    pub headers: HashMap<String, String>,
    pub status: MessageStatus,
    pub attempts: i32,
    pub available_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

/// key: memory-message-bus -> in-process bus with the same delivery semantics
#[derive(Debug, Default)]
pub struct MemoryMessageBus {
    messages: Mutex<Vec<MessageRecord>>,
    next_id: AtomicI64,
    config: MessageBusConfig,
}

impl MemoryMessageBus {
    pub fn new(config: MessageBusConfig) -> Self {
        Self {
            messages: Mutex::new(Vec::new()),
            next_id: AtomicI64::new(0),
            config,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<MessageRecord>> {
        self.messages
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Synchronous enqueue, usable while a caller holds its own lock.
    pub fn enqueue(&self, message: OutboundMessage) -> i64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.lock().push(MessageRecord {
            id,
            topic: message.topic,
            payload: message.payload,
            headers: message.headers,
            status: MessageStatus::Queued,
            attempts: 0,
            available_at: message.available_at.unwrap_or_else(Utc::now),
            last_error: None,
        });
        id
    }

    pub fn records(&self, topic: &str) -> Vec<MessageRecord> {
        self.lock()
            .iter()
            .filter(|record| record.topic == topic)
            .cloned()
            .collect()
    }

    pub fn payloads(&self, topic: &str) -> Vec<Value> {
        self.records(topic)
            .into_iter()
            .map(|record| record.payload)
            .collect()
    }

    fn update(&self, id: i64, apply: impl FnOnce(&mut MessageRecord)) -> BillingResult<()> {
        let mut messages = self.lock();
        let record = messages
            .iter_mut()
            .find(|record| record.id == id)
            .ok_or_else(|| BillingError::InvalidMessage(format!("unknown message {id}")))?;
        apply(record);
        Ok(())
    }
}

#[async_trait]
impl MessageBus for MemoryMessageBus {
    async fn publish(&self, message: OutboundMessage) -> BillingResult<i64> {
        Ok(self.enqueue(message))
    }

    async fn claim(&self, topic: &str) -> BillingResult<Option<Delivery>> {
        let now = Utc::now();
        let mut messages = self.lock();
        let next = messages
            .iter_mut()
            .filter(|record| {
                record.topic == topic
                    && record.status == MessageStatus::Queued
                    && record.available_at <= now
            })
            .min_by_key(|record| (record.available_at, record.id));
        Ok(next.map(|record| {
            record.status = MessageStatus::Processing;
            record.attempts += 1;
            Delivery {
                id: record.id,
                topic: record.topic.clone(),
                payload: record.payload.clone(),
                headers: record.headers.clone(),
                attempts: record.attempts,
            }
        }))
    }

    async fn ack(&self, delivery: &Delivery) -> BillingResult<()> {
        self.update(delivery.id, |record| record.status = MessageStatus::Acked)
    }

    async fn retry(&self, delivery: &Delivery, error: &str) -> BillingResult<()> {
        let max_attempts = self.config.max_attempts;
        let available_at = Utc::now() + chrono_duration(self.config.backoff_for(delivery.attempts));
        self.update(delivery.id, |record| {
            record.status = if record.attempts >= max_attempts {
                MessageStatus::Dead
            } else {
                MessageStatus::Queued
            };
            record.available_at = available_at;
            record.last_error = Some(error.to_string());
        })
    }

    async fn poison(&self, delivery: &Delivery, error: &str) -> BillingResult<()> {
        self.update(delivery.id, |record| {
            record.status = MessageStatus::Poisoned;
            record.last_error = Some(error.to_string());
        })
    }
}
