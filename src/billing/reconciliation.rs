use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::dead_letter::DeadLetterConsumer;
use super::emitter::{BillableUsageEvent, BillableUsageStatus, BillingEmitter};
use super::mapper::TallySummary;
use super::retention::{EnabledOrg, RetentionPurger};
use super::service::BillableUsageService;
use crate::error::{BillingError, BillingResult, Disposition};
use crate::messaging::{
    Delivery, MessageBus, BILLABLE_USAGE_DEAD_LETTER_TOPIC, BILLABLE_USAGE_STATUS_TOPIC,
    ENABLED_ORGS_TOPIC, RETRY_AFTER_HEADER, TALLY_SUMMARY_TOPIC,
};

/// Topics consumed by the reconciliation workers.
pub const CONSUMED_TOPICS: [&str; 4] = [
    TALLY_SUMMARY_TOPIC,
    BILLABLE_USAGE_STATUS_TOPIC,
    BILLABLE_USAGE_DEAD_LETTER_TOPIC,
    ENABLED_ORGS_TOPIC,
];

/// How a delivery was settled on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Acked,
    Retried,
    Poisoned,
}

/// key: billing-reconciliation -> message handlers per consumed topic
#[derive(Clone)]
pub struct ReconciliationHandlers {
    pub service: BillableUsageService,
    pub emitter: BillingEmitter,
    pub dead_letter: DeadLetterConsumer,
    pub purger: RetentionPurger,
}

fn decode<T: DeserializeOwned>(delivery: &Delivery) -> BillingResult<T> {
    serde_json::from_value(delivery.payload.clone()).map_err(|err| {
        BillingError::InvalidMessage(format!(
            "undecodable {} message {}: {err}",
            delivery.topic, delivery.id
        ))
    })
}

impl ReconciliationHandlers {
    pub async fn handle(&self, delivery: &Delivery) -> BillingResult<()> {
        match delivery.topic.as_str() {
            TALLY_SUMMARY_TOPIC => {
                let summary: TallySummary = decode(delivery)?;
                let outcomes = self.service.process_summary(&summary).await?;
                info!(
                    org_id = %summary.org_id,
                    dimensions = outcomes.len(),
                    "processed tally summary"
                );
            }
            BILLABLE_USAGE_STATUS_TOPIC => {
                let status: BillableUsageStatus = decode(delivery)?;
                self.emitter.handle_status(&status).await?;
            }
            BILLABLE_USAGE_DEAD_LETTER_TOPIC => {
                let event: BillableUsageEvent = decode(delivery)?;
                self.dead_letter
                    .handle(&event, delivery.header(RETRY_AFTER_HEADER))
                    .await?;
            }
            ENABLED_ORGS_TOPIC => {
                let org: EnabledOrg = decode(delivery)?;
                self.purger.purge(&org.org_id).await?;
            }
            other => {
                return Err(BillingError::InvalidMessage(format!(
                    "no handler for topic {other}"
                )))
            }
        }
        Ok(())
    }
}

/// Settle a processed delivery according to the outcome's disposition.
pub async fn settle(
    bus: &dyn MessageBus,
    delivery: &Delivery,
    outcome: BillingResult<()>,
) -> BillingResult<Settlement> {
    let Err(err) = outcome else {
        bus.ack(delivery).await?;
        return Ok(Settlement::Acked);
    };

    let reason = format!("{}: {err}", err.code());
    match err.disposition() {
        Disposition::Retry => {
            warn!(
                message_id = delivery.id,
                topic = %delivery.topic,
                attempts = delivery.attempts,
                code = err.code(),
                error = %err,
                "message processing failed; scheduling redelivery"
            );
            bus.retry(delivery, &reason).await?;
            Ok(Settlement::Retried)
        }
        Disposition::Reject => {
            error!(
                message_id = delivery.id,
                topic = %delivery.topic,
                code = err.code(),
                error = %err,
                payload = %delivery.payload,
                "message cannot be processed; preserving for remediation"
            );
            bus.poison(delivery, &reason).await?;
            Ok(Settlement::Poisoned)
        }
    }
}

/// Claim, handle and settle at most one message. `None` when the topic had nothing due.
pub async fn process_next(
    handlers: &ReconciliationHandlers,
    bus: &dyn MessageBus,
    topic: &str,
) -> BillingResult<Option<Settlement>> {
    let Some(delivery) = bus.claim(topic).await? else {
        return Ok(None);
    };
    let outcome = handlers.handle(&delivery).await;
    settle(bus, &delivery, outcome).await.map(Some)
}

/// key: billing-reconciliation-handle -> running workers and their shutdown signal
pub struct ReconciliationHandle {
    shutdown: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
}

impl ReconciliationHandle {
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Signal shutdown and wait for in-flight messages to settle.
    pub async fn shutdown(self) -> Result<()> {
        self.shutdown
            .send(true)
            .map_err(|err| anyhow!("failed to signal reconciliation shutdown: {err}"))?;
        for worker in self.workers {
            worker
                .await
                .map_err(|err| anyhow!("reconciliation worker panicked: {err}"))?;
        }
        info!("reconciliation workers stopped");
        Ok(())
    }
}

async fn run_worker(
    handlers: ReconciliationHandlers,
    bus: Arc<dyn MessageBus>,
    topic: &'static str,
    poll_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }
        match process_next(&handlers, bus.as_ref(), topic).await {
            Ok(Some(_)) => continue,
            Ok(None) => {}
            Err(err) => error!(?err, %topic, "failed to consume message"),
        }
        tokio::select! {
            _ = tokio::time::sleep(poll_interval) => {}
            _ = shutdown.changed() => {}
        }
    }
}

pub fn start_reconciliation_workers(
    handlers: ReconciliationHandlers,
    bus: Arc<dyn MessageBus>,
    concurrency: usize,
    poll_interval: Duration,
) -> ReconciliationHandle {
    let (shutdown, receiver) = watch::channel(false);
    let mut workers = Vec::new();
    for topic in CONSUMED_TOPICS {
        for _ in 0..concurrency.max(1) {
            workers.push(tokio::spawn(run_worker(
                handlers.clone(),
                bus.clone(),
                topic,
                poll_interval,
                receiver.clone(),
            )));
        }
    }
    info!(
        workers = workers.len(),
        topics = ?CONSUMED_TOPICS,
        "started reconciliation workers"
    );
    ReconciliationHandle { shutdown, workers }
}
