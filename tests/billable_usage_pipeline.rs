use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use billable_usage::billing::{
    process_next, start_reconciliation_workers, BillableUsage, BillableUsageEvent,
    BillableUsageService, BillableUsageStatus, BillingEmitter, BillingProvider, Contract,
    ContractCoverageResolver, ContractMetric, ContractQuery, ContractsApi, DeadLetterConsumer,
    Granularity, MemoryRemittanceStore, ProductCatalog, ReconciliationHandlers,
    RemittanceErrorCode, RemittanceFilter, RemittanceLedger, RemittanceStatus, RemittanceStore,
    RetentionPurger, Settlement, TallyMeasurement, TallySnapshot, TallySummary,
};
use billable_usage::messaging::{
    MemoryMessageBus, MessageBus, MessageBusConfig, MessageStatus, OutboundMessage,
    BILLABLE_USAGE_DEAD_LETTER_TOPIC, BILLABLE_USAGE_OUT_TOPIC, BILLABLE_USAGE_STATUS_TOPIC,
    ENABLED_ORGS_TOPIC, RETRY_AFTER_HEADER, TALLY_SUMMARY_TOPIC,
};
use billable_usage::{BillingError, BillingResult};
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::json;
use uuid::Uuid;

const CATALOG: &str = r#"
products:
  - product_id: rosa
    payg_eligible: true
    contract_enabled: true
    metrics:
      - metric_id: Cores
        billing_factor: 0.5
        aws_dimension: four_vcpu_hour
      - metric_id: Instance-hours
        azure_dimension: control_plane
  - product_id: rhel-payg
    payg_eligible: true
    metrics:
      - metric_id: vCPUs
        billing_factor: 0.25
        aws_dimension: vcpu_hours
  - product_id: rhacs
    payg_eligible: true
    contract_enabled: true
    metrics:
      - metric_id: Cores
        gratis: true
        aws_dimension: cpu_hours
"#;

#[derive(Default)]
struct StubContracts {
    contracts: Mutex<Vec<Contract>>,
    failure: Mutex<Option<String>>,
}

impl StubContracts {
    fn set(&self, contracts: Vec<Contract>) {
        *self.contracts.lock().unwrap() = contracts;
    }
}

#[async_trait]
impl ContractsApi for StubContracts {
    async fn get_contracts(&self, query: &ContractQuery) -> BillingResult<Vec<Contract>> {
        if let Some(reason) = self.failure.lock().unwrap().clone() {
            return Err(BillingError::ExternalService(reason));
        }
        Ok(self
            .contracts
            .lock()
            .unwrap()
            .iter()
            .filter(|contract| {
                contract.org_id == query.org_id && contract.product_id == query.product_id
            })
            .cloned()
            .collect())
    }
}

struct Harness {
    bus: Arc<MemoryMessageBus>,
    store: Arc<MemoryRemittanceStore>,
    contracts: Arc<StubContracts>,
    handlers: ReconciliationHandlers,
}

fn harness_with(catalog: &str, retention: Option<Duration>) -> Harness {
    let bus = Arc::new(MemoryMessageBus::new(MessageBusConfig {
        initial_backoff: std::time::Duration::from_millis(0),
        ..MessageBusConfig::default()
    }));
    let store = Arc::new(MemoryRemittanceStore::new(bus.clone()));
    let contracts = Arc::new(StubContracts::default());
    let handlers = handlers_for(catalog, store.clone(), contracts.clone(), retention);
    Harness {
        bus,
        store,
        contracts,
        handlers,
    }
}

fn harness() -> Harness {
    harness_with(CATALOG, None)
}

fn handlers_for(
    catalog: &str,
    store: Arc<MemoryRemittanceStore>,
    contracts: Arc<StubContracts>,
    retention: Option<Duration>,
) -> ReconciliationHandlers {
    let catalog = Arc::new(ProductCatalog::from_yaml(catalog).unwrap());
    let store: Arc<dyn RemittanceStore> = store;
    ReconciliationHandlers {
        service: BillableUsageService::new(
            catalog.clone(),
            ContractCoverageResolver::new(contracts, catalog),
            RemittanceLedger::new(store.clone()),
            Duration::minutes(30),
        ),
        emitter: BillingEmitter::new(store.clone()),
        dead_letter: DeadLetterConsumer::new(store.clone()),
        purger: RetentionPurger::new(store, retention),
    }
}

fn june(day: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, day, 12, 0, 0).unwrap()
}

fn usage(org: &str, product: &str, metric: &str, current_total: f64, at: DateTime<Utc>) -> BillableUsage {
    BillableUsage {
        org_id: org.into(),
        tally_id: Uuid::new_v4(),
        product_id: product.into(),
        metric_id: metric.into(),
        sla: "Premium".into(),
        usage: "Production".into(),
        billing_provider: BillingProvider::Aws,
        billing_account_id: "acct-1".into(),
        vendor_product_code: Some("vpc".into()),
        value: current_total,
        current_total,
        snapshot_date: at,
    }
}

fn contract(
    org: &str,
    product: &str,
    metric: &str,
    value: f64,
    start: DateTime<Utc>,
    end: Option<DateTime<Utc>>,
    gratis: bool,
) -> Contract {
    Contract {
        org_id: org.into(),
        product_id: product.into(),
        vendor_product_code: Some("vpc".into()),
        billing_provider: Some("aws".into()),
        billing_account_id: Some("acct-1".into()),
        start_date: start,
        end_date: end,
        metrics: vec![ContractMetric {
            metric_id: metric.into(),
            value,
        }],
        gratis,
    }
}

fn emitted(bus: &MemoryMessageBus) -> Vec<BillableUsageEvent> {
    bus.payloads(BILLABLE_USAGE_OUT_TOPIC)
        .into_iter()
        .map(|payload| serde_json::from_value(payload).unwrap())
        .collect()
}

async fn billed(h: &Harness, observation: &BillableUsage) -> f64 {
    h.handlers
        .service
        .process(observation)
        .await
        .unwrap()
        .billed_units()
}

#[tokio::test]
async fn replaying_an_observation_bills_nothing_and_leaves_the_row_alone() {
    let h = harness();
    let observation = usage("org1", "rhel-payg", "vCPUs", 8.0, june(3));

    assert_eq!(billed(&h, &observation).await, 2.0);
    let key = observation.remittance_key();
    let before = h.store.find_by_key(&key).await.unwrap().unwrap();

    assert_eq!(billed(&h, &observation).await, 0.0);
    let after = h.store.find_by_key(&key).await.unwrap().unwrap();
    assert_eq!(before, after);
    assert_eq!(emitted(&h.bus).len(), 1);
}

#[tokio::test]
async fn progression_bills_only_the_increment() {
    let h = harness();
    assert_eq!(
        billed(&h, &usage("org1", "rhel-payg", "vCPUs", 8.0, june(3))).await,
        2.0
    );
    assert_eq!(
        billed(&h, &usage("org1", "rhel-payg", "vCPUs", 16.0, june(4))).await,
        2.0
    );

    let rows = h
        .store
        .find(&RemittanceFilter::for_org("org1"))
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].remitted_value, 4.0);
    assert_eq!(rows[0].billing_factor, 0.25);
    assert_eq!(rows[0].status, RemittanceStatus::Pending);

    let events = emitted(&h.bus);
    assert_eq!(events.len(), 2);
    assert!(events.iter().all(|event| event.remittance_id == rows[0].id));
}

#[tokio::test]
async fn chunking_never_changes_the_total_billed() {
    let h = harness();
    for (day, total) in [(2, 3.3), (3, 7.9), (4, 8.0), (5, 12.1)] {
        h.handlers
            .service
            .process(&usage("chunked", "rhel-payg", "vCPUs", total, june(day)))
            .await
            .unwrap();
    }
    h.handlers
        .service
        .process(&usage("single", "rhel-payg", "vCPUs", 12.1, june(5)))
        .await
        .unwrap();

    let total_for = |org: &str| -> f64 {
        emitted(&h.bus)
            .iter()
            .filter(|event| event.org_id == org)
            .map(|event| event.billed_value)
            .sum()
    };
    assert_eq!(total_for("chunked"), 3.25);
    assert_eq!(total_for("single"), 3.25);
}

#[tokio::test]
async fn contract_coverage_offsets_usage_across_windows() {
    let h = harness();
    h.contracts.set(vec![
        contract("org1", "rosa", "four_vcpu_hour", 100.0, june(1), Some(june(15)), false),
        contract("org1", "rosa", "four_vcpu_hour", 200.0, june(16), None, false),
    ]);

    let mut deltas = Vec::new();
    for (day, total) in [(2, 100.0), (5, 250.0), (10, 400.0), (20, 500.0), (25, 601.25)] {
        deltas.push(billed(&h, &usage("org1", "rosa", "Cores", total, june(day))).await);
    }
    assert_eq!(deltas, vec![0.0, 25.0, 75.0, 0.0, 1.0]);

    let rows = h
        .store
        .find(&RemittanceFilter::for_org("org1"))
        .await
        .unwrap();
    assert_eq!(rows[0].remitted_value, 101.0);
}

#[tokio::test]
async fn gratis_contracts_track_usage_without_billing() {
    let h = harness();
    h.contracts
        .set(vec![contract("org1", "rhacs", "cpu_hours", 0.0, june(1), None, true)]);

    assert_eq!(
        billed(&h, &usage("org1", "rhacs", "Cores", 10.0, june(2))).await,
        0.0
    );
    let key = usage("org1", "rhacs", "Cores", 10.0, june(2)).remittance_key();
    let row = h.store.find_by_key(&key).await.unwrap().unwrap();
    assert_eq!(row.status, RemittanceStatus::Gratis);
    assert_eq!(row.remitted_value, 0.0);
    assert_eq!(row.gratis_value, 10.0);
    assert!(emitted(&h.bus).is_empty());

    h.contracts
        .set(vec![contract("org1", "rhacs", "cpu_hours", 0.0, june(1), None, false)]);
    assert_eq!(
        billed(&h, &usage("org1", "rhacs", "Cores", 14.0, june(3))).await,
        4.0
    );
    let row = h.store.find_by_key(&key).await.unwrap().unwrap();
    assert_eq!(row.status, RemittanceStatus::Pending);
    assert_eq!(row.remitted_value, 4.0);
    assert_eq!(row.gratis_value, 10.0);
}

#[tokio::test]
async fn new_period_starts_from_zero() {
    let h = harness();
    let may = Utc.with_ymd_and_hms(2024, 5, 31, 23, 0, 0).unwrap();
    assert_eq!(
        billed(&h, &usage("org1", "rhel-payg", "vCPUs", 40.0, may)).await,
        10.0
    );
    assert_eq!(
        billed(&h, &usage("org1", "rhel-payg", "vCPUs", 4.0, june(1))).await,
        1.0
    );
    let rows = h
        .store
        .find(&RemittanceFilter::for_org("org1"))
        .await
        .unwrap();
    assert_eq!(rows.len(), 2);
}

#[tokio::test]
async fn billing_factor_change_renormalizes_prior_remittance() {
    let bus = Arc::new(MemoryMessageBus::default());
    let store = Arc::new(MemoryRemittanceStore::new(bus.clone()));
    let contracts = Arc::new(StubContracts::default());

    let before = handlers_for(CATALOG, store.clone(), contracts.clone(), None);
    let first = usage("org1", "rhel-payg", "vCPUs", 8.0, june(3));
    assert_eq!(
        before.service.process(&first).await.unwrap().billed_units(),
        2.0
    );

    let changed = CATALOG.replace("billing_factor: 0.25", "billing_factor: 0.5");
    let after = handlers_for(&changed, store.clone(), contracts, None);
    let second = usage("org1", "rhel-payg", "vCPUs", 16.0, june(4));
    assert_eq!(
        after.service.process(&second).await.unwrap().billed_units(),
        4.0
    );

    let row = store
        .find_by_key(&second.remittance_key())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.billing_factor, 0.5);
    assert_eq!(row.remitted_value, 8.0);
}

fn summary(org: &str, current_total: f64, at: DateTime<Utc>) -> TallySummary {
    TallySummary {
        org_id: org.into(),
        tally_snapshots: vec![TallySnapshot {
            id: Uuid::new_v4(),
            product_id: "rhel-payg".into(),
            snapshot_date: at,
            sla: "Premium".into(),
            usage: "Production".into(),
            billing_provider: BillingProvider::Aws,
            billing_account_id: Some("acct-1".into()),
            vendor_product_code: None,
            granularity: Granularity::Hourly,
            tally_measurements: Some(vec![
                TallyMeasurement {
                    hardware_measurement_type: "PHYSICAL".into(),
                    metric_id: "vCPUs".into(),
                    value: current_total,
                    current_total,
                },
                TallyMeasurement {
                    hardware_measurement_type: "TOTAL".into(),
                    metric_id: "vCPUs".into(),
                    value: current_total,
                    current_total,
                },
            ]),
        }],
    }
}

async fn deliver(h: &Harness, topic: &str) -> Settlement {
    process_next(&h.handlers, h.bus.as_ref(), topic)
        .await
        .unwrap()
        .expect("a message should be due")
}

#[tokio::test]
async fn tally_summaries_flow_through_the_bus() {
    let h = harness();
    h.bus
        .publish(OutboundMessage::new(TALLY_SUMMARY_TOPIC, &summary("org1", 8.0, june(2))).unwrap())
        .await
        .unwrap();

    assert_eq!(deliver(&h, TALLY_SUMMARY_TOPIC).await, Settlement::Acked);
    let events = emitted(&h.bus);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].billed_value, 2.0);
    assert_eq!(events[0].billing_factor, 0.25);
    assert_eq!(
        h.bus.records(TALLY_SUMMARY_TOPIC)[0].status,
        MessageStatus::Acked
    );
}

#[tokio::test]
async fn workers_drain_topics_until_shutdown() {
    let h = harness();
    h.bus
        .publish(OutboundMessage::new(TALLY_SUMMARY_TOPIC, &summary("org1", 8.0, june(2))).unwrap())
        .await
        .unwrap();

    let bus: Arc<dyn MessageBus> = h.bus.clone();
    let workers = start_reconciliation_workers(
        h.handlers.clone(),
        bus,
        1,
        std::time::Duration::from_millis(10),
    );
    assert_eq!(workers.worker_count(), 4);
    for _ in 0..200 {
        if !emitted(&h.bus).is_empty() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    workers.shutdown().await.unwrap();

    assert_eq!(emitted(&h.bus).len(), 1);
    assert_eq!(
        h.bus.records(TALLY_SUMMARY_TOPIC)[0].status,
        MessageStatus::Acked
    );
}

#[tokio::test]
async fn usage_regression_is_poisoned_without_touching_the_row() {
    let h = harness();
    for total in [10.0, 4.0] {
        h.bus
            .publish(
                OutboundMessage::new(TALLY_SUMMARY_TOPIC, &summary("org1", total, june(2)))
                    .unwrap(),
            )
            .await
            .unwrap();
    }
    assert_eq!(deliver(&h, TALLY_SUMMARY_TOPIC).await, Settlement::Acked);
    assert_eq!(deliver(&h, TALLY_SUMMARY_TOPIC).await, Settlement::Poisoned);

    let rows = h
        .store
        .find(&RemittanceFilter::for_org("org1"))
        .await
        .unwrap();
    assert_eq!(rows[0].remitted_value, 2.5);
    assert_eq!(rows[0].last_current_total, 10.0);
    let poisoned = &h.bus.records(TALLY_SUMMARY_TOPIC)[1];
    assert_eq!(poisoned.status, MessageStatus::Poisoned);
    assert!(poisoned
        .last_error
        .as_deref()
        .unwrap()
        .starts_with("usage_regression"));
}

#[tokio::test]
async fn missing_contracts_and_outages_are_retried() {
    let h = harness();
    let message = json!({
        "org_id": "org1",
        "tally_snapshots": [{
            "id": Uuid::new_v4(),
            "product_id": "rosa",
            "snapshot_date": june(2),
            "sla": "Premium",
            "usage": "Production",
            "billing_provider": "aws",
            "billing_account_id": "acct-1",
            "granularity": "HOURLY",
            "tally_measurements": [{
                "hardware_measurement_type": "CLOUD",
                "metric_id": "Cores",
                "value": 4.0,
                "current_total": 4.0
            }]
        }]
    });
    h.bus
        .publish(OutboundMessage::new(TALLY_SUMMARY_TOPIC, &message).unwrap())
        .await
        .unwrap();
    assert_eq!(deliver(&h, TALLY_SUMMARY_TOPIC).await, Settlement::Retried);

    *h.contracts.failure.lock().unwrap() = Some("503 Service Unavailable".into());
    assert_eq!(deliver(&h, TALLY_SUMMARY_TOPIC).await, Settlement::Retried);
    assert!(h.store.is_empty());

    *h.contracts.failure.lock().unwrap() = None;
    h.contracts.set(vec![contract(
        "org1",
        "rosa",
        "four_vcpu_hour",
        0.0,
        june(1),
        None,
        false,
    )]);
    assert_eq!(deliver(&h, TALLY_SUMMARY_TOPIC).await, Settlement::Acked);
    assert_eq!(emitted(&h.bus)[0].billed_value, 2.0);
    assert_eq!(h.bus.records(TALLY_SUMMARY_TOPIC)[0].attempts, 3);
}

#[tokio::test]
async fn missing_provider_mapping_is_rejected() {
    let h = harness();
    let observation = usage("org1", "rosa", "Instance-hours", 3.0, june(2));
    let err = h.handlers.service.process(&observation).await.unwrap_err();
    assert!(matches!(err, BillingError::Configuration(_)));
    assert!(h.store.is_empty());
}

#[tokio::test]
async fn status_feedback_only_moves_pending_rows() {
    let h = harness();
    let observation = usage("org1", "rhel-payg", "vCPUs", 4.0, june(2));
    let pending_a = h
        .handlers
        .service
        .process(&observation)
        .await
        .unwrap()
        .row
        .unwrap();
    let mut other = observation.clone();
    other.billing_account_id = "acct-2".into();
    let pending_b = h
        .handlers
        .service
        .process(&other)
        .await
        .unwrap()
        .row
        .unwrap();

    let billed_on = june(3);
    let succeeded = BillableUsageStatus {
        remittance_ids: vec![pending_a.id, pending_b.id],
        tally_id: observation.tally_id,
        status: RemittanceStatus::Succeeded,
        error_code: None,
        billed_on: Some(billed_on),
    };
    h.bus
        .publish(OutboundMessage::new(BILLABLE_USAGE_STATUS_TOPIC, &succeeded).unwrap())
        .await
        .unwrap();
    assert_eq!(deliver(&h, BILLABLE_USAGE_STATUS_TOPIC).await, Settlement::Acked);

    let failed = BillableUsageStatus {
        remittance_ids: vec![pending_a.id],
        tally_id: observation.tally_id,
        status: RemittanceStatus::Failed,
        error_code: Some(RemittanceErrorCode::SubscriptionNotFound),
        billed_on: None,
    };
    assert_eq!(h.handlers.emitter.handle_status(&failed).await.unwrap(), 0);

    for id in [pending_a.id, pending_b.id] {
        let row = h
            .store
            .find(&RemittanceFilter::for_org("org1"))
            .await
            .unwrap()
            .into_iter()
            .find(|row| row.id == id)
            .unwrap();
        assert_eq!(row.status, RemittanceStatus::Succeeded);
        assert_eq!(row.billed_on, Some(billed_on));
        assert_eq!(row.error_code, None);
    }
}

#[tokio::test]
async fn failed_status_records_the_error_code() {
    let h = harness();
    let row = h
        .handlers
        .service
        .process(&usage("org1", "rhel-payg", "vCPUs", 4.0, june(2)))
        .await
        .unwrap()
        .row
        .unwrap();
    let failed = BillableUsageStatus {
        remittance_ids: vec![row.id],
        tally_id: row.tally_id,
        status: RemittanceStatus::Failed,
        error_code: Some(RemittanceErrorCode::MarketplaceRateLimit),
        billed_on: None,
    };
    assert_eq!(h.handlers.emitter.handle_status(&failed).await.unwrap(), 1);
    let stored = h.store.find_by_tally(row.tally_id).await.unwrap();
    assert_eq!(stored[0].status, RemittanceStatus::Failed);
    assert_eq!(
        stored[0].error_code,
        Some(RemittanceErrorCode::MarketplaceRateLimit)
    );
    assert_eq!(stored[0].billed_on, None);
}

#[tokio::test]
async fn stale_acknowledgement_does_not_mask_a_later_failure() {
    let h = harness();
    let first = usage("org1", "rhel-payg", "vCPUs", 8.0, june(3));
    let second = usage("org1", "rhel-payg", "vCPUs", 16.0, june(4));
    assert_eq!(billed(&h, &first).await, 2.0);
    assert_eq!(billed(&h, &second).await, 2.0);

    let events = emitted(&h.bus);
    assert_eq!(events[0].remittance_id, events[1].remittance_id);
    assert_eq!(events[0].tally_id, first.tally_id);
    assert_eq!(events[1].tally_id, second.tally_id);

    let stale = BillableUsageStatus {
        remittance_ids: vec![events[0].remittance_id],
        tally_id: events[0].tally_id,
        status: RemittanceStatus::Succeeded,
        error_code: None,
        billed_on: Some(june(4)),
    };
    assert_eq!(h.handlers.emitter.handle_status(&stale).await.unwrap(), 0);

    let failed = BillableUsageStatus {
        remittance_ids: vec![events[1].remittance_id],
        tally_id: events[1].tally_id,
        status: RemittanceStatus::Failed,
        error_code: Some(RemittanceErrorCode::SubscriptionNotFound),
        billed_on: None,
    };
    assert_eq!(h.handlers.emitter.handle_status(&failed).await.unwrap(), 1);

    let row = h
        .store
        .find_by_key(&second.remittance_key())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.status, RemittanceStatus::Failed);
    assert_eq!(
        row.error_code,
        Some(RemittanceErrorCode::SubscriptionNotFound)
    );
    assert_eq!(row.billed_on, None);
    assert_eq!(row.remitted_value, 4.0);
}

#[tokio::test]
async fn acknowledgement_for_a_rewritten_row_is_ignored() {
    let h = harness();
    let pending = h
        .handlers
        .service
        .process(&usage("org1", "rhel-payg", "vCPUs", 8.0, june(3)))
        .await
        .unwrap()
        .row
        .unwrap();
    let later = usage("org1", "rhel-payg", "vCPUs", 12.0, june(4));
    let rewritten = h.handlers.service.process(&later).await.unwrap().row.unwrap();
    assert_eq!(rewritten.id, pending.id);

    let stale = BillableUsageStatus {
        remittance_ids: vec![pending.id],
        tally_id: pending.tally_id,
        status: RemittanceStatus::Failed,
        error_code: Some(RemittanceErrorCode::Inactive),
        billed_on: None,
    };
    assert_eq!(h.handlers.emitter.handle_status(&stale).await.unwrap(), 0);

    let stored = h.store.find_by_tally(later.tally_id).await.unwrap();
    assert_eq!(stored[0].status, RemittanceStatus::Pending);
    assert_eq!(stored[0].error_code, None);
}

#[tokio::test]
async fn dead_letter_with_retry_after_reschedules_the_remittance() {
    let h = harness();
    let row = h
        .handlers
        .service
        .process(&usage("org1", "rhel-payg", "vCPUs", 4.0, june(2)))
        .await
        .unwrap()
        .row
        .unwrap();
    h.handlers
        .emitter
        .handle_status(&BillableUsageStatus {
            remittance_ids: vec![row.id],
            tally_id: row.tally_id,
            status: RemittanceStatus::Failed,
            error_code: Some(RemittanceErrorCode::UsageContextLookup),
            billed_on: None,
        })
        .await
        .unwrap();

    let event = emitted(&h.bus).remove(0);
    let retry_after = Utc::now() - Duration::minutes(5);
    h.bus
        .publish(
            OutboundMessage::new(BILLABLE_USAGE_DEAD_LETTER_TOPIC, &event)
                .unwrap()
                .with_header(RETRY_AFTER_HEADER, retry_after.to_rfc3339()),
        )
        .await
        .unwrap();
    assert_eq!(
        deliver(&h, BILLABLE_USAGE_DEAD_LETTER_TOPIC).await,
        Settlement::Acked
    );

    let stored = h.store.find_by_tally(row.tally_id).await.unwrap();
    assert_eq!(stored[0].status, RemittanceStatus::Pending);
    assert_eq!(stored[0].error_code, None);
    assert_eq!(stored[0].billed_on, None);
    assert_eq!(
        stored[0].retry_after.map(|at| at.timestamp()),
        Some(retry_after.timestamp())
    );
    assert_eq!(stored[0].remitted_value, row.remitted_value);

    let outbound = h.bus.records(BILLABLE_USAGE_OUT_TOPIC);
    assert_eq!(outbound.len(), 2);
    assert_eq!(
        outbound[1].available_at.timestamp(),
        retry_after.timestamp()
    );
}

#[tokio::test]
async fn dead_letter_without_retry_after_is_poisoned() {
    let h = harness();
    let row = h
        .handlers
        .service
        .process(&usage("org1", "rhel-payg", "vCPUs", 4.0, june(2)))
        .await
        .unwrap()
        .row
        .unwrap();
    let event = emitted(&h.bus).remove(0);
    h.bus
        .publish(OutboundMessage::new(BILLABLE_USAGE_DEAD_LETTER_TOPIC, &event).unwrap())
        .await
        .unwrap();

    assert_eq!(
        deliver(&h, BILLABLE_USAGE_DEAD_LETTER_TOPIC).await,
        Settlement::Poisoned
    );
    let stored = h.store.find_by_tally(row.tally_id).await.unwrap();
    assert_eq!(stored[0], row);
    assert_eq!(h.bus.records(BILLABLE_USAGE_OUT_TOPIC).len(), 1);
}

#[tokio::test]
async fn retention_purges_old_rows_only_when_configured() {
    let disabled = harness();
    let row = disabled
        .handlers
        .service
        .process(&usage("org1", "rhel-payg", "vCPUs", 4.0, june(2)))
        .await
        .unwrap()
        .row
        .unwrap();
    let mut stale = row.clone();
    stale.remittance_pending_date = Utc::now() - Duration::days(400);
    disabled.store.insert(stale.clone());
    assert_eq!(disabled.handlers.purger.purge("org1").await.unwrap(), None);
    assert_eq!(disabled.store.len(), 1);

    let enabled = harness_with(CATALOG, Some(Duration::days(70)));
    enabled.store.insert(stale);
    let mut fresh = row;
    fresh.id = Uuid::new_v4();
    fresh.key.billing_account_id = "acct-2".into();
    enabled.store.insert(fresh.clone());

    enabled
        .bus
        .publish(OutboundMessage::new(ENABLED_ORGS_TOPIC, &json!({"org_id": "org1"})).unwrap())
        .await
        .unwrap();
    assert_eq!(deliver(&enabled, ENABLED_ORGS_TOPIC).await, Settlement::Acked);

    let remaining = enabled
        .store
        .find(&RemittanceFilter::for_org("org1"))
        .await
        .unwrap();
    assert_eq!(remaining, vec![fresh]);
}
