pub mod api;
pub mod catalog;
pub mod contracts;
pub mod dead_letter;
pub mod emitter;
pub mod ledger;
pub mod mapper;
pub mod models;
pub mod reconciliation;
pub mod retention;
pub mod service;
pub mod store;
pub mod units;

pub use api::{admin_routes, AdminState};
pub use catalog::{Granularity, ProductCatalog};
pub use contracts::{
    ContractClientConfig, ContractCoverageResolver, ContractQuery, ContractsApi,
    HttpContractsClient,
};
pub use dead_letter::{DeadLetterConsumer, DeadLetterOutcome};
pub use emitter::{BillableUsageEvent, BillableUsageStatus, BillingEmitter};
pub use ledger::{LedgerOutcome, RemittanceCalculation, RemittanceInput, RemittanceLedger};
pub use mapper::{TallyMeasurement, TallySnapshot, TallySummary, UsageMapper};
pub use models::{
    AccumulationPeriod, BillableUsage, BillingProvider, Contract, ContractCoverage,
    ContractMetric, RemittanceErrorCode, RemittanceKey, RemittanceRow, RemittanceStatus,
};
pub use reconciliation::{
    process_next, settle, start_reconciliation_workers, ReconciliationHandle,
    ReconciliationHandlers, Settlement,
};
pub use retention::{EnabledOrg, RetentionPurger};
pub use service::BillableUsageService;
pub use store::{
    LedgerDecision, MemoryRemittanceStore, RemittanceFilter, RemittanceStore, ResetRequest,
    StatusUpdate,
};
pub use units::{Quantity, Unit};
