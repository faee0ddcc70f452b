use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{routing::get, Extension, Router};
use axum_prometheus::PrometheusMetricLayer;
use sqlx::postgres::PgPoolOptions;

use billable_usage::billing::{
    admin_routes, start_reconciliation_workers, AdminState, BillableUsageService, BillingEmitter,
    ContractCoverageResolver, DeadLetterConsumer, HttpContractsClient, ProductCatalog,
    ReconciliationHandlers, RemittanceLedger, RemittanceStore, RetentionPurger,
};
use billable_usage::db::PgRemittanceStore;
use billable_usage::messaging::{MessageBus, PgMessageBus};
use billable_usage::{config, engine_config_from_env, telemetry};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    telemetry::init_tracing();

    let engine = engine_config_from_env();
    let catalog = Arc::new(
        ProductCatalog::load(&engine.catalog_path).context("failed to load product catalog")?,
    );

    let pool = PgPoolOptions::new()
        .max_connections(*config::DATABASE_MAX_CONNECTIONS)
        .connect(config::DATABASE_URL.as_str())
        .await
        .context("failed to connect to database")?;

    if let Err(error) = sqlx::migrate!("./migrations").run(&pool).await {
        if *config::ALLOW_MIGRATION_FAILURE {
            tracing::warn!(
                ?error,
                "Database migrations failed but continuing due to ALLOW_MIGRATION_FAILURE"
            );
        } else {
            return Err(error).context("failed to run database migrations");
        }
    }

    let store: Arc<dyn RemittanceStore> = Arc::new(PgRemittanceStore::new(
        pool.clone(),
        engine.max_transaction_attempts,
    ));
    let bus: Arc<dyn MessageBus> = Arc::new(PgMessageBus::new(pool.clone(), engine.bus.clone()));
    let contracts = Arc::new(
        HttpContractsClient::new(engine.contracts.clone())
            .context("failed to build contracts client")?,
    );

    let handlers = ReconciliationHandlers {
        service: BillableUsageService::new(
            catalog.clone(),
            ContractCoverageResolver::new(contracts, catalog.clone()),
            RemittanceLedger::new(store.clone()),
            engine.contract_grace,
        ),
        emitter: BillingEmitter::new(store.clone()),
        dead_letter: DeadLetterConsumer::new(store.clone()),
        purger: RetentionPurger::new(store.clone(), engine.retention),
    };
    let workers = start_reconciliation_workers(
        handlers,
        bus.clone(),
        engine.consumer_concurrency,
        engine.poll_interval,
    );

    let admin = AdminState {
        store,
        bus,
        retention_enabled: engine.retention.is_some(),
        stuck_pending_after: engine.stuck_pending_after,
    };
    let (prometheus_layer, metrics_handle) = PrometheusMetricLayer::pair();
    let app = Router::new()
        .route(
            "/metrics",
            get(move || async move {
                format!(
                    "{}{}",
                    metrics_handle.render(),
                    telemetry::USAGE_COUNTERS.render()
                )
            }),
        )
        .merge(admin_routes())
        .layer(prometheus_layer)
        .layer(Extension(admin));

    let addr: SocketAddr = format!("{}:{}", config::BIND_ADDRESS.as_str(), *config::BIND_PORT)
        .parse()
        .context("invalid bind address")?;
    tracing::info!(%addr, "Listening for incoming connections");
    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .with_graceful_shutdown(async {
            if let Err(error) = tokio::signal::ctrl_c().await {
                tracing::error!(?error, "failed to listen for shutdown signal");
            }
        })
        .await
        .context("admin server failed")?;

    workers.shutdown().await?;
    Ok(())
}
