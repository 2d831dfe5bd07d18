use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use tokio::sync::watch;
use tracing::{debug, info};

use credits::bus::{InProcessBus, LogPublisher, Publisher, Router, RouterOptions};
use credits::config;
use credits::credit::{CreditConnector, CreditConnectorOptions, OwnerConnector};
use credits::entitlement::{EntitlementOwner, EntitlementValueResolver};
use credits::store::PgStore;
use credits::telemetry;
use credits::worker::{
    recalculate, BalanceWorker, Recalculator, RecalculatorOptions, SnapshotBuilder, WorkerOptions,
};

#[tokio::main]
async fn main() -> Result<()> {
    telemetry::init_tracing();
    dotenvy::dotenv().ok();

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(config::DATABASE_URL.as_str())
        .await
        .context("failed to connect to Postgres")?;
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("failed to run migrations")?;

    let store = Arc::new(PgStore::new(pool));
    let worker_options = WorkerOptions::from_env();
    let (bus, messages) = InProcessBus::channel(worker_options.max_batch_size * 4);
    let publisher: Arc<dyn Publisher> = Arc::new(bus);

    // Snapshots leave the process here; without an external broker they are only logged.
    let (downstream_bus, mut downstream) = InProcessBus::channel(worker_options.max_batch_size * 4);
    let downstream_bus: Arc<dyn Publisher> = Arc::new(downstream_bus);
    tokio::spawn(async move {
        while let Some(envelope) = downstream.recv().await {
            debug!(id = %envelope.id, name = %envelope.name, subject = %envelope.subject, "snapshot emitted");
        }
    });

    let owners: Arc<dyn OwnerConnector> = Arc::new(EntitlementOwner::new(
        store.clone(),
        store.clone(),
        store.clone(),
    ));
    let credit = Arc::new(CreditConnector::new(
        store.clone(),
        store.clone(),
        owners.clone(),
        publisher.clone(),
        CreditConnectorOptions::from_env(),
    ));
    let snapshots = SnapshotBuilder::new(Arc::new(EntitlementValueResolver::new(credit, owners)));

    let worker = Arc::new(BalanceWorker::new(
        store.clone(),
        store.clone(),
        store.clone(),
        snapshots.clone(),
        downstream_bus.clone(),
        worker_options,
    ));
    let mut router = Router::new(
        publisher.clone(),
        Arc::new(LogPublisher),
        RouterOptions::from_env(),
    );
    worker.register(&mut router);

    let recalculator = Arc::new(Recalculator::new(
        store.clone(),
        store.clone(),
        store,
        snapshots,
        downstream_bus,
        RecalculatorOptions::from_env(),
    ));
    let namespaces = config::RECALCULATOR_NAMESPACES.clone();
    let sweep = (!namespaces.is_empty()).then(|| {
        recalculate::spawn(
            recalculator,
            namespaces,
            Duration::from_secs(*config::RECALCULATOR_INTERVAL_SECS),
        )
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let router = tokio::spawn(Arc::new(router).run(messages, shutdown_rx));

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown requested");
    shutdown_tx.send(true).ok();
    if let Some(sweep) = sweep {
        sweep.abort();
    }
    router.await.context("router task panicked")?;
    Ok(())
}
