use sentra::application::scheduler::ReconciliationScheduler;
use sentra::config::ReconcilerConfig;
use sentra::domain::services::alerts::TracingAlertSink;
use sentra::domain::services::equity_guard::EquityGuard;
use sentra::domain::services::matcher::PositionMatcher;
use sentra::domain::services::position_closer::PositionCloser;
use sentra::domain::services::reconciliation::ReconciliationEngine;
use sentra::infrastructure::sim_gateway::SimBrokerGateway;
use sentra::persistence::{init_database, repository::SqliteStore};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sentra=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = ReconcilerConfig::from_env();
    info!(
        interval = config.sync_interval_seconds,
        max_concurrent = config.max_concurrent_syncs,
        drawdown = config.max_drawdown_percent,
        floor = config.min_equity_floor,
        "starting reconciliation service"
    );

    // Threshold validation fails here, before anything is scheduled.
    let guard_config = config.guard_config()?;
    let scheduler_config = config.scheduler_config()?;

    let pool = init_database(&config.database_url).await?;
    let store: Arc<SqliteStore> = Arc::new(SqliteStore::new(pool));

    // Local runs reconcile against the in-process simulated broker; a real
    // deployment swaps in a bridge implementing BrokerGateway.
    let gateway = Arc::new(SimBrokerGateway::new());
    let alerts = Arc::new(TracingAlertSink);

    let closer = Arc::new(PositionCloser::new(
        gateway.clone(),
        store.clone(),
        alerts.clone(),
    ));
    let guard = EquityGuard::new(guard_config, closer, gateway.clone(), alerts.clone());
    let engine = ReconciliationEngine::new(
        gateway,
        store.clone(),
        PositionMatcher::new(config.matcher_config()),
    );

    let scheduler =
        ReconciliationScheduler::new(engine, guard, store, alerts, scheduler_config)?;
    scheduler.start().await;

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received, draining");
    scheduler.stop().await;

    let status = scheduler.status();
    info!(
        cycles = status.cycle_count,
        errors = status.error_count,
        "reconciliation service stopped"
    );
    Ok(())
}
