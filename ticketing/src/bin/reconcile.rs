//! Ticketing Reconciliation
//!
//! Maintenance job that rebuilds every event's sold counters from the line
//! items of active reservations and confirms reservations whose payment
//! already succeeded. Run it while bookings are paused.
//!
//! # Usage
//!
//! ```bash
//! DATABASE_URL=postgres://... cargo run --bin ticketing-reconcile
//! ```

use std::sync::Arc;
use ticketing::{Config, PostgresTicketingRepository, Reconciler, locks::ReservationLocks};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ticketing=info,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();
    tracing::info!(
        max_connections = config.postgres.max_connections,
        "Connecting to PostgreSQL"
    );

    let repository = PostgresTicketingRepository::connect(&config.postgres).await?;
    repository.migrate().await?;
    tracing::info!("Migrations applied");

    let reconciler = Reconciler::new(Arc::new(repository), ReservationLocks::new());
    let reports = reconciler.reconcile_all().await?;

    for report in reports.iter().filter(|report| report.changed()) {
        tracing::warn!(
            event_id = %report.event_id,
            sold_before = ?report.sold_before,
            sold_after = ?report.sold_after,
            confirmed = report.confirmed.len(),
            failed_payments = report.failed_payments.len(),
            overcommitted = ?report.overcommitted,
            "Event corrected"
        );
    }
    tracing::info!(
        events = reports.len(),
        corrected = reports.iter().filter(|report| report.changed()).count(),
        "Reconciliation complete"
    );
    Ok(())
}
