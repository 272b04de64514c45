//! Frontdesk background worker
//!
//! Scheduled jobs:
//! - Waiver reconciliation against the signature provider (every 30 minutes)
//! - Processed-event retention cleanup (daily at 3:00 AM UTC)
//! - Health check heartbeat (every 5 minutes)

use std::sync::Arc;
use std::time::Duration;

use frontdesk_core::CoreServices;
use frontdesk_shared::create_pool;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

/// How long processed webhook event ids are retained for dedup.
const EVENT_RETENTION_DAYS: i32 = 90;

/// How many pending waivers one reconciliation sweep checks.
const RECONCILE_BATCH: i64 = 100;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    dotenvy::dotenv().ok();

    info!("Starting Frontdesk Worker");

    let database_url = std::env::var("DATABASE_URL")
        .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;
    let pool = create_pool(&database_url).await?;
    info!("Database pool created");

    let core = Arc::new(CoreServices::from_env(pool)?);

    let scheduler = JobScheduler::new().await?;

    // Job 1: Waiver reconciliation (every 30 minutes)
    // Catches documents signed since the last sweep; the provider has no
    // webhook in this integration, so polling is the source of signed-state.
    let waiver_core = core.clone();
    scheduler
        .add(Job::new_async("0 */30 * * * *", move |_uuid, _l| {
            let core = waiver_core.clone();
            Box::pin(async move {
                info!("Running waiver reconciliation sweep");
                match core.waivers.reconcile_pending(RECONCILE_BATCH).await {
                    Ok(summary) => {
                        info!(
                            checked = summary.checked,
                            newly_signed = summary.newly_signed,
                            errors = summary.errors.len(),
                            "Waiver reconciliation complete"
                        );
                        for failure in &summary.errors {
                            warn!(
                                waiver_id = %failure.waiver_id,
                                error = %failure.error,
                                "Waiver check failed"
                            );
                        }
                    }
                    Err(e) => error!(error = %e, "Waiver reconciliation sweep failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Waiver reconciliation (every 30 minutes)");

    // Job 2: Processed-event cleanup (daily at 3:00 AM UTC)
    // Providers stop redelivering long before the retention window ends.
    let cleanup_core = core.clone();
    scheduler
        .add(Job::new_async("0 0 3 * * *", move |_uuid, _l| {
            let core = cleanup_core.clone();
            Box::pin(async move {
                info!("Running processed-event cleanup");
                match core.intake.purge_older_than_days(EVENT_RETENTION_DAYS).await {
                    Ok(deleted) => info!(deleted = deleted, "Processed-event cleanup complete"),
                    Err(e) => error!(error = %e, "Processed-event cleanup failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Processed-event cleanup (daily at 3:00 AM UTC)");

    // Job 3: Health check heartbeat (every 5 minutes)
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat - all systems operational");
            })
        })?)
        .await?;
    info!("Scheduled: Health check heartbeat (every 5 minutes)");

    info!("Starting job scheduler");
    scheduler.start().await?;

    info!("Frontdesk Worker started successfully with 3 scheduled jobs");

    // Keep the main task running; the scheduler runs jobs in background tasks.
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
