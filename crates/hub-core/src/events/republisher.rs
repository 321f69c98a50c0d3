//! Background task that retries the bus-publish half of events whose DB
//! commit succeeded but whose JetStream publish did not.

use std::time::Duration;

use sqlx::PgPool;

use hub_db::queries::events;

use super::service::EventService;

const BATCH_SIZE: i64 = 100;
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Run the re-publisher loop until the process is shut down. Scans for
/// unpublished events on a fixed interval with exponential backoff applied
/// only when a scan finds nothing to do, so a burst of failures drains
/// quickly while an idle steady state doesn't poll Postgres needlessly.
pub async fn run(pool: PgPool, service: EventService) -> ! {
    let mut idle_backoff = Duration::from_millis(500);

    loop {
        match sweep(&pool, &service).await {
            Ok(0) => {
                tokio::time::sleep(idle_backoff).await;
                idle_backoff = (idle_backoff * 2).min(MAX_BACKOFF);
            }
            Ok(n) => {
                tracing::info!(count = n, "republished events");
                idle_backoff = Duration::from_millis(500);
            }
            Err(e) => {
                tracing::error!(error = %e, "event republish sweep failed");
                tokio::time::sleep(idle_backoff).await;
                idle_backoff = (idle_backoff * 2).min(MAX_BACKOFF);
            }
        }
    }
}

/// One sweep: fetch unpublished events and retry the bus publish for each.
/// Returns the number successfully republished.
async fn sweep(pool: &PgPool, service: &EventService) -> anyhow::Result<usize> {
    let pending = events::list_unpublished(pool, BATCH_SIZE).await?;
    let mut republished = 0;

    for event in &pending {
        match service.publish_to_bus(event).await {
            Ok(()) => {
                events::mark_published(pool, event.id).await?;
                republished += 1;
            }
            Err(e) => {
                tracing::warn!(event_id = %event.id, error = %e, "republish attempt failed, will retry next sweep");
            }
        }
    }

    Ok(republished)
}
