//! Database query functions for the `events` table.
//!
//! `events` is the Event Service's store half of its persist-then-publish
//! pipeline: [`insert_event`] is the durable commit a publish must complete
//! before the bus publish is attempted; [`query_events`] serves historical
//! replay; [`list_unpublished`] feeds the background re-publisher.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::Event;

/// Insert a new append-only event row.
pub async fn insert_event(
    pool: &PgPool,
    subject: &str,
    origin: &str,
    correlation_id: Option<Uuid>,
    payload: &Value,
) -> Result<Event> {
    let event = sqlx::query_as::<_, Event>(
        "INSERT INTO events (subject, origin, correlation_id, payload) \
         VALUES ($1, $2, $3, $4) \
         RETURNING *",
    )
    .bind(subject)
    .bind(origin)
    .bind(correlation_id)
    .bind(payload)
    .fetch_one(pool)
    .await
    .with_context(|| format!("failed to insert event on subject {subject}"))?;

    Ok(event)
}

/// Fetch a single event by ID. Used by the `Publish` -> `Query(same id)`
/// durability property.
pub async fn get_event(pool: &PgPool, id: Uuid) -> Result<Option<Event>> {
    let event = sqlx::query_as::<_, Event>("SELECT * FROM events WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch event")?;

    Ok(event)
}

/// Mark an event as published (the bus accepted and acked it).
pub async fn mark_published(pool: &PgPool, id: Uuid) -> Result<()> {
    sqlx::query("UPDATE events SET published_at = now() WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await
        .context("failed to mark event published")?;

    Ok(())
}

/// Events committed but never acknowledged as published, oldest first.
/// Source of work for the background re-publisher.
pub async fn list_unpublished(pool: &PgPool, limit: i64) -> Result<Vec<Event>> {
    let events = sqlx::query_as::<_, Event>(
        "SELECT * FROM events \
         WHERE published_at IS NULL \
         ORDER BY timestamp ASC \
         LIMIT $1",
    )
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("failed to list unpublished events")?;

    Ok(events)
}

/// A query filter over the events table. `subject_pattern` is matched with
/// SQL `LIKE` after the caller translates dotted-token wildcards
/// (`*`/`>`) to `LIKE` wildcards; `None` matches every subject.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub subject_like: Option<String>,
    pub correlation_id: Option<Uuid>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    /// Keyset cursor: only events strictly after this (timestamp, id) pair.
    pub after: Option<(DateTime<Utc>, Uuid)>,
    pub limit: i64,
}

/// Query events ordered by timestamp ascending, paginated by keyset on
/// `(timestamp, id)`.
pub async fn query_events(pool: &PgPool, filter: &EventFilter) -> Result<Vec<Event>> {
    let (after_ts, after_id) = filter
        .after
        .map(|(ts, id)| (Some(ts), Some(id)))
        .unwrap_or((None, None));

    let events = sqlx::query_as::<_, Event>(
        "SELECT * FROM events \
         WHERE ($1::text IS NULL OR subject LIKE $1) \
           AND ($2::uuid IS NULL OR correlation_id = $2) \
           AND ($3::timestamptz IS NULL OR timestamp >= $3) \
           AND ($4::timestamptz IS NULL OR timestamp <= $4) \
           AND ($5::timestamptz IS NULL OR (timestamp, id) > ($5, $6)) \
         ORDER BY timestamp ASC, id ASC \
         LIMIT $7",
    )
    .bind(&filter.subject_like)
    .bind(filter.correlation_id)
    .bind(filter.since)
    .bind(filter.until)
    .bind(after_ts)
    .bind(after_id)
    .bind(filter.limit)
    .fetch_all(pool)
    .await
    .context("failed to query events")?;

    Ok(events)
}
