//! Database query functions for the `idempotency_keys` table.
//!
//! Every write endpoint accepts an optional idempotency key (spec.md §6,
//! "Every write accepts an optional idempotency key"). The first request
//! for a given key commits its response here; a repeat with the same key
//! and the same request body short-circuits to the stored response
//! instead of re-executing the write.

use anyhow::{Context, Result};
use serde_json::Value;
use sqlx::PgPool;

use crate::models::IdempotencyRecord;

/// Fetch a previously recorded response for an idempotency key, if any.
pub async fn get_record(pool: &PgPool, key: &str) -> Result<Option<IdempotencyRecord>> {
    let record = sqlx::query_as::<_, IdempotencyRecord>(
        "SELECT * FROM idempotency_keys WHERE idempotency_key = $1",
    )
    .bind(key)
    .fetch_optional(pool)
    .await
    .context("failed to fetch idempotency record")?;

    Ok(record)
}

/// Record the response for a key after the underlying write succeeds.
/// `ON CONFLICT DO NOTHING` since a concurrent request for the same key
/// may have already recorded one; the first writer wins.
pub async fn insert_record(
    pool: &PgPool,
    key: &str,
    request_hash: &str,
    response_body: &Value,
    response_status: i32,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO idempotency_keys (idempotency_key, request_hash, response_body, response_status) \
         VALUES ($1, $2, $3, $4) \
         ON CONFLICT (idempotency_key) DO NOTHING",
    )
    .bind(key)
    .bind(request_hash)
    .bind(response_body)
    .bind(response_status)
    .execute(pool)
    .await
    .context("failed to insert idempotency record")?;

    Ok(())
}
