//! Database query functions for the `federation_projects` table.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::models::{FederationProject, FederationStatus};

/// Register or update a federation catalog row. Upserts on `slug`.
pub async fn upsert_federation_project(
    pool: &PgPool,
    slug: &str,
    name: &str,
    hub_url: &str,
    mesh_namespace: &str,
    tags: &[String],
) -> Result<FederationProject> {
    let row = sqlx::query_as::<_, FederationProject>(
        "INSERT INTO federation_projects (slug, name, hub_url, mesh_namespace, tags) \
         VALUES ($1, $2, $3, $4, $5) \
         ON CONFLICT (slug) DO UPDATE \
             SET name = EXCLUDED.name, \
                 hub_url = EXCLUDED.hub_url, \
                 mesh_namespace = EXCLUDED.mesh_namespace, \
                 tags = EXCLUDED.tags \
         RETURNING *",
    )
    .bind(slug)
    .bind(name)
    .bind(hub_url)
    .bind(mesh_namespace)
    .bind(tags)
    .fetch_one(pool)
    .await
    .with_context(|| format!("failed to upsert federation project {slug}"))?;

    Ok(row)
}

/// Fetch a federation project by slug.
pub async fn get_federation_project(
    pool: &PgPool,
    slug: &str,
) -> Result<Option<FederationProject>> {
    let row = sqlx::query_as::<_, FederationProject>(
        "SELECT * FROM federation_projects WHERE slug = $1",
    )
    .bind(slug)
    .fetch_optional(pool)
    .await
    .context("failed to fetch federation project")?;

    Ok(row)
}

/// List federation projects, optionally filtered by status.
pub async fn list_federation_projects(
    pool: &PgPool,
    status: Option<FederationStatus>,
) -> Result<Vec<FederationProject>> {
    let rows = sqlx::query_as::<_, FederationProject>(
        "SELECT * FROM federation_projects \
         WHERE $1::text IS NULL OR status = $1 \
         ORDER BY slug ASC",
    )
    .bind(status)
    .fetch_all(pool)
    .await
    .context("failed to list federation projects")?;

    Ok(rows)
}

/// Ingest a heartbeat for a known slug whose namespace matches the
/// registered value. Order-tolerant: only applies the update when
/// `heartbeat_at` is strictly newer than the row's current
/// `last_heartbeat_at`. Returns `Ok(None)` if the slug is unknown, and
/// `Ok(Some(false))` if the namespace does not match (caller maps this to
/// `NAMESPACE_MISMATCH` without touching the row).
pub async fn ingest_heartbeat(
    pool: &PgPool,
    slug: &str,
    mesh_namespace: &str,
    heartbeat_at: DateTime<Utc>,
) -> Result<Option<bool>> {
    let Some(existing) = get_federation_project(pool, slug).await? else {
        return Ok(None);
    };

    if existing.mesh_namespace != mesh_namespace {
        return Ok(Some(false));
    }

    sqlx::query(
        "UPDATE federation_projects \
         SET last_heartbeat_at = $1, status = 'online' \
         WHERE slug = $2 \
           AND (last_heartbeat_at IS NULL OR last_heartbeat_at < $1)",
    )
    .bind(heartbeat_at)
    .bind(slug)
    .execute(pool)
    .await
    .with_context(|| format!("failed to ingest heartbeat for {slug}"))?;

    Ok(Some(true))
}

/// Mark every federation project whose `last_heartbeat_at` is older than
/// `threshold` as OFFLINE. Returns the slugs that were transitioned, so the
/// sweeper can emit `federation.<slug>.offline` for each.
pub async fn mark_stale_offline(pool: &PgPool, threshold: DateTime<Utc>) -> Result<Vec<String>> {
    let rows: Vec<(String,)> = sqlx::query_as(
        "UPDATE federation_projects \
         SET status = 'offline' \
         WHERE status <> 'offline' \
           AND (last_heartbeat_at IS NULL OR last_heartbeat_at < $1) \
         RETURNING slug",
    )
    .bind(threshold)
    .fetch_all(pool)
    .await
    .context("failed to mark stale federation projects offline")?;

    Ok(rows.into_iter().map(|(slug,)| slug).collect())
}
