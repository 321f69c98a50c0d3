//! Database query functions for the `projects` table.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{Project, ProjectStatus};

/// Insert a new project row in `stopped` status. `designated_ports`, when
/// given, are persisted separately from the bound-port columns (which stay
/// NULL until `Start`) so they survive stop/start cycles and `Start` can
/// reserve exactly the ports the caller asked for.
pub async fn insert_project(
    pool: &PgPool,
    slug: &str,
    name: &str,
    fs_path: &str,
    designated_ports: Option<(i32, i32, i32, i32)>,
) -> Result<Project> {
    let (backend, frontend, db, cache) = match designated_ports {
        Some((b, f, d, c)) => (Some(b), Some(f), Some(d), Some(c)),
        None => (None, None, None, None),
    };

    let project = sqlx::query_as::<_, Project>(
        "INSERT INTO projects \
             (slug, name, fs_path, designated_backend_port, designated_frontend_port, \
              designated_db_port, designated_cache_port) \
         VALUES ($1, $2, $3, $4, $5, $6, $7) \
         RETURNING *",
    )
    .bind(slug)
    .bind(name)
    .bind(fs_path)
    .bind(backend)
    .bind(frontend)
    .bind(db)
    .bind(cache)
    .fetch_one(pool)
    .await
    .with_context(|| format!("failed to insert project {slug}"))?;

    Ok(project)
}

/// Fetch a project by its ID.
pub async fn get_project(pool: &PgPool, id: Uuid) -> Result<Option<Project>> {
    let project = sqlx::query_as::<_, Project>("SELECT * FROM projects WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch project")?;

    Ok(project)
}

/// Fetch a project by its slug.
pub async fn get_project_by_slug(pool: &PgPool, slug: &str) -> Result<Option<Project>> {
    let project = sqlx::query_as::<_, Project>("SELECT * FROM projects WHERE slug = $1")
        .bind(slug)
        .fetch_optional(pool)
        .await
        .context("failed to fetch project by slug")?;

    Ok(project)
}

/// List all projects, ordered by creation time (newest first).
pub async fn list_projects(pool: &PgPool) -> Result<Vec<Project>> {
    let projects = sqlx::query_as::<_, Project>("SELECT * FROM projects ORDER BY created_at DESC")
        .fetch_all(pool)
        .await
        .context("failed to list projects")?;

    Ok(projects)
}

/// Check whether any non-stopped project currently holds any of the four
/// given ports. Used by the orchestrator to classify `PORTS_IN_USE` before
/// attempting a reservation.
pub async fn ports_in_use(
    pool: &PgPool,
    backend_port: i32,
    frontend_port: i32,
    db_port: i32,
    cache_port: i32,
    excluding_project_id: Option<Uuid>,
) -> Result<bool> {
    let row: (bool,) = sqlx::query_as(
        "SELECT EXISTS ( \
             SELECT 1 FROM projects \
             WHERE status <> 'stopped' \
               AND ($5::uuid IS NULL OR id <> $5) \
               AND (backend_port = $1 OR frontend_port = $2 \
                    OR db_port = $3 OR cache_port = $4) \
         )",
    )
    .bind(backend_port)
    .bind(frontend_port)
    .bind(db_port)
    .bind(cache_port)
    .bind(excluding_project_id)
    .fetch_one(pool)
    .await
    .context("failed to check port reservations")?;

    Ok(row.0)
}

/// Atomically transition a project from one status to another, optionally
/// reserving ports (on the STARTING transition) or clearing them (on the
/// STOPPED/ERROR transition).
///
/// Uses optimistic locking: the UPDATE's WHERE clause includes
/// `status = $from`, so the row is only updated if the current status
/// matches the expected `from` value.
#[allow(clippy::too_many_arguments)]
pub async fn transition_project_status(
    pool: &PgPool,
    project_id: Uuid,
    from: ProjectStatus,
    to: ProjectStatus,
    ports: Option<(i32, i32, i32, i32)>,
    clear_ports: bool,
    driver_handle: Option<&str>,
    last_error: Option<&str>,
) -> Result<u64> {
    let (backend_port, frontend_port, db_port, cache_port) = match ports {
        Some((b, f, d, c)) => (Some(b), Some(f), Some(d), Some(c)),
        None => (None, None, None, None),
    };

    let result = sqlx::query(
        "UPDATE projects \
         SET status = $1, \
             backend_port = CASE WHEN $8 THEN NULL ELSE COALESCE($2, backend_port) END, \
             frontend_port = CASE WHEN $8 THEN NULL ELSE COALESCE($3, frontend_port) END, \
             db_port = CASE WHEN $8 THEN NULL ELSE COALESCE($4, db_port) END, \
             cache_port = CASE WHEN $8 THEN NULL ELSE COALESCE($5, cache_port) END, \
             driver_handle = CASE WHEN $8 THEN NULL ELSE COALESCE($6, driver_handle) END, \
             last_error = $7, \
             updated_at = now() \
         WHERE id = $9 AND status = $10",
    )
    .bind(to)
    .bind(backend_port)
    .bind(frontend_port)
    .bind(db_port)
    .bind(cache_port)
    .bind(driver_handle)
    .bind(last_error)
    .bind(clear_ports)
    .bind(project_id)
    .bind(from)
    .execute(pool)
    .await
    .context("failed to transition project status")?;

    Ok(result.rows_affected())
}

/// Delete a project. Only permitted while it is STOPPED; enforced by the
/// WHERE clause rather than the caller.
pub async fn delete_stopped_project(pool: &PgPool, project_id: Uuid) -> Result<u64> {
    let result = sqlx::query("DELETE FROM projects WHERE id = $1 AND status = 'stopped'")
        .bind(project_id)
        .execute(pool)
        .await
        .context("failed to delete project")?;

    Ok(result.rows_affected())
}
