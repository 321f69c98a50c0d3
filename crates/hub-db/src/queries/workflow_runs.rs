//! Database query functions for the `workflow_runs` table.

use anyhow::{Context, Result};
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{WorkflowRun, WorkflowRunStatus};

/// Insert a new workflow run in `pending` status with a fresh correlation id.
pub async fn insert_workflow_run(
    pool: &PgPool,
    workflow_id: Uuid,
    trigger_context: &Value,
    correlation_id: Option<Uuid>,
) -> Result<WorkflowRun> {
    let correlation_id = correlation_id.unwrap_or_else(Uuid::new_v4);

    let run = sqlx::query_as::<_, WorkflowRun>(
        "INSERT INTO workflow_runs (workflow_id, trigger_context, correlation_id) \
         VALUES ($1, $2, $3) \
         RETURNING *",
    )
    .bind(workflow_id)
    .bind(trigger_context)
    .bind(correlation_id)
    .fetch_one(pool)
    .await
    .with_context(|| format!("failed to insert workflow run for workflow {workflow_id}"))?;

    Ok(run)
}

/// Fetch a workflow run by ID.
pub async fn get_workflow_run(pool: &PgPool, id: Uuid) -> Result<Option<WorkflowRun>> {
    let run = sqlx::query_as::<_, WorkflowRun>("SELECT * FROM workflow_runs WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch workflow run")?;

    Ok(run)
}

/// List runs for a workflow, newest first.
pub async fn list_runs_for_workflow(pool: &PgPool, workflow_id: Uuid) -> Result<Vec<WorkflowRun>> {
    let runs = sqlx::query_as::<_, WorkflowRun>(
        "SELECT * FROM workflow_runs WHERE workflow_id = $1 ORDER BY started_at DESC",
    )
    .bind(workflow_id)
    .fetch_all(pool)
    .await
    .context("failed to list workflow runs")?;

    Ok(runs)
}

/// Atomically transition a run's status. Terminal states set `finished_at`.
/// Uses optimistic locking on `status = $from`.
pub async fn transition_run_status(
    pool: &PgPool,
    run_id: Uuid,
    from: WorkflowRunStatus,
    to: WorkflowRunStatus,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE workflow_runs \
         SET status = $1, \
             finished_at = CASE WHEN $2 THEN now() ELSE finished_at END \
         WHERE id = $3 AND status = $4",
    )
    .bind(to)
    .bind(to.is_terminal())
    .bind(run_id)
    .bind(from)
    .execute(pool)
    .await
    .context("failed to transition workflow run status")?;

    Ok(result.rows_affected())
}

/// List all runs currently in a non-terminal status, across all workflows.
/// Used at orchestrator startup to find runs that need restart recovery.
pub async fn list_in_flight_runs(pool: &PgPool) -> Result<Vec<WorkflowRun>> {
    let runs = sqlx::query_as::<_, WorkflowRun>(
        "SELECT * FROM workflow_runs \
         WHERE status IN ('pending', 'running', 'waiting_approval') \
         ORDER BY started_at ASC",
    )
    .fetch_all(pool)
    .await
    .context("failed to list in-flight workflow runs")?;

    Ok(runs)
}
