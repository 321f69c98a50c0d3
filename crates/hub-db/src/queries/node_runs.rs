//! Database query functions for the `node_runs` table.
//!
//! This is the Workflow Engine's scheduling surface: readiness, retries, and
//! restart recovery are all expressed as queries over this table so that a
//! crash mid-run can be reconstructed purely from what is committed here.

use anyhow::{Context, Result};
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::NodeRun;

/// Create one node run per node of the triggered workflow, all in `pending`.
/// Idempotent on `(workflow_run_id, node_id)`.
pub async fn create_node_runs_for_workflow(
    pool: &PgPool,
    workflow_run_id: Uuid,
    node_ids: &[Uuid],
) -> Result<Vec<NodeRun>> {
    let mut created = Vec::with_capacity(node_ids.len());
    for node_id in node_ids {
        let node_run = sqlx::query_as::<_, NodeRun>(
            "INSERT INTO node_runs (workflow_run_id, node_id) \
             VALUES ($1, $2) \
             ON CONFLICT (workflow_run_id, node_id) DO UPDATE SET node_id = EXCLUDED.node_id \
             RETURNING *",
        )
        .bind(workflow_run_id)
        .bind(node_id)
        .fetch_one(pool)
        .await
        .with_context(|| format!("failed to create node run for node {node_id}"))?;
        created.push(node_run);
    }
    Ok(created)
}

/// Fetch a node run by ID.
pub async fn get_node_run(pool: &PgPool, id: Uuid) -> Result<Option<NodeRun>> {
    let node_run = sqlx::query_as::<_, NodeRun>("SELECT * FROM node_runs WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch node run")?;

    Ok(node_run)
}

/// List all node runs for a workflow run, ordered by the node's key so
/// dispatch order is deterministic across process restarts.
pub async fn list_node_runs_for_run(pool: &PgPool, workflow_run_id: Uuid) -> Result<Vec<NodeRun>> {
    let node_runs = sqlx::query_as::<_, NodeRun>(
        "SELECT nr.* FROM node_runs nr \
         JOIN workflow_nodes wn ON wn.id = nr.node_id \
         WHERE nr.workflow_run_id = $1 \
         ORDER BY wn.node_key ASC",
    )
    .bind(workflow_run_id)
    .fetch_all(pool)
    .await
    .context("failed to list node runs for workflow run")?;

    Ok(node_runs)
}

/// Node runs in `pending` whose upstream dependency edges all resolve to a
/// node run in `succeeded` or `skipped`. Ordered by the node's key ascending
/// so concurrent promotions dispatch in stable topological order.
pub async fn get_ready_node_runs(pool: &PgPool, workflow_run_id: Uuid) -> Result<Vec<NodeRun>> {
    let node_runs = sqlx::query_as::<_, NodeRun>(
        "SELECT nr.* \
         FROM node_runs nr \
         JOIN workflow_nodes wn ON wn.id = nr.node_id \
         WHERE nr.workflow_run_id = $1 \
           AND nr.status = 'pending' \
           AND NOT EXISTS ( \
               SELECT 1 FROM workflow_edges we \
               JOIN node_runs dep ON dep.node_id = we.from_node_id \
                   AND dep.workflow_run_id = nr.workflow_run_id \
               WHERE we.to_node_id = wn.id \
                 AND dep.status NOT IN ('succeeded', 'skipped') \
           ) \
         ORDER BY wn.node_key ASC",
    )
    .bind(workflow_run_id)
    .fetch_all(pool)
    .await
    .context("failed to get ready node runs")?;

    Ok(node_runs)
}

/// Atomically transition a node run's status. Uses optimistic locking on
/// `status = $from`. Start/finish timestamps are set on the corresponding
/// transitions. `output_snapshot` must only be passed on a transition to
/// SUCCEEDED -- it is present iff the node run succeeded; failure
/// diagnostics go through `error_message` instead.
#[allow(clippy::too_many_arguments)]
pub async fn transition_node_run_status(
    pool: &PgPool,
    node_run_id: Uuid,
    from: crate::models::NodeRunStatus,
    to: crate::models::NodeRunStatus,
    started_at: Option<chrono::DateTime<chrono::Utc>>,
    finished_at: Option<chrono::DateTime<chrono::Utc>>,
    output_snapshot: Option<&Value>,
    exit_code: Option<i32>,
    error_message: Option<&str>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE node_runs \
         SET status = $1, \
             started_at = COALESCE($2, started_at), \
             finished_at = COALESCE($3, finished_at), \
             output_snapshot = COALESCE($4, output_snapshot), \
             exit_code = COALESCE($5, exit_code), \
             last_error = COALESCE($6, last_error) \
         WHERE id = $7 AND status = $8",
    )
    .bind(to)
    .bind(started_at)
    .bind(finished_at)
    .bind(output_snapshot)
    .bind(exit_code)
    .bind(error_message)
    .bind(node_run_id)
    .bind(from)
    .execute(pool)
    .await
    .context("failed to transition node run status")?;

    Ok(result.rows_affected())
}

/// Set the input snapshot materialized for a node run just before dispatch.
pub async fn set_input_snapshot(pool: &PgPool, node_run_id: Uuid, input: &Value) -> Result<()> {
    sqlx::query("UPDATE node_runs SET input_snapshot = $1 WHERE id = $2")
        .bind(input)
        .bind(node_run_id)
        .execute(pool)
        .await
        .context("failed to set node run input snapshot")?;

    Ok(())
}

/// Set the logs reference for a node run (e.g. a container log blob key).
pub async fn set_logs_ref(pool: &PgPool, node_run_id: Uuid, logs_ref: &str) -> Result<()> {
    sqlx::query("UPDATE node_runs SET logs_ref = $1 WHERE id = $2")
        .bind(logs_ref)
        .bind(node_run_id)
        .execute(pool)
        .await
        .context("failed to set node run logs_ref")?;

    Ok(())
}

/// Atomically retry a failed node run in place: increments `attempt`,
/// resets to `pending` so the scheduler's readiness query picks it up
/// again, and clears the previous attempt's timestamps/output. Optimistic
/// locking on `status = 'failed' AND attempt = $current_attempt`.
pub async fn retry_node_run_to_pending(
    pool: &PgPool,
    node_run_id: Uuid,
    current_attempt: i32,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE node_runs \
         SET status = 'pending', \
             attempt = attempt + 1, \
             started_at = NULL, \
             finished_at = NULL, \
             output_snapshot = NULL, \
             exit_code = NULL \
         WHERE id = $1 AND status = 'failed' AND attempt = $2",
    )
    .bind(node_run_id)
    .bind(current_attempt)
    .execute(pool)
    .await
    .context("failed to retry node run to pending")?;

    Ok(result.rows_affected())
}

/// Reset node runs left in `running` or `ready` by a crashed orchestrator
/// process back to `failed`, so the normal retry/escalation path picks them
/// back up. Mirrors the teacher's orphaned-task recovery, scoped here to a
/// single in-flight run discovered at startup.
pub async fn reset_orphaned_node_runs(pool: &PgPool, workflow_run_id: Uuid) -> Result<Vec<NodeRun>> {
    let node_runs = sqlx::query_as::<_, NodeRun>(
        "UPDATE node_runs \
         SET status = 'failed', \
             finished_at = now() \
         WHERE workflow_run_id = $1 \
           AND status IN ('running', 'ready') \
         RETURNING *",
    )
    .bind(workflow_run_id)
    .fetch_all(pool)
    .await
    .context("failed to reset orphaned node runs")?;

    Ok(node_runs)
}

/// Cancel every non-terminal node run of a run: RUNNING is left to the
/// caller to confirm driver termination before marking CANCELLED; PENDING,
/// BLOCKED, READY, and WAITING_APPROVAL become CANCELLED immediately.
pub async fn cancel_non_running_node_runs(pool: &PgPool, workflow_run_id: Uuid) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE node_runs \
         SET status = 'cancelled', finished_at = now() \
         WHERE workflow_run_id = $1 \
           AND status IN ('pending', 'blocked', 'ready', 'waiting_approval')",
    )
    .bind(workflow_run_id)
    .execute(pool)
    .await
    .context("failed to cancel non-running node runs")?;

    Ok(result.rows_affected())
}

/// Mark a single RUNNING node run CANCELLED once the driver has confirmed
/// the container was terminated due to cancellation (not a crash/failure).
pub async fn mark_running_node_run_cancelled(pool: &PgPool, node_run_id: Uuid) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE node_runs \
         SET status = 'cancelled', finished_at = now() \
         WHERE id = $1 AND status = 'running'",
    )
    .bind(node_run_id)
    .execute(pool)
    .await
    .context("failed to mark running node run cancelled")?;

    Ok(result.rows_affected())
}

/// Status counts for a run's node runs, used to decide run-level
/// termination (all succeeded/skipped -> SUCCEEDED; any failed -> FAILED).
#[derive(Debug, Clone, Default)]
pub struct RunProgress {
    pub pending: i64,
    pub blocked: i64,
    pub ready: i64,
    pub running: i64,
    pub succeeded: i64,
    pub failed: i64,
    pub skipped: i64,
    pub waiting_approval: i64,
    pub cancelled: i64,
    pub total: i64,
}

/// Get a summary of node run counts by status for a given workflow run.
pub async fn get_run_progress(pool: &PgPool, workflow_run_id: Uuid) -> Result<RunProgress> {
    let rows: Vec<(String, i64)> = sqlx::query_as(
        "SELECT status::text, COUNT(*) as cnt \
         FROM node_runs \
         WHERE workflow_run_id = $1 \
         GROUP BY status",
    )
    .bind(workflow_run_id)
    .fetch_all(pool)
    .await
    .context("failed to get run progress")?;

    let mut progress = RunProgress::default();
    for (status, count) in &rows {
        match status.as_str() {
            "pending" => progress.pending = *count,
            "blocked" => progress.blocked = *count,
            "ready" => progress.ready = *count,
            "running" => progress.running = *count,
            "succeeded" => progress.succeeded = *count,
            "failed" => progress.failed = *count,
            "skipped" => progress.skipped = *count,
            "waiting_approval" => progress.waiting_approval = *count,
            "cancelled" => progress.cancelled = *count,
            _ => {}
        }
        progress.total += count;
    }
    Ok(progress)
}
