//! Database query functions for the `approvals` table.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::Approval;

/// Create a new PENDING approval for a node run. The partial unique index
/// on `(node_run_id) WHERE decision = 'pending'` enforces the "one live
/// approval per node run" invariant at the database layer.
pub async fn insert_pending_approval(pool: &PgPool, node_run_id: Uuid) -> Result<Approval> {
    let approval = sqlx::query_as::<_, Approval>(
        "INSERT INTO approvals (node_run_id) VALUES ($1) RETURNING *",
    )
    .bind(node_run_id)
    .fetch_one(pool)
    .await
    .with_context(|| format!("failed to create approval for node run {node_run_id}"))?;

    Ok(approval)
}

/// Fetch an approval by ID.
pub async fn get_approval(pool: &PgPool, id: Uuid) -> Result<Option<Approval>> {
    let approval = sqlx::query_as::<_, Approval>("SELECT * FROM approvals WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch approval")?;

    Ok(approval)
}

/// Decide a PENDING approval exactly once. Optimistic locking on
/// `decision = 'pending'` makes a second decide on the same approval a
/// no-op (0 rows affected), which the caller surfaces as `CONFLICT`.
pub async fn decide_approval(
    pool: &PgPool,
    id: Uuid,
    decision: crate::models::ApprovalDecision,
    approver: &str,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE approvals \
         SET decision = $1, decided_at = now(), approver = $2 \
         WHERE id = $3 AND decision = 'pending'",
    )
    .bind(decision)
    .bind(approver)
    .bind(id)
    .execute(pool)
    .await
    .context("failed to decide approval")?;

    Ok(result.rows_affected())
}

/// Auto-reject the PENDING approval (if any) for a node run. Used when a
/// workflow run is cancelled while WAITING_APPROVAL, so a stale decide call
/// cannot resurrect a dead run.
pub async fn auto_reject_pending_for_node_run(pool: &PgPool, node_run_id: Uuid) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE approvals \
         SET decision = 'rejected', decided_at = now(), approver = 'system:cancel' \
         WHERE node_run_id = $1 AND decision = 'pending'",
    )
    .bind(node_run_id)
    .execute(pool)
    .await
    .context("failed to auto-reject pending approval")?;

    Ok(result.rows_affected())
}

/// Fetch the live PENDING approval for a node run, if any.
pub async fn get_pending_approval_for_node_run(
    pool: &PgPool,
    node_run_id: Uuid,
) -> Result<Option<Approval>> {
    let approval = sqlx::query_as::<_, Approval>(
        "SELECT * FROM approvals WHERE node_run_id = $1 AND decision = 'pending'",
    )
    .bind(node_run_id)
    .fetch_optional(pool)
    .await
    .context("failed to fetch pending approval for node run")?;

    Ok(approval)
}
