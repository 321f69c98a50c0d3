//! Node run status state machine transitions.

use anyhow::{Context, Result, bail};
use sqlx::PgPool;
use uuid::Uuid;

use hub_db::models::NodeRunStatus;
use hub_db::queries::node_runs as db;

/// The node run status state machine.
///
/// ```text
/// pending          -> ready            (dependencies satisfied)
/// pending          -> cancelled        (run cancelled before promotion)
/// pending          -> skipped          (upstream failure, v1 fail-fast)
/// blocked          -> ready            (reserved for a future indegree-tracking scheduler)
/// blocked          -> cancelled
/// ready            -> running          (dispatched, no approval gate)
/// ready            -> waiting_approval (approval gate)
/// ready            -> failed           (input/schema validation failed before dispatch)
/// ready            -> cancelled
/// ready            -> skipped
/// waiting_approval -> running          (approved)
/// waiting_approval -> failed           (rejected)
/// waiting_approval -> cancelled        (cancel auto-rejects, see gate.rs)
/// running          -> succeeded
/// running          -> failed
/// running          -> cancelled        (driver confirmed termination)
/// failed           -> pending          (retry, in place)
/// ```
///
/// `blocked` is carried in the data model but the v1 scheduler never writes
/// it: readiness is recomputed from scratch every tick via a `NOT EXISTS`
/// query over unfinished dependencies ([`hub_db::queries::node_runs::get_ready_node_runs`])
/// rather than maintained as a materialized indegree counter, so a node run
/// simply stays `pending` until its dependencies clear.
pub struct NodeRunStateMachine;

impl NodeRunStateMachine {
    pub fn is_valid_transition(from: NodeRunStatus, to: NodeRunStatus) -> bool {
        use NodeRunStatus::*;
        matches!(
            (from, to),
            (Pending, Ready)
                | (Pending, Cancelled)
                | (Pending, Skipped)
                | (Blocked, Ready)
                | (Blocked, Cancelled)
                | (Ready, Running)
                | (Ready, WaitingApproval)
                | (Ready, Failed)
                | (Ready, Cancelled)
                | (Ready, Skipped)
                | (WaitingApproval, Running)
                | (WaitingApproval, Failed)
                | (WaitingApproval, Cancelled)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Failed, Pending)
        )
    }

    /// Execute a validated transition with optimistic locking.
    ///
    /// `output_snapshot` must only be `Some` when `to` is SUCCEEDED;
    /// failure diagnostics go through `error_message`.
    #[allow(clippy::too_many_arguments)]
    pub async fn transition(
        pool: &PgPool,
        node_run_id: Uuid,
        from: NodeRunStatus,
        to: NodeRunStatus,
        started_at: Option<chrono::DateTime<chrono::Utc>>,
        finished_at: Option<chrono::DateTime<chrono::Utc>>,
        output_snapshot: Option<&serde_json::Value>,
        exit_code: Option<i32>,
        error_message: Option<&str>,
    ) -> Result<()> {
        if !Self::is_valid_transition(from, to) {
            bail!("invalid node run transition: {from} -> {to} for node run {node_run_id}");
        }
        debug_assert!(
            output_snapshot.is_none() || to == NodeRunStatus::Succeeded,
            "output_snapshot must only be set on a transition to succeeded"
        );

        let rows = db::transition_node_run_status(
            pool,
            node_run_id,
            from,
            to,
            started_at,
            finished_at,
            output_snapshot,
            exit_code,
            error_message,
        )
        .await
        .with_context(|| format!("failed to transition node run {node_run_id} from {from} to {to}"))?;

        if rows == 0 {
            let node_run = db::get_node_run(pool, node_run_id).await?;
            match node_run {
                None => bail!("node run {node_run_id} not found"),
                Some(nr) => bail!(
                    "optimistic lock failed: node run {node_run_id} has status {}, expected {from}",
                    nr.status
                ),
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use NodeRunStatus::*;

    #[test]
    fn happy_path_chain_is_valid() {
        assert!(NodeRunStateMachine::is_valid_transition(Pending, Ready));
        assert!(NodeRunStateMachine::is_valid_transition(Ready, Running));
        assert!(NodeRunStateMachine::is_valid_transition(Running, Succeeded));
    }

    #[test]
    fn approval_gate_chain_is_valid() {
        assert!(NodeRunStateMachine::is_valid_transition(Ready, WaitingApproval));
        assert!(NodeRunStateMachine::is_valid_transition(WaitingApproval, Running));
        assert!(NodeRunStateMachine::is_valid_transition(WaitingApproval, Failed));
    }

    #[test]
    fn retry_reenters_pending() {
        assert!(NodeRunStateMachine::is_valid_transition(Failed, Pending));
    }

    #[test]
    fn terminal_states_have_no_outgoing_edges() {
        for to in [Ready, Running, Succeeded, Failed, Skipped, WaitingApproval, Cancelled, Pending] {
            assert!(!NodeRunStateMachine::is_valid_transition(Succeeded, to));
            assert!(!NodeRunStateMachine::is_valid_transition(Skipped, to));
            assert!(!NodeRunStateMachine::is_valid_transition(Cancelled, to));
        }
    }
}
