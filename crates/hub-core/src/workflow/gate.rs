//! Approval gates: a node run whose agent is high-risk (or whose node is
//! explicitly flagged) waits for a human decision before dispatch.

use anyhow::{Context, Result};
use chrono::Utc;
use thiserror::Error;
use uuid::Uuid;

use hub_db::models::{Agent, ApprovalDecision, NodeRunStatus, WorkflowNode};
use hub_db::queries::approvals as db;
use hub_db::queries::{node_runs, projects, workflow_runs, workflows};

use crate::events::EventService;

use super::state::NodeRunStateMachine;

#[derive(Debug, Error)]
pub enum GateError {
    #[error("approval {0} not found")]
    NotFound(Uuid),
    #[error("approval {0} has already been decided")]
    AlreadyDecided(Uuid),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Whether a node run must pass through a human approval gate before the
/// driver is invoked.
pub fn requires_approval(node: &WorkflowNode, agent: &Agent) -> bool {
    node.approval_required || agent.risk == hub_db::models::AgentRisk::ApprovalRequired
}

/// Move a READY node run into WAITING_APPROVAL, create its pending
/// approval row, and publish `hub.<slug>.approval.requested`.
pub async fn request_approval(
    pool: &sqlx::PgPool,
    events: &EventService,
    slug: &str,
    node_run_id: Uuid,
) -> Result<Uuid> {
    NodeRunStateMachine::transition(
        pool,
        node_run_id,
        NodeRunStatus::Ready,
        NodeRunStatus::WaitingApproval,
        None,
        None,
        None,
        None,
        None,
    )
    .await
    .context("failed to transition node run to waiting_approval")?;

    let approval = db::insert_pending_approval(pool, node_run_id).await?;

    let subject = format!("hub.{slug}.approval.requested");
    events
        .publish(
            &subject,
            &serde_json::json!({"approval_id": approval.id, "node_run_id": node_run_id}),
            "workflow-engine",
            None,
        )
        .await
        .context("failed to publish approval.requested event")?;

    Ok(approval.id)
}

/// `DecideApproval(approvalId, decision, approver)`. Approval advances the
/// gated node run to RUNNING; rejection fails it outright.
pub async fn decide(
    pool: &sqlx::PgPool,
    events: &EventService,
    slug: &str,
    approval_id: Uuid,
    decision: ApprovalDecision,
    approver: &str,
) -> Result<(), GateError> {
    let approval = db::get_approval(pool, approval_id)
        .await?
        .ok_or(GateError::NotFound(approval_id))?;

    let rows = db::decide_approval(pool, approval_id, decision, approver).await?;
    if rows == 0 {
        return Err(GateError::AlreadyDecided(approval_id));
    }

    let to = match decision {
        ApprovalDecision::Approved => NodeRunStatus::Running,
        ApprovalDecision::Rejected => NodeRunStatus::Failed,
        ApprovalDecision::Pending => {
            return Err(GateError::Other(anyhow::anyhow!("cannot decide an approval as pending")));
        }
    };

    let started_at = matches!(decision, ApprovalDecision::Approved).then(Utc::now);
    let finished_at = matches!(decision, ApprovalDecision::Rejected).then(Utc::now);
    let error_message = matches!(decision, ApprovalDecision::Rejected).then_some("rejected at approval gate");

    NodeRunStateMachine::transition(
        pool,
        approval.node_run_id,
        NodeRunStatus::WaitingApproval,
        to,
        started_at,
        finished_at,
        None,
        None,
        error_message,
    )
    .await?;

    let subject = format!("hub.{slug}.approval.decided");
    events
        .publish(
            &subject,
            &serde_json::json!({"approval_id": approval_id, "decision": decision, "approver": approver}),
            "workflow-engine",
            None,
        )
        .await
        .context("failed to publish approval.decided event")?;

    Ok(())
}

/// Auto-reject a node run's live pending approval (if any) when its run is
/// cancelled while WAITING_APPROVAL, so a stale `decide` call afterwards
/// cannot resurrect a dead run.
pub async fn auto_reject_for_cancel(pool: &sqlx::PgPool, node_run_id: Uuid) -> Result<()> {
    db::auto_reject_pending_for_node_run(pool, node_run_id).await?;
    Ok(())
}

/// Walk node run -> workflow run -> workflow -> project to find the slug
/// a `hub.<slug>.approval.*` event should be published under. Approvals
/// don't carry a project reference directly.
pub async fn project_slug_for_node_run(pool: &sqlx::PgPool, node_run_id: Uuid) -> Result<String> {
    let node_run = node_runs::get_node_run(pool, node_run_id)
        .await?
        .with_context(|| format!("node run {node_run_id} not found"))?;
    let run = workflow_runs::get_workflow_run(pool, node_run.workflow_run_id)
        .await?
        .with_context(|| format!("workflow run {} not found", node_run.workflow_run_id))?;
    let workflow = workflows::get_workflow(pool, run.workflow_id)
        .await?
        .with_context(|| format!("workflow {} not found", run.workflow_id))?;
    let project = projects::get_project(pool, workflow.project_id)
        .await?
        .with_context(|| format!("project {} not found", workflow.project_id))?;

    Ok(project.slug)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent(risk: hub_db::models::AgentRisk) -> Agent {
        Agent {
            id: Uuid::new_v4(),
            project_id: Uuid::new_v4(),
            name: "a".to_string(),
            agent_type: hub_db::models::AgentType::Action,
            risk,
            image: "img".to_string(),
            input_schema: serde_json::json!({}),
            output_schema: serde_json::json!({}),
            capabilities: vec![],
            deleted_at: None,
            created_at: Utc::now(),
        }
    }

    fn node(approval_required: bool) -> WorkflowNode {
        WorkflowNode {
            id: Uuid::new_v4(),
            workflow_id: Uuid::new_v4(),
            node_key: "n".to_string(),
            agent_id: Uuid::new_v4(),
            action: "run".to_string(),
            static_input_template: serde_json::json!({}),
            approval_required,
            retry_max_attempts: 1,
            retry_backoff_base_ms: 1000,
            retry_backoff_cap_ms: 60_000,
            on_failure: None,
        }
    }

    #[test]
    fn node_flag_forces_approval_regardless_of_risk() {
        assert!(requires_approval(&node(true), &agent(hub_db::models::AgentRisk::Auto)));
    }

    #[test]
    fn approval_required_risk_forces_approval() {
        assert!(requires_approval(&node(false), &agent(hub_db::models::AgentRisk::ApprovalRequired)));
    }

    #[test]
    fn auto_risk_without_node_flag_needs_no_approval() {
        assert!(!requires_approval(&node(false), &agent(hub_db::models::AgentRisk::Auto)));
    }
}
