//! Database query functions for the `workflows`, `workflow_nodes`, and
//! `workflow_edges` tables.

use anyhow::{Context, Result};
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{Workflow, WorkflowEdge, WorkflowNode, WorkflowStatus, WorkflowTrigger};

/// Insert a new workflow row in `draft` status.
pub async fn insert_workflow(
    pool: &PgPool,
    project_id: Uuid,
    name: &str,
    trigger: WorkflowTrigger,
) -> Result<Workflow> {
    let workflow = sqlx::query_as::<_, Workflow>(
        "INSERT INTO workflows (project_id, name, trigger) \
         VALUES ($1, $2, $3) \
         RETURNING *",
    )
    .bind(project_id)
    .bind(name)
    .bind(trigger)
    .fetch_one(pool)
    .await
    .with_context(|| format!("failed to insert workflow {name}"))?;

    Ok(workflow)
}

/// Fetch a workflow by ID.
pub async fn get_workflow(pool: &PgPool, id: Uuid) -> Result<Option<Workflow>> {
    let workflow = sqlx::query_as::<_, Workflow>("SELECT * FROM workflows WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch workflow")?;

    Ok(workflow)
}

/// List workflows for a project, newest first.
pub async fn list_workflows_for_project(pool: &PgPool, project_id: Uuid) -> Result<Vec<Workflow>> {
    let workflows = sqlx::query_as::<_, Workflow>(
        "SELECT * FROM workflows WHERE project_id = $1 ORDER BY created_at DESC",
    )
    .bind(project_id)
    .fetch_all(pool)
    .await
    .context("failed to list workflows for project")?;

    Ok(workflows)
}

/// Transition a workflow's status. Only DRAFT workflows may be mutated
/// further (nodes/edges); this transitions the status cell itself, e.g.
/// DRAFT -> ACTIVE or ACTIVE -> DISABLED.
pub async fn update_workflow_status(
    pool: &PgPool,
    id: Uuid,
    status: WorkflowStatus,
) -> Result<()> {
    let result = sqlx::query("UPDATE workflows SET status = $1, updated_at = now() WHERE id = $2")
        .bind(status)
        .bind(id)
        .execute(pool)
        .await
        .context("failed to update workflow status")?;

    if result.rows_affected() == 0 {
        anyhow::bail!("workflow {id} not found");
    }

    Ok(())
}

/// Parameters for inserting a new workflow node.
#[derive(Debug, Clone)]
pub struct NewWorkflowNode {
    pub workflow_id: Uuid,
    pub node_key: String,
    pub agent_id: Uuid,
    pub action: String,
    pub static_input_template: Value,
    pub approval_required: bool,
    pub retry_max_attempts: i32,
    pub retry_backoff_base_ms: i32,
    pub retry_backoff_cap_ms: i32,
}

/// Insert a new workflow node.
pub async fn insert_workflow_node(pool: &PgPool, new: &NewWorkflowNode) -> Result<WorkflowNode> {
    let node = sqlx::query_as::<_, WorkflowNode>(
        "INSERT INTO workflow_nodes \
             (workflow_id, node_key, agent_id, action, static_input_template, \
              approval_required, retry_max_attempts, retry_backoff_base_ms, retry_backoff_cap_ms) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
         RETURNING *",
    )
    .bind(new.workflow_id)
    .bind(&new.node_key)
    .bind(new.agent_id)
    .bind(&new.action)
    .bind(&new.static_input_template)
    .bind(new.approval_required)
    .bind(new.retry_max_attempts)
    .bind(new.retry_backoff_base_ms)
    .bind(new.retry_backoff_cap_ms)
    .fetch_one(pool)
    .await
    .with_context(|| format!("failed to insert workflow node {}", new.node_key))?;

    Ok(node)
}

/// List all nodes in a workflow.
pub async fn list_workflow_nodes(pool: &PgPool, workflow_id: Uuid) -> Result<Vec<WorkflowNode>> {
    let nodes = sqlx::query_as::<_, WorkflowNode>(
        "SELECT * FROM workflow_nodes WHERE workflow_id = $1 ORDER BY node_key ASC",
    )
    .bind(workflow_id)
    .fetch_all(pool)
    .await
    .context("failed to list workflow nodes")?;

    Ok(nodes)
}

/// Insert a dependency edge `from_node_id -> to_node_id` within a workflow.
///
/// Uses `ON CONFLICT DO NOTHING` so this is idempotent.
pub async fn insert_workflow_edge(
    pool: &PgPool,
    workflow_id: Uuid,
    from_node_id: Uuid,
    to_node_id: Uuid,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO workflow_edges (workflow_id, from_node_id, to_node_id) \
         VALUES ($1, $2, $3) \
         ON CONFLICT DO NOTHING",
    )
    .bind(workflow_id)
    .bind(from_node_id)
    .bind(to_node_id)
    .execute(pool)
    .await
    .context("failed to insert workflow edge")?;

    Ok(())
}

/// Fetch a single workflow node by ID.
pub async fn get_workflow_node(pool: &PgPool, id: Uuid) -> Result<Option<WorkflowNode>> {
    let node = sqlx::query_as::<_, WorkflowNode>("SELECT * FROM workflow_nodes WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch workflow node")?;

    Ok(node)
}

/// List all edges in a workflow.
pub async fn list_workflow_edges(pool: &PgPool, workflow_id: Uuid) -> Result<Vec<WorkflowEdge>> {
    let edges = sqlx::query_as::<_, WorkflowEdge>(
        "SELECT * FROM workflow_edges WHERE workflow_id = $1",
    )
    .bind(workflow_id)
    .fetch_all(pool)
    .await
    .context("failed to list workflow edges")?;

    Ok(edges)
}
