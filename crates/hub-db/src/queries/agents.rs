//! Database query functions for the `agents` table.

use anyhow::{Context, Result};
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{Agent, AgentRisk, AgentType};

/// Parameters for registering a new agent.
#[derive(Debug, Clone)]
pub struct NewAgent {
    pub project_id: Uuid,
    pub name: String,
    pub agent_type: AgentType,
    pub risk: AgentRisk,
    pub image: String,
    pub input_schema: Value,
    pub output_schema: Value,
    pub capabilities: Vec<String>,
}

/// Register a new agent. Returns the inserted row with server-generated
/// defaults (id, created_at).
pub async fn insert_agent(pool: &PgPool, new: &NewAgent) -> Result<Agent> {
    let agent = sqlx::query_as::<_, Agent>(
        "INSERT INTO agents (project_id, name, agent_type, risk, image, input_schema, output_schema, capabilities) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
         RETURNING *",
    )
    .bind(new.project_id)
    .bind(&new.name)
    .bind(new.agent_type)
    .bind(new.risk)
    .bind(&new.image)
    .bind(&new.input_schema)
    .bind(&new.output_schema)
    .bind(&new.capabilities)
    .fetch_one(pool)
    .await
    .with_context(|| format!("failed to register agent {}", new.name))?;

    Ok(agent)
}

/// Fetch an agent by ID, including soft-deleted rows.
pub async fn get_agent(pool: &PgPool, id: Uuid) -> Result<Option<Agent>> {
    let agent = sqlx::query_as::<_, Agent>("SELECT * FROM agents WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch agent")?;

    Ok(agent)
}

/// List agents for a project, excluding soft-deleted rows.
pub async fn list_agents_for_project(pool: &PgPool, project_id: Uuid) -> Result<Vec<Agent>> {
    let agents = sqlx::query_as::<_, Agent>(
        "SELECT * FROM agents \
         WHERE project_id = $1 AND deleted_at IS NULL \
         ORDER BY name ASC",
    )
    .bind(project_id)
    .fetch_all(pool)
    .await
    .context("failed to list agents for project")?;

    Ok(agents)
}

/// Soft-delete an agent, provided it is not referenced by any node run
/// whose workflow run has not yet reached a terminal status.
///
/// Returns `0` rows affected if the agent does not exist, is already
/// deleted, or is still referenced by an in-flight run (the caller should
/// treat the latter as `CONFLICT`, distinguishable via [`get_agent`]).
pub async fn soft_delete_agent(pool: &PgPool, id: Uuid) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE agents \
         SET deleted_at = now() \
         WHERE id = $1 AND deleted_at IS NULL \
           AND NOT EXISTS ( \
               SELECT 1 FROM workflow_nodes wn \
               JOIN node_runs nr ON nr.node_id = wn.id \
               JOIN workflow_runs wr ON wr.id = nr.workflow_run_id \
               WHERE wn.agent_id = agents.id \
                 AND wr.status IN ('pending', 'running', 'waiting_approval') \
           )",
    )
    .bind(id)
    .execute(pool)
    .await
    .context("failed to soft-delete agent")?;

    Ok(result.rows_affected())
}
