//! Operator-mode CLI handlers for `hub workflow` subcommands.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Subcommand;
use sqlx::PgPool;
use uuid::Uuid;

use hub_core::workflow::{graph, WorkflowEngine};
use hub_db::models::{WorkflowStatus, WorkflowTrigger};
use hub_db::queries::{agents as agents_db, node_runs as node_runs_db, workflow_runs as runs_db, workflows as db};

#[derive(Subcommand)]
pub enum WorkflowCommands {
    /// Create a workflow (starts DRAFT)
    Create {
        project_id: String,
        name: String,
        #[arg(long, default_value = "manual")]
        trigger: String,
    },
    /// Add a node to a draft workflow
    AddNode {
        workflow_id: String,
        node_key: String,
        agent_id: String,
        action: String,
        /// JSON static input template (defaults to `{}`)
        #[arg(long)]
        input: Option<String>,
        #[arg(long)]
        approval_required: bool,
        #[arg(long, default_value_t = 3)]
        retry_max: i32,
        #[arg(long, default_value_t = 1000)]
        retry_backoff_base_ms: i32,
        #[arg(long, default_value_t = 60000)]
        retry_backoff_cap_ms: i32,
    },
    /// Add a dependency edge between two nodes
    AddEdge {
        workflow_id: String,
        from_node_id: String,
        to_node_id: String,
    },
    /// Validate the DAG and move a workflow from DRAFT to ACTIVE
    Activate { workflow_id: String },
    /// List workflows for a project
    List { project_id: String },
    /// Show a single workflow with its nodes and edges
    Get { workflow_id: String },
    /// Trigger a run of an active workflow
    Trigger {
        workflow_id: String,
        /// JSON trigger context (defaults to `{}`)
        #[arg(long)]
        context: Option<String>,
    },
    /// Cancel an in-flight run
    Cancel { run_id: String },
    /// List runs for a workflow
    Runs { workflow_id: String },
    /// List node runs for a run
    NodeRuns { run_id: String },
}

/// Whether a command needs the workflow engine (trigger/cancel), or is
/// plain CRUD against workflow/run tables.
pub fn requires_engine(command: &WorkflowCommands) -> bool {
    matches!(command, WorkflowCommands::Trigger { .. } | WorkflowCommands::Cancel { .. })
}

pub async fn run_workflow_command(
    command: WorkflowCommands,
    pool: &PgPool,
    engine: Option<&Arc<WorkflowEngine>>,
) -> Result<()> {
    match command {
        WorkflowCommands::Create { project_id, name, trigger } => cmd_create(pool, &project_id, &name, &trigger).await,
        WorkflowCommands::AddNode {
            workflow_id,
            node_key,
            agent_id,
            action,
            input,
            approval_required,
            retry_max,
            retry_backoff_base_ms,
            retry_backoff_cap_ms,
        } => {
            cmd_add_node(
                pool,
                &workflow_id,
                &node_key,
                &agent_id,
                &action,
                input.as_deref(),
                approval_required,
                retry_max,
                retry_backoff_base_ms,
                retry_backoff_cap_ms,
            )
            .await
        }
        WorkflowCommands::AddEdge { workflow_id, from_node_id, to_node_id } => {
            cmd_add_edge(pool, &workflow_id, &from_node_id, &to_node_id).await
        }
        WorkflowCommands::Activate { workflow_id } => cmd_activate(pool, &workflow_id).await,
        WorkflowCommands::List { project_id } => cmd_list(pool, &project_id).await,
        WorkflowCommands::Get { workflow_id } => cmd_get(pool, &workflow_id).await,
        WorkflowCommands::Trigger { workflow_id, context } => {
            cmd_trigger(engine.expect("engine required"), &workflow_id, context.as_deref()).await
        }
        WorkflowCommands::Cancel { run_id } => cmd_cancel(engine.expect("engine required"), &run_id).await,
        WorkflowCommands::Runs { workflow_id } => cmd_runs(pool, &workflow_id).await,
        WorkflowCommands::NodeRuns { run_id } => cmd_node_runs(pool, &run_id).await,
    }
}

fn parse_uuid(label: &str, raw: &str) -> Result<Uuid> {
    raw.parse().with_context(|| format!("invalid {label}: {:?}", raw))
}

async fn cmd_create(pool: &PgPool, project_id: &str, name: &str, trigger: &str) -> Result<()> {
    let project_id = parse_uuid("project ID", project_id)?;
    let trigger: WorkflowTrigger = trigger.parse().with_context(|| format!("invalid trigger: {:?}", trigger))?;

    let workflow = db::insert_workflow(pool, project_id, name, trigger).await?;

    println!("Workflow created.");
    println!("  ID:      {}", workflow.id);
    println!("  Name:    {}", workflow.name);
    println!("  Trigger: {}", workflow.trigger);
    println!("  Status:  {}", workflow.status);

    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn cmd_add_node(
    pool: &PgPool,
    workflow_id: &str,
    node_key: &str,
    agent_id: &str,
    action: &str,
    input: Option<&str>,
    approval_required: bool,
    retry_max: i32,
    retry_backoff_base_ms: i32,
    retry_backoff_cap_ms: i32,
) -> Result<()> {
    let workflow_id = parse_uuid("workflow ID", workflow_id)?;
    let agent_id = parse_uuid("agent ID", agent_id)?;
    let static_input_template: serde_json::Value = match input {
        Some(raw) => serde_json::from_str(raw).context("--input must be valid JSON")?,
        None => serde_json::json!({}),
    };

    let new = db::NewWorkflowNode {
        workflow_id,
        node_key: node_key.to_string(),
        agent_id,
        action: action.to_string(),
        static_input_template,
        approval_required,
        retry_max_attempts: retry_max,
        retry_backoff_base_ms,
        retry_backoff_cap_ms,
    };

    let node = db::insert_workflow_node(pool, &new).await?;

    println!("Node added.");
    println!("  ID:       {}", node.id);
    println!("  Key:      {}", node.node_key);
    println!("  Action:   {}", node.action);

    Ok(())
}

async fn cmd_add_edge(pool: &PgPool, workflow_id: &str, from_node_id: &str, to_node_id: &str) -> Result<()> {
    let workflow_id = parse_uuid("workflow ID", workflow_id)?;
    let from_node_id = parse_uuid("from-node ID", from_node_id)?;
    let to_node_id = parse_uuid("to-node ID", to_node_id)?;

    db::insert_workflow_edge(pool, workflow_id, from_node_id, to_node_id).await?;

    println!("Edge added: {from_node_id} -> {to_node_id}");

    Ok(())
}

async fn cmd_activate(pool: &PgPool, workflow_id: &str) -> Result<()> {
    let workflow_id = parse_uuid("workflow ID", workflow_id)?;

    let workflow = db::get_workflow(pool, workflow_id)
        .await?
        .with_context(|| format!("workflow {workflow_id} not found"))?;

    let nodes = db::list_workflow_nodes(pool, workflow_id).await?;
    let edges = db::list_workflow_edges(pool, workflow_id).await?;
    let agents = agents_db::list_agents_for_project(pool, workflow.project_id).await?;
    let known_agent_ids: HashSet<Uuid> = agents.iter().map(|a| a.id).collect();

    graph::validate(&nodes, &edges, &known_agent_ids).context("workflow DAG validation failed")?;

    db::update_workflow_status(pool, workflow_id, WorkflowStatus::Active).await?;

    println!("Workflow {workflow_id} activated. Workflows are immutable once active; edit by creating a new workflow.");

    Ok(())
}

async fn cmd_list(pool: &PgPool, project_id: &str) -> Result<()> {
    let project_id = parse_uuid("project ID", project_id)?;
    let workflows = db::list_workflows_for_project(pool, project_id).await?;

    if workflows.is_empty() {
        println!("No workflows found for project {project_id}.");
        return Ok(());
    }

    println!("{:<36}  {:<10}  {:<8}  NAME", "ID", "TRIGGER", "STATUS");
    for w in &workflows {
        println!("{:<36}  {:<10}  {:<8}  {}", w.id, w.trigger.to_string(), w.status.to_string(), w.name);
    }

    Ok(())
}

async fn cmd_get(pool: &PgPool, workflow_id: &str) -> Result<()> {
    let workflow_id = parse_uuid("workflow ID", workflow_id)?;
    let workflow = db::get_workflow(pool, workflow_id)
        .await?
        .with_context(|| format!("workflow {workflow_id} not found"))?;
    let nodes = db::list_workflow_nodes(pool, workflow_id).await?;
    let edges = db::list_workflow_edges(pool, workflow_id).await?;

    println!("Workflow: {}", workflow.name);
    println!("  ID:      {}", workflow.id);
    println!("  Trigger: {}", workflow.trigger);
    println!("  Status:  {}", workflow.status);
    println!();
    println!("Nodes:");
    for n in &nodes {
        println!("  {} [{}] action={} approval_required={}", n.id, n.node_key, n.action, n.approval_required);
    }
    println!();
    println!("Edges:");
    for e in &edges {
        println!("  {} -> {}", e.from_node_id, e.to_node_id);
    }

    Ok(())
}

async fn cmd_trigger(engine: &Arc<WorkflowEngine>, workflow_id: &str, context: Option<&str>) -> Result<()> {
    let workflow_id = parse_uuid("workflow ID", workflow_id)?;
    let context: serde_json::Value = match context {
        Some(raw) => serde_json::from_str(raw).context("--context must be valid JSON")?,
        None => serde_json::json!({}),
    };

    let run_id = engine.trigger(workflow_id, context, None).await?;

    println!("Run triggered: {run_id}");

    Ok(())
}

async fn cmd_cancel(engine: &Arc<WorkflowEngine>, run_id: &str) -> Result<()> {
    let run_id = parse_uuid("run ID", run_id)?;
    engine.cancel(run_id).await?;
    println!("Run {run_id} cancelled.");
    Ok(())
}

async fn cmd_runs(pool: &PgPool, workflow_id: &str) -> Result<()> {
    let workflow_id = parse_uuid("workflow ID", workflow_id)?;
    let runs = runs_db::list_runs_for_workflow(pool, workflow_id).await?;

    if runs.is_empty() {
        println!("No runs found for workflow {workflow_id}.");
        return Ok(());
    }

    println!("{:<36}  {:<16}  STARTED_AT", "ID", "STATUS");
    for r in &runs {
        println!("{:<36}  {:<16}  {}", r.id, r.status.to_string(), r.started_at.format("%Y-%m-%d %H:%M:%S UTC"));
    }

    Ok(())
}

async fn cmd_node_runs(pool: &PgPool, run_id: &str) -> Result<()> {
    let run_id = parse_uuid("run ID", run_id)?;
    let node_runs = node_runs_db::list_node_runs_for_run(pool, run_id).await?;
    let progress = node_runs_db::get_run_progress(pool, run_id).await?;

    println!(
        "Progress: {}/{} succeeded, {} failed, {} running, {} pending",
        progress.succeeded, progress.total, progress.failed, progress.running, progress.pending
    );
    println!();
    println!("{:<36}  {:<16}  ATTEMPT", "ID", "STATUS");
    for nr in &node_runs {
        println!("{:<36}  {:<16}  {}", nr.id, nr.status.to_string(), nr.attempt);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_valid_uuid() {
        let id = "550e8400-e29b-41d4-a716-446655440000";
        assert_eq!(parse_uuid("workflow ID", id).unwrap().to_string(), id);
    }

    #[test]
    fn parse_invalid_uuid_is_rejected() {
        assert!(parse_uuid("workflow ID", "nope").is_err());
    }

    #[test]
    fn requires_engine_only_for_trigger_and_cancel() {
        assert!(requires_engine(&WorkflowCommands::Trigger { workflow_id: "x".into(), context: None }));
        assert!(requires_engine(&WorkflowCommands::Cancel { run_id: "x".into() }));
        assert!(!requires_engine(&WorkflowCommands::List { project_id: "x".into() }));
    }
}
