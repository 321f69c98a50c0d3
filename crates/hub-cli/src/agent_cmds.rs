//! Operator-mode CLI handlers for `hub agent` subcommands.

use anyhow::{Context, Result};
use clap::Subcommand;
use sqlx::PgPool;
use uuid::Uuid;

use hub_db::models::{AgentRisk, AgentType};
use hub_db::queries::agents::{self as db, NewAgent};

#[derive(Subcommand)]
pub enum AgentCommands {
    /// Register an agent with a project
    Register {
        project_id: String,
        name: String,
        image: String,
        #[arg(long, default_value = "action")]
        agent_type: String,
        #[arg(long, default_value = "auto")]
        risk: String,
        /// JSON input schema (defaults to `{}`)
        #[arg(long)]
        input_schema: Option<String>,
        /// JSON output schema (defaults to `{}`)
        #[arg(long)]
        output_schema: Option<String>,
        /// Repeatable capability tag
        #[arg(long = "capability")]
        capabilities: Vec<String>,
    },
    /// List agents registered with a project
    List { project_id: String },
    /// Show a single agent
    Get { id: String },
    /// Soft-delete an agent
    Delete { id: String },
}

pub async fn run_agent_command(command: AgentCommands, pool: &PgPool) -> Result<()> {
    match command {
        AgentCommands::Register { project_id, name, image, agent_type, risk, input_schema, output_schema, capabilities } => {
            cmd_register(pool, &project_id, &name, &image, &agent_type, &risk, input_schema.as_deref(), output_schema.as_deref(), capabilities).await
        }
        AgentCommands::List { project_id } => cmd_list(pool, &project_id).await,
        AgentCommands::Get { id } => cmd_get(pool, &id).await,
        AgentCommands::Delete { id } => cmd_delete(pool, &id).await,
    }
}

fn parse_uuid(label: &str, raw: &str) -> Result<Uuid> {
    raw.parse().with_context(|| format!("invalid {label}: {:?}", raw))
}

#[allow(clippy::too_many_arguments)]
async fn cmd_register(
    pool: &PgPool,
    project_id: &str,
    name: &str,
    image: &str,
    agent_type: &str,
    risk: &str,
    input_schema: Option<&str>,
    output_schema: Option<&str>,
    capabilities: Vec<String>,
) -> Result<()> {
    let project_id = parse_uuid("project ID", project_id)?;
    let agent_type: AgentType = agent_type.parse().with_context(|| format!("invalid agent type: {:?}", agent_type))?;
    let risk: AgentRisk = risk.parse().with_context(|| format!("invalid risk level: {:?}", risk))?;

    let input_schema: serde_json::Value = match input_schema {
        Some(raw) => serde_json::from_str(raw).context("--input-schema must be valid JSON")?,
        None => serde_json::json!({}),
    };
    let output_schema: serde_json::Value = match output_schema {
        Some(raw) => serde_json::from_str(raw).context("--output-schema must be valid JSON")?,
        None => serde_json::json!({}),
    };

    let new = NewAgent {
        project_id,
        name: name.to_string(),
        agent_type,
        risk,
        image: image.to_string(),
        input_schema,
        output_schema,
        capabilities,
    };

    let agent = db::insert_agent(pool, &new).await?;

    println!("Agent registered.");
    println!("  ID:    {}", agent.id);
    println!("  Name:  {}", agent.name);
    println!("  Type:  {}", agent.agent_type);
    println!("  Risk:  {}", agent.risk);
    println!("  Image: {}", agent.image);

    Ok(())
}

async fn cmd_list(pool: &PgPool, project_id: &str) -> Result<()> {
    let project_id = parse_uuid("project ID", project_id)?;
    let agents = db::list_agents_for_project(pool, project_id).await?;

    if agents.is_empty() {
        println!("No agents registered for project {project_id}.");
        return Ok(());
    }

    println!("{:<36}  {:<10}  {:<18}  NAME", "ID", "TYPE", "RISK");
    for a in &agents {
        println!("{:<36}  {:<10}  {:<18}  {}", a.id, a.agent_type.to_string(), a.risk.to_string(), a.name);
    }

    Ok(())
}

async fn cmd_get(pool: &PgPool, id: &str) -> Result<()> {
    let id = parse_uuid("agent ID", id)?;
    let agent = db::get_agent(pool, id).await?.with_context(|| format!("agent {id} not found"))?;

    println!("Agent: {}", agent.name);
    println!("  ID:           {}", agent.id);
    println!("  Type:         {}", agent.agent_type);
    println!("  Risk:         {}", agent.risk);
    println!("  Image:        {}", agent.image);
    println!("  Capabilities: {}", agent.capabilities.join(", "));
    if agent.deleted_at.is_some() {
        println!("  Deleted:      yes");
    }

    Ok(())
}

async fn cmd_delete(pool: &PgPool, id: &str) -> Result<()> {
    let id = parse_uuid("agent ID", id)?;
    let affected = db::soft_delete_agent(pool, id).await?;
    if affected == 0 {
        anyhow::bail!("agent {id} could not be deleted: not found, already deleted, or referenced by an in-flight run");
    }
    println!("Agent {id} deleted.");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_valid_uuid() {
        let id = "550e8400-e29b-41d4-a716-446655440000";
        assert_eq!(parse_uuid("agent ID", id).unwrap().to_string(), id);
    }

    #[test]
    fn parse_invalid_uuid_is_rejected() {
        assert!(parse_uuid("agent ID", "nope").is_err());
    }

    #[test]
    fn agent_type_and_risk_parse_from_cli_strings() {
        assert!("action".parse::<AgentType>().is_ok());
        assert!("approval_required".parse::<AgentRisk>().is_ok());
        assert!("bogus".parse::<AgentType>().is_err());
    }
}
