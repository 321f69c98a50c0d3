//! Operator-mode CLI handlers for `hub approval` subcommands.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Subcommand;
use sqlx::PgPool;
use uuid::Uuid;

use hub_core::events::EventService;
use hub_core::workflow::gate;
use hub_db::models::ApprovalDecision;
use hub_db::queries::approvals as approvals_db;

#[derive(Subcommand)]
pub enum ApprovalCommands {
    /// Show a single approval
    Get { id: String },
    /// Decide a pending approval
    Decide {
        id: String,
        /// "approved" or "rejected"
        decision: String,
        /// Name or identifier of the approver
        approver: String,
    },
}

pub async fn run_approval_command(
    command: ApprovalCommands,
    pool: &PgPool,
    events: &Arc<EventService>,
) -> Result<()> {
    match command {
        ApprovalCommands::Get { id } => cmd_get(pool, &id).await,
        ApprovalCommands::Decide { id, decision, approver } => {
            cmd_decide(pool, events, &id, &decision, &approver).await
        }
    }
}

fn parse_uuid(label: &str, raw: &str) -> Result<Uuid> {
    raw.parse().with_context(|| format!("invalid {label}: {:?}", raw))
}

async fn cmd_get(pool: &PgPool, id: &str) -> Result<()> {
    let id = parse_uuid("approval ID", id)?;
    let approval = approvals_db::get_approval(pool, id).await?.with_context(|| format!("approval {id} not found"))?;

    println!("Approval: {}", approval.id);
    println!("  Node run:     {}", approval.node_run_id);
    println!("  Requested at: {}", approval.requested_at.format("%Y-%m-%d %H:%M:%S UTC"));
    println!("  Decision:     {}", approval.decision);
    if let Some(decided_at) = approval.decided_at {
        println!("  Decided at:   {}", decided_at.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    if let Some(approver) = &approval.approver {
        println!("  Approver:     {approver}");
    }

    Ok(())
}

async fn cmd_decide(
    pool: &PgPool,
    events: &Arc<EventService>,
    id: &str,
    decision: &str,
    approver: &str,
) -> Result<()> {
    let id = parse_uuid("approval ID", id)?;
    let decision: ApprovalDecision = decision
        .parse()
        .with_context(|| format!("invalid decision: {:?} (expected \"approved\" or \"rejected\")", decision))?;

    let approval = approvals_db::get_approval(pool, id).await?.with_context(|| format!("approval {id} not found"))?;
    let slug = gate::project_slug_for_node_run(pool, approval.node_run_id).await?;

    gate::decide(pool, events, &slug, id, decision, approver)
        .await
        .map_err(|e| anyhow::anyhow!(e))?;

    println!("Approval {id} decided: {decision} by {approver}.");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_valid_uuid() {
        let id = "550e8400-e29b-41d4-a716-446655440000";
        assert_eq!(parse_uuid("approval ID", id).unwrap().to_string(), id);
    }

    #[test]
    fn parse_invalid_uuid_is_rejected() {
        assert!(parse_uuid("approval ID", "nope").is_err());
    }

    #[test]
    fn decision_strings_parse() {
        assert_eq!("approved".parse::<ApprovalDecision>().unwrap(), ApprovalDecision::Approved);
        assert_eq!("rejected".parse::<ApprovalDecision>().unwrap(), ApprovalDecision::Rejected);
        assert!("maybe".parse::<ApprovalDecision>().is_err());
    }
}
