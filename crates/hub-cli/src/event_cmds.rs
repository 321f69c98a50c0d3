//! Operator-mode CLI handlers for `hub event` subcommands.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Subcommand;
use uuid::Uuid;

use hub_core::events::{pattern_to_like, EventService};
use hub_db::queries::events::EventFilter;

const DEFAULT_QUERY_LIMIT: i64 = 50;

#[derive(Subcommand)]
pub enum EventCommands {
    /// Publish an event onto the bus
    Publish {
        /// Dotted subject, e.g. hub.demo.project.started
        subject: String,
        /// JSON payload (defaults to `{}`)
        #[arg(long)]
        payload: Option<String>,
        #[arg(long, default_value = "cli")]
        origin: String,
        #[arg(long)]
        correlation_id: Option<String>,
    },
    /// Query persisted events
    Query {
        /// Subject pattern (supports `*`/`>` wildcards), e.g. hub.demo.workflow.>
        #[arg(long)]
        subject: Option<String>,
        #[arg(long)]
        correlation_id: Option<String>,
        #[arg(long, default_value_t = DEFAULT_QUERY_LIMIT)]
        limit: i64,
    },
}

pub async fn run_event_command(command: EventCommands, events: &Arc<EventService>) -> Result<()> {
    match command {
        EventCommands::Publish { subject, payload, origin, correlation_id } => {
            cmd_publish(events, &subject, payload.as_deref(), &origin, correlation_id.as_deref()).await
        }
        EventCommands::Query { subject, correlation_id, limit } => {
            cmd_query(events, subject.as_deref(), correlation_id.as_deref(), limit).await
        }
    }
}

async fn cmd_publish(
    events: &Arc<EventService>,
    subject: &str,
    payload: Option<&str>,
    origin: &str,
    correlation_id: Option<&str>,
) -> Result<()> {
    let payload: serde_json::Value = match payload {
        Some(raw) => serde_json::from_str(raw).context("--payload must be valid JSON")?,
        None => serde_json::json!({}),
    };
    let correlation_id = correlation_id
        .map(|raw| raw.parse::<Uuid>())
        .transpose()
        .context("invalid correlation ID")?;

    let id = events.publish(subject, &payload, origin, correlation_id).await?;

    println!("Event published.");
    println!("  ID:      {id}");
    println!("  Subject: {subject}");

    Ok(())
}

async fn cmd_query(
    events: &Arc<EventService>,
    subject: Option<&str>,
    correlation_id: Option<&str>,
    limit: i64,
) -> Result<()> {
    let correlation_id = correlation_id
        .map(|raw| raw.parse::<Uuid>())
        .transpose()
        .context("invalid correlation ID")?;

    let filter = EventFilter {
        subject_like: subject.map(pattern_to_like),
        correlation_id,
        since: None,
        until: None,
        after: None,
        limit,
    };

    let rows = events.query(&filter).await?;

    if rows.is_empty() {
        println!("No events matched.");
        return Ok(());
    }

    println!("{:<36}  {:<32}  TIMESTAMP", "ID", "SUBJECT");
    for e in &rows {
        println!("{:<36}  {:<32}  {}", e.id, e.subject, e.timestamp.format("%Y-%m-%d %H:%M:%S UTC"));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_subject_translates_to_like_pattern() {
        assert_eq!(pattern_to_like("hub.demo.workflow.>"), "hub.demo.workflow.%");
    }

    #[test]
    fn default_limit_is_positive() {
        assert!(DEFAULT_QUERY_LIMIT > 0);
    }
}
