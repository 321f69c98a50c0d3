//! Operator-mode CLI handlers for `hub federation` subcommands.

use anyhow::{Context, Result};
use clap::Subcommand;
use sqlx::PgPool;

use hub_core::federation;
use hub_db::models::FederationStatus;

#[derive(Subcommand)]
pub enum FederationCommands {
    /// Register or update a child Hub in the federation catalog
    Register {
        slug: String,
        name: String,
        hub_url: String,
        mesh_namespace: String,
        /// Repeatable tag
        #[arg(long = "tag")]
        tags: Vec<String>,
    },
    /// List federation catalog entries
    List {
        /// Filter by status: online, offline, degraded
        #[arg(long)]
        status: Option<String>,
    },
    /// Show a single federation catalog entry
    Get { slug: String },
}

pub async fn run_federation_command(command: FederationCommands, pool: &PgPool) -> Result<()> {
    match command {
        FederationCommands::Register { slug, name, hub_url, mesh_namespace, tags } => {
            cmd_register(pool, &slug, &name, &hub_url, &mesh_namespace, tags).await
        }
        FederationCommands::List { status } => cmd_list(pool, status.as_deref()).await,
        FederationCommands::Get { slug } => cmd_get(pool, &slug).await,
    }
}

async fn cmd_register(
    pool: &PgPool,
    slug: &str,
    name: &str,
    hub_url: &str,
    mesh_namespace: &str,
    tags: Vec<String>,
) -> Result<()> {
    let project = federation::register(pool, slug, name, hub_url, mesh_namespace, &tags).await?;

    println!("Federation project registered.");
    println!("  Slug:           {}", project.slug);
    println!("  Name:           {}", project.name);
    println!("  Hub URL:        {}", project.hub_url);
    println!("  Mesh namespace: {}", project.mesh_namespace);
    println!("  Status:         {}", project.status);

    Ok(())
}

async fn cmd_list(pool: &PgPool, status: Option<&str>) -> Result<()> {
    let status: Option<FederationStatus> = status
        .map(|raw| raw.parse())
        .transpose()
        .with_context(|| format!("invalid status: {:?}", status))?;

    let projects = federation::list(pool, status).await?;

    if projects.is_empty() {
        println!("No federation projects found.");
        return Ok(());
    }

    println!("{:<24}  {:<10}  NAME", "SLUG", "STATUS");
    for p in &projects {
        println!("{:<24}  {:<10}  {}", p.slug, p.status.to_string(), p.name);
    }

    Ok(())
}

async fn cmd_get(pool: &PgPool, slug: &str) -> Result<()> {
    let project = federation::get(pool, slug)
        .await?
        .with_context(|| format!("federation project {slug:?} not found"))?;

    println!("Federation project: {}", project.name);
    println!("  Slug:           {}", project.slug);
    println!("  Hub URL:        {}", project.hub_url);
    println!("  Mesh namespace: {}", project.mesh_namespace);
    println!("  Tags:           {}", project.tags.join(", "));
    println!("  Status:         {}", project.status);
    if let Some(hb) = project.last_heartbeat_at {
        println!("  Last heartbeat: {}", hb.format("%Y-%m-%d %H:%M:%S UTC"));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_strings_parse() {
        assert_eq!("online".parse::<FederationStatus>().unwrap(), FederationStatus::Online);
        assert!("bogus".parse::<FederationStatus>().is_err());
    }
}
