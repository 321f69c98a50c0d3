//! Operator-mode CLI handlers for `hub project` subcommands.

use anyhow::{Context, Result};
use clap::Subcommand;
use sqlx::PgPool;
use uuid::Uuid;

use hub_core::project::ProjectOrchestrator;
use hub_db::queries::projects as db;

#[derive(Subcommand)]
pub enum ProjectCommands {
    /// Create a project (starts STOPPED; ports are reserved on first Start)
    Create {
        /// Project display name
        name: String,
        /// Filesystem path to the project's checkout
        path: String,
        /// Slug (defaults to a slugified name)
        #[arg(long)]
        slug: Option<String>,
        /// Designated ports as `backend,frontend,db,cache`; if set, `Start`
        /// reserves exactly these ports instead of auto-allocating
        #[arg(long)]
        ports: Option<String>,
    },
    /// List all projects
    List,
    /// Show a single project
    Get {
        /// Project ID
        id: String,
    },
    /// Start a project's stack
    Start {
        /// Project ID
        id: String,
    },
    /// Stop a project's stack
    Stop {
        /// Project ID
        id: String,
    },
    /// Restart a project's stack
    Restart {
        /// Project ID
        id: String,
    },
    /// Delete a stopped project
    Delete {
        /// Project ID
        id: String,
        /// Also remove the project's files from disk
        #[arg(long)]
        delete_files: bool,
    },
}

/// Whether a command needs a container driver/orchestrator, or is plain
/// CRUD against the projects table.
pub fn requires_orchestrator(command: &ProjectCommands) -> bool {
    matches!(
        command,
        ProjectCommands::Start { .. } | ProjectCommands::Stop { .. } | ProjectCommands::Restart { .. } | ProjectCommands::Delete { .. }
    )
}

/// Dispatch a `ProjectCommands` variant to the appropriate handler.
pub async fn run_project_command(
    command: ProjectCommands,
    pool: &PgPool,
    orchestrator: Option<&std::sync::Arc<ProjectOrchestrator>>,
) -> Result<()> {
    match command {
        ProjectCommands::Create { name, path, slug, ports } => {
            cmd_create(pool, &name, &path, slug.as_deref(), ports.as_deref()).await
        }
        ProjectCommands::List => cmd_list(pool).await,
        ProjectCommands::Get { id } => cmd_get(pool, &id).await,
        ProjectCommands::Start { id } => cmd_start(orchestrator.expect("orchestrator required"), pool, &id).await,
        ProjectCommands::Stop { id } => cmd_stop(orchestrator.expect("orchestrator required"), pool, &id).await,
        ProjectCommands::Restart { id } => cmd_restart(orchestrator.expect("orchestrator required"), pool, &id).await,
        ProjectCommands::Delete { id, delete_files } => {
            cmd_delete(orchestrator.expect("orchestrator required"), pool, &id, delete_files).await
        }
    }
}

fn slugify(name: &str) -> String {
    name.trim()
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}

/// Parse `--ports backend,frontend,db,cache` into the four-tuple
/// `insert_project` expects.
fn parse_ports(spec: &str) -> Result<(i32, i32, i32, i32)> {
    let parts: Vec<&str> = spec.split(',').collect();
    anyhow::ensure!(parts.len() == 4, "--ports expects `backend,frontend,db,cache`, got {spec:?}");
    let mut parsed = [0i32; 4];
    for (i, p) in parts.iter().enumerate() {
        parsed[i] = p.trim().parse::<i32>().with_context(|| format!("invalid port {p:?} in --ports"))?;
    }
    Ok((parsed[0], parsed[1], parsed[2], parsed[3]))
}

async fn cmd_create(pool: &PgPool, name: &str, path: &str, slug: Option<&str>, ports: Option<&str>) -> Result<()> {
    let slug = slug.map(str::to_string).unwrap_or_else(|| slugify(name));
    let designated_ports = ports.map(parse_ports).transpose()?;
    let project = db::insert_project(pool, &slug, name, path, designated_ports).await?;

    println!("Project created.");
    println!();
    println!("  ID:     {}", project.id);
    println!("  Slug:   {}", project.slug);
    println!("  Name:   {}", project.name);
    println!("  Path:   {}", project.fs_path);
    println!("  Status: {}", project.status);

    Ok(())
}

async fn cmd_list(pool: &PgPool) -> Result<()> {
    let projects = db::list_projects(pool).await?;

    if projects.is_empty() {
        println!("No projects found. Use `hub project create <name> <path>` to create one.");
        return Ok(());
    }

    let id_w = 36;
    let slug_w = projects.iter().map(|p| p.slug.len()).max().unwrap_or(4).max(4);
    let status_w = 8;

    println!("{:<id_w$}  {:<slug_w$}  {:<status_w$}  NAME", "ID", "SLUG", "STATUS");
    for p in &projects {
        println!("{:<id_w$}  {:<slug_w$}  {:<status_w$}  {}", p.id, p.slug, p.status, p.name);
    }

    Ok(())
}

async fn cmd_get(pool: &PgPool, id_str: &str) -> Result<()> {
    let id: Uuid = id_str.parse().with_context(|| format!("invalid project ID: {:?}", id_str))?;

    let project = db::get_project(pool, id)
        .await?
        .with_context(|| format!("project {id} not found"))?;

    println!("Project: {}", project.name);
    println!("  ID:       {}", project.id);
    println!("  Slug:     {}", project.slug);
    println!("  Status:   {}", project.status);
    println!("  Path:     {}", project.fs_path);
    if let Some(p) = project.backend_port {
        println!("  Backend port:  {p}");
    }
    if let Some(p) = project.frontend_port {
        println!("  Frontend port: {p}");
    }
    if let Some(p) = project.db_port {
        println!("  DB port:       {p}");
    }
    if let Some(p) = project.cache_port {
        println!("  Cache port:    {p}");
    }
    if let (Some(b), Some(f), Some(d), Some(c)) = (
        project.designated_backend_port,
        project.designated_frontend_port,
        project.designated_db_port,
        project.designated_cache_port,
    ) {
        println!("  Designated ports: backend={b} frontend={f} db={d} cache={c}");
    }
    if let Some(err) = &project.last_error {
        println!("  Last error: {err}");
    }
    println!("  Created:  {}", project.created_at.format("%Y-%m-%d %H:%M:%S UTC"));

    Ok(())
}

async fn cmd_start(orchestrator: &std::sync::Arc<ProjectOrchestrator>, pool: &PgPool, id_str: &str) -> Result<()> {
    let id: Uuid = id_str.parse().with_context(|| format!("invalid project ID: {:?}", id_str))?;
    orchestrator.start(pool.clone(), id).await.map_err(|e| anyhow::anyhow!(e))?;
    println!("Start accepted for project {id}. Poll `hub project get {id}` or subscribe to hub.<slug>.project.started.");
    Ok(())
}

async fn cmd_stop(orchestrator: &std::sync::Arc<ProjectOrchestrator>, pool: &PgPool, id_str: &str) -> Result<()> {
    let id: Uuid = id_str.parse().with_context(|| format!("invalid project ID: {:?}", id_str))?;
    orchestrator.stop(pool.clone(), id).await.map_err(|e| anyhow::anyhow!(e))?;
    println!("Stop accepted for project {id}.");
    Ok(())
}

async fn cmd_restart(orchestrator: &std::sync::Arc<ProjectOrchestrator>, pool: &PgPool, id_str: &str) -> Result<()> {
    let id: Uuid = id_str.parse().with_context(|| format!("invalid project ID: {:?}", id_str))?;
    orchestrator.restart(pool.clone(), id).await.map_err(|e| anyhow::anyhow!(e))?;
    println!("Restart accepted for project {id}.");
    Ok(())
}

async fn cmd_delete(orchestrator: &std::sync::Arc<ProjectOrchestrator>, pool: &PgPool, id_str: &str, delete_files: bool) -> Result<()> {
    let id: Uuid = id_str.parse().with_context(|| format!("invalid project ID: {:?}", id_str))?;
    orchestrator.delete(pool, id, delete_files).await.map_err(|e| anyhow::anyhow!(e))?;
    println!("Project {id} deleted.");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_valid_uuid() {
        let id = "550e8400-e29b-41d4-a716-446655440000";
        let parsed: Uuid = id.parse().unwrap();
        assert_eq!(parsed.to_string(), id);
    }

    #[test]
    fn parse_invalid_uuid() {
        let id = "not-a-uuid";
        let result: Result<Uuid, _> = id.parse();
        assert!(result.is_err());
    }

    #[test]
    fn slugify_lowercases_and_hyphenates() {
        assert_eq!(slugify("My Cool Project!"), "my-cool-project");
    }

    #[test]
    fn parse_ports_accepts_four_values() {
        assert_eq!(parse_ports("8010,3010,5442,6389").unwrap(), (8010, 3010, 5442, 6389));
    }

    #[test]
    fn parse_ports_rejects_wrong_arity() {
        assert!(parse_ports("8010,3010").is_err());
    }

    #[test]
    fn parse_ports_rejects_non_numeric() {
        assert!(parse_ports("abc,3010,5442,6389").is_err());
    }
}
