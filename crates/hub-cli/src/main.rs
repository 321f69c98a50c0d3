mod agent_cmds;
mod approval_cmds;
mod config;
mod event_cmds;
mod federation_cmds;
mod project_cmds;
mod serve_cmd;
#[cfg(test)]
mod test_util;
mod workflow_cmds;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use sqlx::PgPool;

use hub_core::driver::{create_driver, ContainerDriver};
use hub_core::events::EventService;
use hub_core::federation;
use hub_core::project::{ProjectLocks, ProjectOrchestrator};
use hub_core::workflow::WorkflowEngine;
use hub_db::pool;

use config::HubConfig;
pub use project_cmds::ProjectCommands;
pub use workflow_cmds::WorkflowCommands;
pub use agent_cmds::AgentCommands;
pub use approval_cmds::ApprovalCommands;
pub use event_cmds::EventCommands;
pub use federation_cmds::FederationCommands;

#[derive(Parser)]
#[command(name = "hub", about = "Project lifecycle + DAG workflow orchestration control plane")]
struct Cli {
    /// Database URL (overrides HUB_DATABASE_URL env var)
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a hub config file (no database required)
    Init {
        /// PostgreSQL connection URL
        #[arg(long, default_value = "postgresql://localhost:5432/hub")]
        db_url: String,
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
    /// Initialize the hub database (requires config file or env vars)
    DbInit,
    /// Project lifecycle management
    Project {
        #[command(subcommand)]
        command: ProjectCommands,
    },
    /// Workflow definitions and runs
    Workflow {
        #[command(subcommand)]
        command: WorkflowCommands,
    },
    /// Agent registry
    Agent {
        #[command(subcommand)]
        command: AgentCommands,
    },
    /// Approval gate decisions
    Approval {
        #[command(subcommand)]
        command: ApprovalCommands,
    },
    /// Event bus publish/query
    Event {
        #[command(subcommand)]
        command: EventCommands,
    },
    /// Federation catalog of child Hubs
    Federation {
        #[command(subcommand)]
        command: FederationCommands,
    },
    /// Run the Control-Plane HTTP/WebSocket API
    Serve {
        /// Address to bind
        #[arg(long, default_value = "0.0.0.0")]
        bind: String,
        /// Port to listen on
        #[arg(long, default_value_t = 8080)]
        port: u16,
    },
}

/// Execute the `hub init` command: write config file.
fn cmd_init(db_url: &str, force: bool) -> anyhow::Result<()> {
    let path = config::config_path();

    if path.exists() && !force {
        anyhow::bail!(
            "config file already exists at {}\nUse --force to overwrite.",
            path.display()
        );
    }

    let cfg = config::ConfigFile {
        database: config::DatabaseSection {
            url: Some(db_url.to_string()),
        },
        ..Default::default()
    };

    config::save_config(&cfg)?;

    println!("Config written to {}", path.display());
    println!("  database.url = {db_url}");
    println!();
    println!("Next: run `hub db-init` to create and migrate the database.");

    Ok(())
}

/// Execute the `hub db-init` command: create database and run migrations.
async fn cmd_db_init(cli_db_url: Option<&str>) -> anyhow::Result<()> {
    let resolved = HubConfig::resolve(cli_db_url)?;

    println!("Initializing hub database...");

    // 1. Create the database if it does not exist.
    pool::ensure_database_exists(&resolved.db_config).await?;

    // 2. Connect to the target database.
    let db_pool = pool::create_pool(&resolved.db_config).await?;

    // 3. Run migrations.
    pool::run_migrations(&db_pool).await?;

    // 4. Print success with table counts.
    let counts = pool::table_counts(&db_pool).await?;
    println!("Database ready. Tables:");
    for (table, count) in &counts {
        println!("  {table}: {count} rows");
    }

    // 5. Clean shutdown.
    db_pool.close().await;

    println!("hub db-init complete.");
    Ok(())
}

/// Build the driver, event service, project orchestrator, and workflow
/// engine shared by commands that drive orchestration rather than plain
/// CRUD, and by `serve`.
async fn build_runtime(
    pool: PgPool,
    resolved: &HubConfig,
) -> anyhow::Result<(Arc<dyn ContainerDriver>, Arc<EventService>, Arc<ProjectOrchestrator>, Arc<WorkflowEngine>)> {
    let compose_root: PathBuf = std::env::current_dir().context("failed to get current directory")?;
    let driver = create_driver(&resolved.container_driver, &compose_root)
        .context("failed to construct container driver")?;

    let events = Arc::new(
        EventService::connect(pool.clone(), &resolved.bus_url)
            .await
            .context("failed to connect to event bus")?,
    );

    let locks = Arc::new(ProjectLocks::new());
    let orchestrator = Arc::new(ProjectOrchestrator::new(
        Arc::clone(&driver),
        locks,
        resolved.port_ranges.clone(),
        Arc::clone(&events),
    ));

    let engine = WorkflowEngine::new(pool, Arc::clone(&driver), Arc::clone(&events), resolved.worker_tokens);

    Ok((driver, events, orchestrator, engine))
}

/// At startup, reset node runs an earlier crashed process left RUNNING or
/// READY for every still-in-flight workflow run, so the scheduler's
/// readiness query picks them back up through the normal retry path.
async fn recover_in_flight_runs(pool: &PgPool) -> anyhow::Result<()> {
    let runs = hub_db::queries::workflow_runs::list_in_flight_runs(pool).await?;
    for run in &runs {
        let reset = hub_db::queries::node_runs::reset_orphaned_node_runs(pool, run.id).await?;
        if !reset.is_empty() {
            tracing::warn!(run_id = %run.id, count = reset.len(), "reset orphaned node runs on restart");
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init { db_url, force } => {
            cmd_init(&db_url, force)?;
        }
        Commands::DbInit => {
            cmd_db_init(cli.database_url.as_deref()).await?;
        }
        Commands::Project { command } => {
            let resolved = HubConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let result = if project_cmds::requires_orchestrator(&command) {
                let (_, _, orchestrator, _) = build_runtime(db_pool.clone(), &resolved).await?;
                project_cmds::run_project_command(command, &db_pool, Some(&orchestrator)).await
            } else {
                project_cmds::run_project_command(command, &db_pool, None).await
            };
            db_pool.close().await;
            result?;
        }
        Commands::Workflow { command } => {
            let resolved = HubConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let result = if workflow_cmds::requires_engine(&command) {
                let (_, _, _, engine) = build_runtime(db_pool.clone(), &resolved).await?;
                workflow_cmds::run_workflow_command(command, &db_pool, Some(&engine)).await
            } else {
                workflow_cmds::run_workflow_command(command, &db_pool, None).await
            };
            db_pool.close().await;
            result?;
        }
        Commands::Agent { command } => {
            let resolved = HubConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let result = agent_cmds::run_agent_command(command, &db_pool).await;
            db_pool.close().await;
            result?;
        }
        Commands::Approval { command } => {
            let resolved = HubConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let events = Arc::new(EventService::connect(db_pool.clone(), &resolved.bus_url).await?);
            let result = approval_cmds::run_approval_command(command, &db_pool, &events).await;
            db_pool.close().await;
            result?;
        }
        Commands::Event { command } => {
            let resolved = HubConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let events = Arc::new(EventService::connect(db_pool.clone(), &resolved.bus_url).await?);
            let result = event_cmds::run_event_command(command, &events).await;
            db_pool.close().await;
            result?;
        }
        Commands::Federation { command } => {
            let resolved = HubConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let result = federation_cmds::run_federation_command(command, &db_pool).await;
            db_pool.close().await;
            result?;
        }
        Commands::Serve { bind, port } => {
            let resolved = HubConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;

            recover_in_flight_runs(&db_pool)
                .await
                .context("failed to recover in-flight workflow runs")?;

            let (driver, events, orchestrator, engine) = build_runtime(db_pool.clone(), &resolved).await?;

            let sweeper_pool = db_pool.clone();
            let sweeper_events = EventService::connect(db_pool.clone(), &resolved.bus_url).await?;
            let stale_threshold = std::time::Duration::from_secs(resolved.stale_threshold_seconds);
            let stale_interval = std::time::Duration::from_secs(resolved.stale_check_interval_seconds);
            tokio::spawn(async move {
                federation::run_staleness_sweeper(sweeper_pool, sweeper_events, stale_interval, stale_threshold).await;
            });

            let republisher_pool = db_pool.clone();
            let republisher_events = EventService::connect(db_pool.clone(), &resolved.bus_url).await?;
            tokio::spawn(async move {
                hub_core::events::republisher::run(republisher_pool, republisher_events).await;
            });

            let state = serve_cmd::AppState {
                pool: db_pool.clone(),
                driver,
                events,
                orchestrator,
                engine,
                config: Arc::new(resolved),
            };

            let result = serve_cmd::run_serve(state, &bind, port).await;
            db_pool.close().await;
            result?;
        }
    }

    Ok(())
}
