mod config;
mod plan_cmds;
mod replay_cmd;
mod status_cmd;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};

use plansmith_core::store::PgPlanStore;
use plansmith_core::{EngineConfig, TellStage};
use plansmith_db::config::DbConfig;
use plansmith_db::pool;

use config::PlansmithConfig;
use replay_cmd::ReplayOptions;

#[derive(Parser)]
#[command(name = "plansmith", about = "Stream model replies into per-path file builds")]
struct Cli {
    /// Database URL (overrides PLANSMITH_DATABASE_URL env var)
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Write a plansmith config file (no database required)
    Init {
        /// PostgreSQL connection URL
        #[arg(long, default_value = DbConfig::DEFAULT_URL)]
        db_url: String,
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
    /// Create and migrate the plansmith database
    DbInit,
    /// Plan management
    Plan {
        #[command(subcommand)]
        command: PlanCommands,
    },
    /// Load files and notes into a plan branch
    Context {
        #[command(subcommand)]
        command: ContextCommands,
    },
    /// Implementation-stage subtasks
    Subtask {
        #[command(subcommand)]
        command: SubtaskCommands,
    },
    /// Stream a recorded model reply through the engine
    Replay {
        /// File holding the reply text
        reply_file: PathBuf,
        /// Plan ID to replay against (not needed with --dry-run)
        #[arg(long)]
        plan: Option<String>,
        #[arg(long, default_value = "main")]
        branch: String,
        /// Prompt recorded as the user message
        #[arg(long, default_value = "")]
        prompt: String,
        #[arg(long, value_enum, default_value_t = StageArg::Planning)]
        stage: StageArg,
        /// Characters per streamed chunk
        #[arg(long, default_value_t = 64)]
        chunk_size: usize,
        /// Store the reply without building it
        #[arg(long)]
        no_build: bool,
        /// Replay against an in-memory plan and print the resulting files
        #[arg(long)]
        dry_run: bool,
        /// Files to load as context for a dry run
        #[arg(long = "context", requires = "dry_run")]
        context_files: Vec<PathBuf>,
        /// Print stream messages as JSON lines
        #[arg(long)]
        json: bool,
    },
    /// Build stored replies that have not been built yet
    Build {
        plan_id: String,
        #[arg(long, default_value = "main")]
        branch: String,
    },
    /// Show plan status (omit plan_id to list all plans)
    Status {
        plan_id: Option<String>,
        #[arg(long, default_value = "main")]
        branch: String,
    },
    /// List built files, or the result history of one path
    Files {
        plan_id: String,
        #[arg(long, default_value = "main")]
        branch: String,
        /// Show every result recorded for this path
        #[arg(long)]
        path: Option<String>,
    },
    /// Accept every pending file result on a branch
    Apply {
        plan_id: String,
        #[arg(long, default_value = "main")]
        branch: String,
    },
    /// Reject the pending results of one path
    Reject {
        plan_id: String,
        path: String,
        #[arg(long, default_value = "main")]
        branch: String,
    },
}

#[derive(Subcommand)]
pub enum PlanCommands {
    /// Create a plan with an initial branch
    Create {
        name: String,
        #[arg(long, default_value = ".")]
        project_path: String,
        #[arg(long, default_value = "main")]
        branch: String,
    },
    /// List all plans
    List,
}

#[derive(Subcommand)]
pub enum ContextCommands {
    /// Add files (and optionally a note) to a plan branch
    Add {
        plan_id: String,
        files: Vec<PathBuf>,
        #[arg(long, default_value = "main")]
        branch: String,
        #[arg(long)]
        note: Option<String>,
    },
    /// List the context loaded into a plan branch
    List {
        plan_id: String,
        #[arg(long, default_value = "main")]
        branch: String,
    },
}

#[derive(Subcommand)]
pub enum SubtaskCommands {
    /// Append a subtask to a plan branch
    Add {
        plan_id: String,
        title: String,
        #[arg(long)]
        description: Option<String>,
        /// Comma-separated paths the subtask works on
        #[arg(long, value_delimiter = ',')]
        files: Vec<String>,
        #[arg(long, default_value = "main")]
        branch: String,
    },
    /// List subtasks in order
    List {
        plan_id: String,
        #[arg(long, default_value = "main")]
        branch: String,
    },
    /// Mark a subtask finished
    Finish { subtask_id: String },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum StageArg {
    Context,
    Planning,
    Implementation,
}

impl From<StageArg> for TellStage {
    fn from(stage: StageArg) -> Self {
        match stage {
            StageArg::Context => TellStage::Context,
            StageArg::Planning => TellStage::Planning,
            StageArg::Implementation => TellStage::Implementation,
        }
    }
}

/// Execute the `plansmith init` command: write config file.
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
            url: db_url.to_string(),
        },
        engine: EngineConfig::default(),
    };
    config::save_config(&path, &cfg)?;

    println!("Config written to {}", path.display());
    println!("  database.url = {db_url}");
    println!();
    println!("Next: run `plansmith db-init` to create and migrate the database.");

    Ok(())
}

/// Execute the `plansmith db-init` command: create database and run migrations.
async fn cmd_db_init(cli_db_url: Option<&str>) -> anyhow::Result<()> {
    let resolved = PlansmithConfig::resolve(cli_db_url)?;

    println!("Initializing plansmith database...");
    if pool::ensure_database_exists(&resolved.db_config).await? {
        println!("Created database {}.", resolved.db_config.database_url);
    }
    let db_pool = pool::create_pool(&resolved.db_config).await?;
    let result = pool::run_migrations(&db_pool).await;
    db_pool.close().await;
    result?;

    println!("plansmith db-init complete.");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init { db_url, force } => {
            cmd_init(&db_url, force)?;
        }
        Commands::DbInit => {
            cmd_db_init(cli.database_url.as_deref()).await?;
        }
        Commands::Plan { command } => {
            let resolved = PlansmithConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let result = plan_cmds::run_plan_command(command, &db_pool).await;
            db_pool.close().await;
            result?;
        }
        Commands::Context { command } => {
            let resolved = PlansmithConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let result = plan_cmds::run_context_command(command, &db_pool).await;
            db_pool.close().await;
            result?;
        }
        Commands::Subtask { command } => {
            let resolved = PlansmithConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let result = plan_cmds::run_subtask_command(command, &db_pool).await;
            db_pool.close().await;
            result?;
        }
        Commands::Replay {
            reply_file,
            plan,
            branch,
            prompt,
            stage,
            chunk_size,
            no_build,
            dry_run,
            context_files,
            json,
        } => {
            let resolved = PlansmithConfig::resolve(cli.database_url.as_deref())?;
            let opts = ReplayOptions {
                branch,
                prompt,
                stage: stage.into(),
                chunk_size,
                auto_build: !no_build,
                json,
            };
            if dry_run {
                replay_cmd::run_dry_run(&reply_file, &context_files, &opts, resolved.engine).await?;
            } else {
                let plan_id = replay_cmd::require_plan_id(plan.as_deref())?;
                let db_pool = pool::create_pool(&resolved.db_config).await?;
                let store = Arc::new(PgPlanStore::new(db_pool.clone()));
                let result =
                    replay_cmd::run_replay(store, plan_id, &reply_file, &opts, resolved.engine)
                        .await;
                db_pool.close().await;
                let outcome = result?;
                if !opts.json {
                    replay_cmd::print_outcome(&outcome);
                }
            }
        }
        Commands::Build { plan_id, branch } => {
            let resolved = PlansmithConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let result = status_cmd::run_build(&db_pool, &plan_id, &branch, &resolved.engine).await;
            db_pool.close().await;
            result?;
        }
        Commands::Status { plan_id, branch } => {
            let resolved = PlansmithConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let result = status_cmd::run_status(&db_pool, plan_id.as_deref(), &branch).await;
            db_pool.close().await;
            result?;
        }
        Commands::Files {
            plan_id,
            branch,
            path,
        } => {
            let resolved = PlansmithConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let result = status_cmd::run_files(&db_pool, &plan_id, &branch, path.as_deref()).await;
            db_pool.close().await;
            result?;
        }
        Commands::Apply { plan_id, branch } => {
            let resolved = PlansmithConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let result = status_cmd::run_apply(&db_pool, &plan_id, &branch).await;
            db_pool.close().await;
            result?;
        }
        Commands::Reject {
            plan_id,
            path,
            branch,
        } => {
            let resolved = PlansmithConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let result = status_cmd::run_reject(&db_pool, &plan_id, &branch, &path).await;
            db_pool.close().await;
            result?;
        }
    }

    Ok(())
}
