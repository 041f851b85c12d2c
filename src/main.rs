use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "codeloop")]
#[command(version, about = "Plan, edit and auto-fix a project with LLM agents behind an approval gate")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit diagnostic logs as JSON lines on stderr
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Apply proposed changes without asking
    #[arg(long, global = true)]
    pub yes: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// Workspace id to operate on (defaults to the last one created or imported)
    #[arg(short, long, global = true)]
    pub workspace: Option<String>,

    /// Model name. Overrides codeloop.toml and CODELOOP_MODEL.
    #[arg(long, global = true)]
    pub model: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create a workspace from a built-in template
    Init {
        /// Template id: blank, node, python
        #[arg(short, long, default_value = "node")]
        template: String,
        #[arg(short, long)]
        name: Option<String>,
    },
    /// Import a directory of text files as a new workspace
    Import {
        dir: PathBuf,
        #[arg(short, long)]
        name: Option<String>,
    },
    /// Write a workspace's files to a directory
    Export {
        dir: PathBuf,
        /// Workspace id (defaults to the current workspace)
        #[arg(long)]
        id: Option<String>,
    },
    /// List stored workspaces
    Workspaces,
    /// Ask the planner which files a goal should touch
    Plan { goal: String },
    /// Propose a single-pass edit for a goal
    Edit {
        goal: String,
        /// Files the coder may change (repeatable). Planned when omitted.
        #[arg(short, long)]
        focus: Vec<String>,
    },
    /// Edit, run and re-edit until the program runs cleanly
    Fix {
        goal: String,
        #[arg(short, long)]
        focus: Vec<String>,
        /// Iteration budget for this task
        #[arg(long)]
        max_iters: Option<u32>,
        /// Also run discovered test files after a clean entry run
        #[arg(long)]
        test_also: bool,
    },
    /// Run a workspace file in the sandbox
    Exec {
        /// File to run (defaults to the workspace entry)
        entry: Option<String>,
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
    /// Inspect or move task memory
    Memory {
        #[command(subcommand)]
        command: MemoryCommands,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum MemoryCommands {
    /// Show aggregate statistics
    Stats,
    /// Search remembered tasks
    Search {
        query: Option<String>,
        /// success, fail, partial or cancelled
        #[arg(long)]
        outcome: Option<String>,
        /// Match items carrying this tag (repeatable)
        #[arg(long)]
        tag: Vec<String>,
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },
    /// Tasks most similar to a remembered task
    Related {
        id: String,
        #[arg(short, long, default_value = "5")]
        limit: usize,
    },
    /// Write the memory log as JSON (stdout when no file is given)
    Export { output: Option<PathBuf> },
    /// Load a JSON memory export
    Import {
        file: PathBuf,
        /// Replace the log instead of merging into it
        #[arg(long)]
        replace: bool,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Initialize a default codeloop.toml file
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    codeloop::logging::init(cli.verbose, cli.log_json);

    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    match &cli.command {
        Commands::Init { template, name } => {
            cmd::cmd_init(&cli, &project_dir, template, name.as_deref()).await?;
        }
        Commands::Import { dir, name } => {
            cmd::cmd_import(&cli, &project_dir, dir, name.as_deref()).await?;
        }
        Commands::Export { dir, id } => {
            cmd::cmd_export(&cli, &project_dir, dir, id.as_deref()).await?;
        }
        Commands::Workspaces => cmd::cmd_workspaces(&cli, &project_dir).await?,
        Commands::Plan { goal } => cmd::cmd_plan(&cli, &project_dir, goal).await?,
        Commands::Edit { goal, focus } => cmd::cmd_edit(&cli, &project_dir, goal, focus).await?,
        Commands::Fix {
            goal,
            focus,
            max_iters,
            test_also,
        } => {
            cmd::cmd_fix(&cli, &project_dir, goal, focus, *max_iters, *test_also).await?;
        }
        Commands::Exec { entry, timeout_ms } => {
            cmd::cmd_exec(&cli, &project_dir, entry.as_deref(), *timeout_ms).await?;
        }
        Commands::Memory { command } => cmd::cmd_memory(&cli, &project_dir, command.clone())?,
        Commands::Config { command } => cmd::cmd_config(&project_dir, command.clone())?,
    }

    Ok(())
}
