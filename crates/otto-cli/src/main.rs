mod commands;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "otto", about = "Cron-scheduled AI agent automations")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler until interrupted
    Start {
        /// Tick period in seconds (overrides config)
        #[arg(long)]
        tick_seconds: Option<u64>,
    },
    /// Create an automation
    Add {
        /// Display name
        #[arg(short, long)]
        name: String,

        /// Cron schedule, e.g. "0 9 * * 1"
        #[arg(short, long)]
        schedule: String,

        /// Prompt sent to the agent on each fire
        #[arg(short, long)]
        prompt: String,

        /// Model ID override
        #[arg(long)]
        model: Option<String>,

        /// Orchestrator profile to run under
        #[arg(long)]
        orchestrator: Option<String>,

        /// Run without orchestrator supervision
        #[arg(long)]
        free_agent: bool,

        /// Missed-run policy: ignore, run-once, or run-all
        #[arg(long, default_value = "ignore")]
        policy: String,

        /// Create the automation disabled
        #[arg(long)]
        disabled: bool,
    },
    /// List automations
    List,
    /// Delete an automation and its run history
    Remove { id: String },
    /// Enable an automation
    Enable { id: String },
    /// Disable an automation
    Disable { id: String },
    /// Fire an automation immediately, ignoring its schedule and enabled flag
    RunNow { id: String },
    /// Show an automation's run history
    Runs {
        id: String,

        /// Most recent entries to show
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Check a cron expression against the schedule grammar
    Validate { expression: String },
}

fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Start { tick_seconds } => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(commands::run_start(tick_seconds))?;
        }
        Commands::Add {
            name,
            schedule,
            prompt,
            model,
            orchestrator,
            free_agent,
            policy,
            disabled,
        } => {
            let options = otto_types::DispatchOptions {
                model,
                orchestrator,
                free_agent,
            };
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(commands::run_add(name, schedule, prompt, options, &policy, disabled))?;
        }
        Commands::List => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(commands::run_list())?;
        }
        Commands::Remove { id } => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(commands::run_remove(&id))?;
        }
        Commands::Enable { id } => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(commands::run_set_enabled(&id, true))?;
        }
        Commands::Disable { id } => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(commands::run_set_enabled(&id, false))?;
        }
        Commands::RunNow { id } => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(commands::run_now(&id))?;
        }
        Commands::Runs { id, limit } => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(commands::run_runs(&id, limit))?;
        }
        Commands::Validate { expression } => {
            commands::run_validate(&expression)?;
        }
    }

    Ok(())
}
