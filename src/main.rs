use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing::warn;

use billing_automation::config::{AutomationToml, DEFAULT_CONFIG_PATH};
use billing_automation::logging;

mod cmd;

#[derive(Parser)]
#[command(name = "billing-automation")]
#[command(version, about = "End-to-end test orchestration for the billing ingestion pipeline")]
pub struct Cli {
    /// Path to automation.toml
    #[arg(short, long, global = true, env = "AUTOMATION_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the HTTP surface
    Serve {
        /// Port to serve on (overrides server.port)
        #[arg(short, long)]
        port: Option<u16>,

        /// Enable dev mode (permissive CORS, bind all interfaces)
        #[arg(long)]
        dev: bool,
    },
    /// Create the metadata store and its default documents
    InitDb,
    /// Run exactly one manager step
    Step,
    /// Start a new orchestration run
    Create(CreateArgs),
    /// End the write phase of the current run now
    Stop,
    /// Tear down everything back to the default state
    Reset,
    /// Print manager, orchestration and task summary as JSON
    Status,
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Args, Clone, Debug)]
pub struct CreateArgs {
    /// Length of the write phase
    #[arg(long)]
    pub duration_minutes: i64,

    /// Number of synthetic accounts
    #[arg(long)]
    pub dummy_users: i64,

    /// Lower bound of per-account throughput, in thousands of rows per hour
    #[arg(long)]
    pub min_kilo_rows: i64,

    /// Upper bound; defaults to the lower bound
    #[arg(long)]
    pub max_kilo_rows: Option<i64>,
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show effective configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Write a default automation.toml
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let mut config = AutomationToml::load_or_default(&cli.config)
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;
    let env_warnings = config.apply_env_overrides();

    let log_dir = (!config.logging.dir.is_empty()).then(|| PathBuf::from(&config.logging.dir));
    let _guard = logging::init(config.logging.format, log_dir.as_deref(), cli.verbose)?;
    for warning in env_warnings {
        warn!("{}", warning);
    }

    match &cli.command {
        Commands::Serve { port, dev } => cmd::cmd_serve(config, *port, *dev).await?,
        Commands::InitDb => cmd::cmd_init_db(&config).await?,
        Commands::Step => cmd::cmd_step(&config).await?,
        Commands::Create(args) => cmd::cmd_create(&config, args).await?,
        Commands::Stop => cmd::cmd_stop(&config).await?,
        Commands::Reset => cmd::cmd_reset(&config).await?,
        Commands::Status => cmd::cmd_status(&config).await?,
        Commands::Config { command } => cmd::cmd_config(&cli.config, &config, command.clone())?,
    }

    Ok(())
}
