//! compat-suite CLI - host-side compatibility suite harness.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing::{Level, info};
use tracing_subscriber::FmtSubscriber;

use compat_suite::config::{self, Config};
use compat_suite::console::{self, Console, ListTarget, RunArgs};

const DEFAULT_CONFIG: &str = "compat.toml";

#[derive(Parser)]
#[command(name = "compat-suite")]
#[command(about = "Shard compatibility test modules across devices and report results", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path [default: compat.toml if present]
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the interactive console (the default)
    Console,

    /// List modules, previous results or plans
    #[command(alias = "l")]
    List {
        #[command(subcommand)]
        target: ListTarget,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text", global = true)]
        format: String,
    },

    /// Run a test plan
    Run(RunArgs),

    /// Show the suite version
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = load(cli.config.as_deref())?;

    match cli.command.unwrap_or(Commands::Console) {
        Commands::Console => Console::new(config, cli.verbose).run().await,
        Commands::List { target, format } => {
            let json = match format.as_str() {
                "text" => false,
                "json" => true,
                other => bail!("Unknown format '{}', expected text or json", other),
            };
            println!("{}", console::list(&config, target, json)?);
            Ok(())
        }
        Commands::Run(args) => {
            let outcome = console::run_plan(&config, &args, cli.verbose).await?;
            console::print_outcome(&outcome);
            if !outcome.summary.success() {
                std::process::exit(1);
            }
            Ok(())
        }
        Commands::Version => {
            println!("{}", console::version_string(&config));
            Ok(())
        }
    }
}

/// Loads the given config, or `compat.toml` if it exists, or the defaults.
fn load(path: Option<&Path>) -> Result<Config> {
    let path = match path {
        Some(path) => path,
        None if Path::new(DEFAULT_CONFIG).exists() => Path::new(DEFAULT_CONFIG),
        None => {
            info!("No {} found, using defaults", DEFAULT_CONFIG);
            return Ok(Config::default());
        }
    };
    let config = config::load_config(path)
        .with_context(|| format!("Failed to load config from {}", path.display()))?;
    info!("Loaded configuration from {}", path.display());
    Ok(config)
}
