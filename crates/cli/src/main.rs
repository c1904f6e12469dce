//! Meshgate CLI - Main Entry Point
//!
//! Operator interface to the coordinator store: namespaces, machines,
//! sharing and pre-auth keys.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use meshgate_coordinator::{Coordinator, CoordinatorConfig};
use tracing::debug;

use meshgate_cli::commands::{generate, namespaces, nodes, preauthkeys};
use meshgate_cli::output::{self, OutputFormat};

/// Meshgate - mesh VPN coordination server
#[derive(Parser)]
#[command(name = "meshgate")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file
    #[arg(short, long, env = "MESHGATE_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Output format
    #[arg(short, long, default_value = "table", global = true)]
    output: OutputFormat,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage namespaces
    #[command(subcommand)]
    Namespaces(namespaces::NamespaceCommands),

    /// Manage the machines of a namespace
    Nodes(nodes::NodesArgs),

    /// Manage pre-auth keys
    Preauthkeys(preauthkeys::PreAuthKeyArgs),

    /// Generate keys
    #[command(subcommand)]
    Generate(generate::GenerateCommands),

    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let format = cli.output;
    // Store access is blocking SQLite work
    let result = tokio::task::spawn_blocking(move || run(cli)).await?;

    if let Err(err) = result {
        let code = err
            .downcast_ref::<meshgate_common::Error>()
            .map(meshgate_common::Error::exit_code)
            .unwrap_or(1);
        output::print_error(&format!("{:#}", err), format);
        std::process::exit(code);
    }

    Ok(())
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let format = cli.output;

    match cli.command {
        Commands::Generate(cmd) => return generate::execute(cmd, format),
        Commands::Version => {
            println!("Meshgate v{}", meshgate_common::VERSION);
            return Ok(());
        }
        _ => {}
    }

    let config_path = cli
        .config
        .unwrap_or_else(meshgate_common::default_config_path);
    debug!(path = %config_path.display(), "Loading configuration");
    let config = CoordinatorConfig::load(&config_path)?;
    let coordinator = Coordinator::open(&config)?;

    match cli.command {
        Commands::Namespaces(cmd) => namespaces::execute(cmd, &coordinator, format),
        Commands::Nodes(args) => nodes::execute(args, &coordinator, format),
        Commands::Preauthkeys(args) => preauthkeys::execute(args, &coordinator, format),
        Commands::Generate(_) | Commands::Version => Ok(()),
    }
}
