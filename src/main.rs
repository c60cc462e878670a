//! vmshim CLI entry point.

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod cli;

/// vmshim - hypervisor host agent shim
#[derive(Parser, Debug)]
#[command(name = "vmshim")]
#[command(about = "Translate orchestrator commands into hypervisor calls")]
#[command(version)]
struct Cli {
    /// Config file (default: $VMSHIM_CONFIG, then the user config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Execute one command and print its answer as JSON.
    Exec(cli::exec::ExecCmd),

    /// List supported command names.
    Commands(cli::commands::CommandsCmd),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

fn main() {
    let cli = Cli::parse();

    // Initialize logging based on RUST_LOG or default to info
    init_logging(cli.log_format);

    tracing::debug!(version = vmshim::VERSION, "starting vmshim");

    let result = match cli.command {
        Commands::Exec(cmd) => cmd.run(cli.config.as_deref()),
        Commands::Commands(cmd) => cmd.run(),
    };

    if let Err(e) = result {
        tracing::error!(error = %e, "command failed");
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

/// Initialize the tracing subscriber. Logs go to stderr; stdout is reserved
/// for answers.
fn init_logging(format: LogFormat) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("vmshim=info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}
