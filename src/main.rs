//! benchyard daemon entry point.

use anyhow::Result;
use clap::Parser;
use tracing::error;

use benchyard::cmd::{self, Commands};
use benchyard::config::Configuration;

#[derive(Parser)]
#[command(name = "benchyard")]
#[command(about = "Distributed benchmark runner daemon")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

fn init_logging(debug: bool) {
    let log_level = if debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("benchyard={log_level}").into()),
        )
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.debug);

    let config = Configuration::load_or_default(&cli.config)?;

    match cli.command {
        Commands::Run(args) => {
            if let Err(e) = cmd::run::execute(args, &config) {
                error!("runner error: {e}");
                std::process::exit(1);
            }
            Ok(())
        }
        Commands::Serve => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(async {
                if let Err(e) = cmd::serve::execute(config).await {
                    error!("server error: {e}");
                    std::process::exit(1);
                }
            });
            Ok(())
        }
    }
}
