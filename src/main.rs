use clap::Parser;
use tracing::error;

use tradebars::cli::{Cli, Commands};
use tradebars::commands;
use tradebars::config::Config;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "invalid configuration");
            std::process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Serve { port } => commands::serve::run(config, port).await,
        Commands::Status => commands::status::run(config).await,
    };

    if let Err(err) = result {
        error!(error = %err, "fatal");
        std::process::exit(1);
    }
}
