use anyhow::Result;
use cw_cli::{Cli, Commands, Parser};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Watch(args) => args.run().await,
        Commands::Claim(args) => args.run().await,
        Commands::Assign(args) => args.run().await,
        Commands::Complete(args) => args.run().await,
        Commands::Suggestions { subcommand } => subcommand.run().await,
    }
}
