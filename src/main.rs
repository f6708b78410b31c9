use anyhow::Result;
use clap::Parser;
use mailsync::cli::{Cli, CliHandler};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = cli.load_config()?;

    // RUST_LOG wins over the configured level
    let default_level = if cli.debug { "debug" } else { config.log_level.as_str() };
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(default_level))?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let handler = CliHandler::new(config).await?;
    handler.handle_command(cli.command).await
}
