use clap::Parser;
use sweeprun::cli::{self, Cli};
use tracing::error;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("sweeprun=info")),
        )
        .init();

    let cli = Cli::parse();
    if let Err(err) = cli::run(cli).await {
        error!("{:#}", err);
        std::process::exit(1);
    }
}
