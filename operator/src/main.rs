use anyhow::{Context, Result};
use clap::Parser;

mod args;
mod sessions;
mod util;

#[tokio::main]
pub async fn main() -> Result<()> {
    corral_common::init();
    let cli = args::Cli::parse();
    match cli.command {
        args::Commands::Controller(controller_args) => run_controller(controller_args).await,
    }
}

async fn run_controller(controller_args: args::ControllerArgs) -> Result<()> {
    #[cfg(feature = "metrics")]
    util::metrics::maybe_spawn_metrics_server();

    let client = kube::Client::try_default()
        .await
        .context("Failed to build cluster client")?;
    sessions::reconcile::run(client, controller_args)
        .await
        .context("Session controller failed")?;
    Ok(())
}
