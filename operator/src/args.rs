use clap::{Parser, Subcommand};

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Commands {
    Controller(ControllerArgs),
}

#[derive(Debug, Clone, clap::Args)]
pub struct ControllerArgs {
    /// Provider application config, needed to resolve and stamp
    /// session credentials at worker start.
    #[command(flatten)]
    pub providers: corral_common::args::ProviderArgs,

    /// Image the worker pods run
    #[arg(
        long,
        env = "WORKER_IMAGE",
        default_value = "ghcr.io/corral-dev/agent-runner:latest"
    )]
    pub worker_image: String,

    /// In-cluster URL workers use to reach the gateway's credential
    /// broker
    #[arg(
        long,
        env = "GATEWAY_INTERNAL_URL",
        default_value = "http://corral-gateway.corral-system.svc:8081"
    )]
    pub gateway_url: String,

    /// Optional cap on WaitingForApproval, e.g. "48h". Absent means
    /// suspended sessions wait until cancelled.
    #[arg(long, env = "APPROVAL_TIMEOUT")]
    pub approval_timeout: Option<String>,
}
