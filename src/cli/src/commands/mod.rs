//! CLI command definitions and dispatch.

mod run;
mod sync;
mod version;

use clap::{Parser, Subcommand};

/// regmirror — mirror container images to registries and buckets.
#[derive(Parser)]
#[command(name = "regmirror", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Subcommand)]
pub enum Command {
    /// Run the sync daemon on the configured interval
    Run(run::RunArgs),
    /// Sync a single image once and exit
    Sync(sync::SyncArgs),
    /// Show version information
    Version(version::VersionArgs),
}

/// Dispatch a parsed CLI to the appropriate command handler.
pub async fn dispatch(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Command::Run(args) => run::execute(args).await,
        Command::Sync(args) => sync::execute(args).await,
        Command::Version(args) => version::execute(args).await,
    }
}

/// Wire ctrl-c to a cancellation token shared with the engine.
pub(crate) fn cancel_on_ctrl_c() -> tokio_util::sync::CancellationToken {
    let cancel = tokio_util::sync::CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Received interrupt, shutting down");
            trigger.cancel();
        }
    });
    cancel
}
