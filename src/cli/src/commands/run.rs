//! `regmirror run` command.

use std::path::PathBuf;

use clap::Args;

use regmirror_core::config::SyncConfig;
use regmirror_engine::SyncEngine;

#[derive(Args)]
pub struct RunArgs {
    /// Path to the configuration file
    #[arg(short, long, default_value = "regmirror.yaml")]
    pub config: PathBuf,

    /// Run a single pass and exit instead of looping
    #[arg(long)]
    pub once: bool,
}

pub async fn execute(args: RunArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = SyncConfig::load(&args.config)?;

    tracing::info!(
        config = %args.config.display(),
        images = config.sync.images.len(),
        "Starting regmirror"
    );

    let cancel = super::cancel_on_ctrl_c();
    let engine = SyncEngine::new(config, cancel);

    if args.once {
        engine.run_once().await?;
    } else {
        engine.run().await?;
    }

    tracing::info!("Shutting down regmirror");
    Ok(())
}
