//! `regmirror sync` command: one-shot sync of a single image.

use std::path::PathBuf;

use clap::Args;

use regmirror_core::config::{ImageSyncJob, SyncConfig};
use regmirror_engine::SyncEngine;

#[derive(Args)]
pub struct SyncArgs {
    /// Source image (e.g., "docker.io/library/alpine")
    #[arg(short, long)]
    pub source: String,

    /// Target reference; repeatable
    #[arg(short, long = "target", required = true)]
    pub targets: Vec<String>,

    /// Tag subset to sync; repeatable. Empty means all tags
    #[arg(long = "tag")]
    pub tags: Vec<String>,

    /// Tags re-pushed even when present; repeatable
    #[arg(long = "mutable-tag")]
    pub mutable_tags: Vec<String>,

    /// Delete destination tags absent from source
    #[arg(long)]
    pub purge: bool,

    /// Optional configuration file supplying registry credentials
    #[arg(short, long)]
    pub config: Option<PathBuf>,
}

pub async fn execute(args: SyncArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => SyncConfig::load(path)?,
        None => SyncConfig::default(),
    };

    // The flag-built job replaces any configured job list
    config.sync.images = vec![ImageSyncJob {
        source: args.source,
        targets: args.targets,
        tags: args.tags,
        mutable_tags: args.mutable_tags,
        purge: args.purge,
        ..Default::default()
    }];
    config.validate()?;

    let cancel = super::cancel_on_ctrl_c();
    let engine = SyncEngine::new(config, cancel);
    engine.run_once().await?;

    Ok(())
}
