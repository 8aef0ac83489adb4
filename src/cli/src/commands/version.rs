//! `regmirror version` command.

use clap::Args;

#[derive(Args)]
pub struct VersionArgs {
    /// Print only the version number
    #[arg(short, long)]
    pub short: bool,
}

pub async fn execute(args: VersionArgs) -> Result<(), Box<dyn std::error::Error>> {
    if args.short {
        println!("{}", regmirror_core::VERSION);
    } else {
        println!("regmirror {}", regmirror_core::VERSION);
        println!("engine {}", regmirror_engine::VERSION);
    }
    Ok(())
}
