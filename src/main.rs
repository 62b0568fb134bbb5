use std::path::Path;

use clap::Parser;
use treewatch::Settings;
use treewatch::cli::commands::{events, init, watch};
use treewatch::cli::{Cli, Commands};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Init works without a loadable configuration
    if let Commands::Init { force } = cli.command {
        return init::run_init(Path::new("."), force);
    }

    let settings = match &cli.config {
        Some(path) => Settings::load_from(path),
        None => Settings::load(),
    };
    let settings = match settings {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Configuration error: {e}");
            std::process::exit(1);
        }
    };

    treewatch::logging::init_with_config(&settings.logging);
    treewatch::debug_event!("cli", "settings loaded", "{:?}", settings.workspace_root);

    match cli.command {
        Commands::Watch {
            paths,
            recursive,
            events,
            json,
            verbose,
        } => {
            let args = watch::WatchArgs {
                paths,
                recursive,
                events,
                json,
                verbose,
            };
            watch::run_watch(&settings, args).await?;
        }
        Commands::Events => events::run_events(),
        Commands::Config => init::run_config(&settings)?,
        Commands::Init { .. } => {}
    }

    Ok(())
}
