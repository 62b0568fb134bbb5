//! CLI argument parsing using clap.

use clap::{
    Parser, Subcommand,
    builder::styling::{AnsiColor, Effects, Styles},
};
use std::path::PathBuf;

fn clap_cargo_style() -> Styles {
    Styles::styled()
        .header(AnsiColor::Cyan.on_default() | Effects::BOLD)
        .usage(AnsiColor::Cyan.on_default() | Effects::BOLD)
        .literal(AnsiColor::Green.on_default())
        .placeholder(AnsiColor::Green.on_default())
}

/// Recursive filesystem watcher
#[derive(Parser, Debug)]
#[command(
    name = "treewatch",
    version = env!("CARGO_PKG_VERSION"),
    about = "Watch directory trees for changes",
    long_about = "Watch files and directory trees for changes, following new subdirectories as they appear.",
    styles = clap_cargo_style(),
    after_help = "Examples:\n  treewatch watch ./data\n  treewatch watch -r ./src -e CREATE,DELETE\n  treewatch watch -r ./a ./b --json\n  treewatch events"
)]
pub struct Cli {
    /// Path to custom settings.toml file
    #[arg(short, long, global = true, env = "TREEWATCH_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Watch paths and print events until interrupted
    #[command(about = "Watch paths and print events until Ctrl-C")]
    Watch {
        /// Files or directories to watch
        #[arg(value_name = "PATH", required = true)]
        paths: Vec<PathBuf>,

        /// Also watch every subdirectory, including ones created later
        #[arg(short, long)]
        recursive: bool,

        /// Comma separated event names (overrides config), e.g. CREATE,MODIFY
        #[arg(short, long, value_name = "EVENTS")]
        events: Option<String>,

        /// Print each event as a JSON object
        #[arg(long)]
        json: bool,

        /// Show covered directories and the originating path of each event
        #[arg(short, long)]
        verbose: bool,
    },

    /// List event names and their bit values
    #[command(about = "List event names and bit values")]
    Events,

    /// Show current configuration settings
    #[command(about = "Display active settings")]
    Config,

    /// Initialize project
    #[command(about = "Set up .treewatch directory with default configuration")]
    Init {
        /// Force overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },
}
