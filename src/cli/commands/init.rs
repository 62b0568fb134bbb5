//! Settings commands: write a starter file, show the effective settings.

use std::path::Path;

use anyhow::{Context, anyhow};

use crate::config::Settings;

/// Run init command - write default settings under `dir`.
pub fn run_init(dir: &Path, force: bool) -> anyhow::Result<()> {
    let path = Settings::init_config_file(dir, force).map_err(|e| anyhow!("{e}"))?;
    println!("Created configuration file at: {}", path.display());
    println!("Edit this file to set default watch options and log levels.");
    Ok(())
}

/// Settings after every configuration layer, as TOML.
pub fn render_config(settings: &Settings) -> anyhow::Result<String> {
    toml::to_string_pretty(settings).context("rendering settings")
}

/// Run config command.
pub fn run_config(settings: &Settings) -> anyhow::Result<()> {
    print!("{}", render_config(settings)?);
    Ok(())
}
