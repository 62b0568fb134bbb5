//! Layered configuration for the watcher and its front ends.
//!
//! Sources, later ones winning:
//! - Built-in defaults
//! - Global file: `<config dir>/treewatch/settings.toml`
//! - Workspace file: `.treewatch/settings.toml` in the current directory or
//!   the nearest ancestor that has one
//! - Environment variables
//!
//! # Environment Variables
//!
//! Environment variables must be prefixed with `TW_` and use double
//! underscores to separate nested levels:
//! - `TW_WATCHER__RECURSIVE=true` sets `watcher.recursive`
//! - `TW_WATCHER__EVENTS=[CREATE,DELETE]` sets `watcher.events`
//! - `TW_LOGGING__DEFAULT=debug` sets `logging.default`

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::watcher::EventMask;

const CONFIG_DIR: &str = ".treewatch";
const CONFIG_FILE: &str = "settings.toml";
const ENV_PREFIX: &str = "TW_";

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct Settings {
    /// Version of the configuration schema
    #[serde(default = "default_version")]
    pub version: u32,

    /// Directory holding `.treewatch`, detected on load
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workspace_root: Option<PathBuf>,

    /// Defaults for new watches
    #[serde(default)]
    pub watcher: WatcherConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct WatcherConfig {
    /// Watch subdirectories, including ones created later
    #[serde(default = "default_false")]
    pub recursive: bool,

    /// Event names to deliver; `ALL` selects every kind
    #[serde(default = "default_events")]
    pub events: Vec<String>,

    /// Descend into symlinked directories during tree walks
    #[serde(default = "default_false")]
    pub follow_symlinks: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    /// Level for every target without an override
    #[serde(default = "default_log_level")]
    pub default: String,

    /// Per-target overrides, e.g. `registry = "debug"`
    #[serde(default)]
    pub modules: HashMap<String, String>,
}

fn default_version() -> u32 {
    1
}
fn default_false() -> bool {
    false
}
fn default_events() -> Vec<String> {
    vec!["ALL".to_string()]
}
fn default_log_level() -> String {
    "warn".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: default_version(),
            workspace_root: None,
            watcher: WatcherConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            recursive: false,
            events: default_events(),
            follow_symlinks: false,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            default: default_log_level(),
            modules: HashMap::new(),
        }
    }
}

impl WatcherConfig {
    /// Resolve `events` into a mask.
    pub fn event_mask(&self) -> Result<EventMask, String> {
        EventMask::from_names(self.events.iter().map(String::as_str))
    }
}

impl Settings {
    /// Load configuration from all sources
    pub fn load() -> Result<Self, Box<figment::Error>> {
        let config_path = Self::find_workspace_config()
            .unwrap_or_else(|| PathBuf::from(CONFIG_DIR).join(CONFIG_FILE));

        let mut figment = Figment::new().merge(Serialized::defaults(Settings::default()));
        if let Some(global) = Self::global_config_path() {
            figment = figment.merge(Toml::file(global));
        }

        Self::finish(figment.merge(Toml::file(config_path))).map(|mut settings| {
            if settings.workspace_root.is_none() {
                settings.workspace_root = Self::workspace_root();
            }
            settings
        })
    }

    /// Load configuration from a specific file, still honouring environment
    /// overrides
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, Box<figment::Error>> {
        Self::finish(
            Figment::new()
                .merge(Serialized::defaults(Settings::default()))
                .merge(Toml::file(path.as_ref())),
        )
    }

    fn finish(figment: Figment) -> Result<Self, Box<figment::Error>> {
        let settings: Settings = figment
            // Double underscore separates nested levels, single underscore
            // stays inside field names
            .merge(Env::prefixed(ENV_PREFIX).map(|key| {
                key.as_str().to_lowercase().replace("__", ".").into()
            }))
            .extract()
            .map_err(Box::new)?;

        settings
            .watcher
            .event_mask()
            .map_err(|e| Box::new(figment::Error::from(format!("watcher.events: {e}"))))?;
        Ok(settings)
    }

    /// Per-user settings file, if the platform has a config directory.
    pub fn global_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("treewatch").join(CONFIG_FILE))
    }

    /// Find the nearest `.treewatch/settings.toml` from the current directory
    /// upwards
    fn find_workspace_config() -> Option<PathBuf> {
        Self::workspace_root().map(|root| root.join(CONFIG_DIR).join(CONFIG_FILE))
    }

    /// Get the workspace root directory (where .treewatch is located)
    pub fn workspace_root() -> Option<PathBuf> {
        let current = std::env::current_dir().ok()?;
        current
            .ancestors()
            .find(|ancestor| ancestor.join(CONFIG_DIR).is_dir())
            .map(Path::to_path_buf)
    }

    /// Save current configuration to file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), Box<dyn std::error::Error>> {
        let parent = path.as_ref().parent().ok_or("Invalid path")?;
        std::fs::create_dir_all(parent)?;

        let toml_string = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_string)?;

        Ok(())
    }

    /// Write default settings to `dir/.treewatch/settings.toml`
    pub fn init_config_file(dir: &Path, force: bool) -> Result<PathBuf, Box<dyn std::error::Error>> {
        let config_path = dir.join(CONFIG_DIR).join(CONFIG_FILE);

        if !force && config_path.exists() {
            return Err("Configuration file already exists. Use --force to overwrite".into());
        }

        Settings::default().save(&config_path)?;
        Ok(config_path)
    }
}
