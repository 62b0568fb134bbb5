//! Logging set-up and event macros.
//!
//! Compact timestamped output with per-component level configuration.
//! `RUST_LOG` overrides the configured levels at runtime.
//!
//! # Configuration
//!
//! ```toml
//! [logging]
//! default = "warn"    # quiet by default
//!
//! [logging.modules]
//! registry = "debug"  # tree growth and lifecycle
//! router = "trace"
//! ```
//!
//! Short component names resolve to this crate's module targets, so
//! `registry` means `treewatch::watcher::registry`. Fully qualified targets
//! are used as given.
//!
//! # Environment Variable
//!
//! ```bash
//! RUST_LOG=debug treewatch watch -r ./src
//! RUST_LOG=treewatch::watcher=trace treewatch watch ./data
//! ```

use std::sync::Once;
use tracing_subscriber::fmt::time::FormatTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::config::LoggingConfig;

static INIT: Once = Once::new();

/// Modules under `crate::watcher` that emit log lines.
const WATCHER_COMPONENTS: &[&str] = &["node", "primitive", "registry", "router", "service"];

/// Compact time format: HH:MM:SS.mmm
struct CompactTime;

impl FormatTime for CompactTime {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", chrono::Local::now().format("%H:%M:%S%.3f"))
    }
}

/// Map a configured component name to a tracing target.
fn target_for(component: &str) -> String {
    if component.contains("::") {
        component.to_string()
    } else if WATCHER_COMPONENTS.contains(&component) {
        format!("treewatch::watcher::{component}")
    } else {
        format!("treewatch::{component}")
    }
}

/// Build the filter directive string from configuration.
fn directives(config: &LoggingConfig) -> String {
    let mut modules: Vec<_> = config.modules.iter().collect();
    modules.sort();

    let mut filter = config.default.clone();
    for (module, level) in modules {
        filter.push_str(&format!(",{}={level}", target_for(module)));
    }
    filter
}

/// Initialize logging with configuration.
///
/// Safe to call multiple times; only the first call takes effect. Output goes
/// to stderr so event lines on stdout stay machine readable.
pub fn init_with_config(config: &LoggingConfig) {
    INIT.call_once(|| {
        let filter = if std::env::var("RUST_LOG").is_ok() {
            EnvFilter::from_default_env()
        } else {
            EnvFilter::new(directives(config))
        };

        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
            .with_timer(CompactTime)
            .with_level(true)
            .with_filter(filter);

        tracing_subscriber::registry().with(fmt_layer).init();
    });
}

/// Initialize logging with default configuration (`warn`).
pub fn init() {
    init_with_config(&LoggingConfig::default());
}

/// Log an event for a component.
///
/// # Examples
/// ```ignore
/// log_event!("registry", "started", "{}", path.display());
/// log_event!("watcher", "disposed");
/// ```
#[macro_export]
macro_rules! log_event {
    ($component:expr, $event:expr) => {
        tracing::info!("[{}] {}", $component, $event)
    };
    ($component:expr, $event:expr, $($arg:tt)*) => {
        tracing::info!("[{}] {}: {}", $component, $event, format!($($arg)*))
    };
}

/// Debug-level event logging.
///
/// # Examples
/// ```ignore
/// debug_event!("registry", "attached", "{}", dir.display());
/// ```
#[macro_export]
macro_rules! debug_event {
    ($component:expr, $event:expr) => {
        tracing::debug!("[{}] {}", $component, $event)
    };
    ($component:expr, $event:expr, $($arg:tt)*) => {
        tracing::debug!("[{}] {}: {}", $component, $event, format!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_component_targets() {
        assert_eq!(target_for("registry"), "treewatch::watcher::registry");
        assert_eq!(target_for("cli"), "treewatch::cli");
        assert_eq!(target_for("bridge"), "treewatch::bridge");
        assert_eq!(target_for("notify::inotify"), "notify::inotify");

        // Modules without log output are not short names
        assert_eq!(target_for("event"), "treewatch::event");
    }

    #[test]
    fn test_directives() {
        let mut config = LoggingConfig::default();
        assert_eq!(directives(&config), "warn");

        config.default = "info".to_string();
        config.modules.insert("router".to_string(), "trace".to_string());
        config.modules.insert("cli".to_string(), "debug".to_string());
        assert_eq!(
            directives(&config),
            "info,treewatch::cli=debug,treewatch::watcher::router=trace"
        );
    }
}
