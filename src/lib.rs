//! Recursive filesystem change notification built from single-directory
//! watches.
//!
//! ```no_run
//! use treewatch::{WatchOptions, WatchService, WatcherConfig};
//!
//! # async fn demo() -> Result<(), treewatch::WatchError> {
//! let service = WatchService::new(&WatcherConfig::default())?;
//! service
//!     .start_watching("/data", WatchOptions::default().recursive(true), |event| {
//!         println!("{} {}", event.event_name, event.source.display());
//!     })
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod bridge;
pub mod cli;
pub mod config;
pub mod logging;
pub mod watcher;

pub use bridge::{MethodCall, MethodResult, Response, WatchBridge};
pub use config::{LoggingConfig, Settings, WatcherConfig};
pub use watcher::{
    EventMask, EventType, WatchError, WatchEvent, WatchOptions, WatchResult, WatchService,
};
