//! Recursive filesystem watcher built from single-directory watches.
//!
//! The OS primitive observes one directory at a time, so a recursive watch is
//! a tree of nodes, one per directory, that grows as subdirectories appear.
//!
//! # Architecture
//!
//! ```text
//! WatchService (caller API, async)
//!   |  commands
//!   v
//! manager thread: WatchRegistry
//!   root path -> WatchNode tree, one PrimitiveWatcher per root
//!     each node: one PrimitiveHandle
//!         |
//!   notification threads: mask, route, request attach/prune
//!         |                         |
//!         v                         v
//!   delivery thread: Router      manager thread
//!     subscriber callbacks
//! ```
//!
//! Events under one root are delivered in the order the primitive produced
//! them. Coverage of newly created subdirectories is eventually consistent;
//! see [`node`] for the attachment window.

mod error;
mod event;
pub mod node;
mod primitive;
mod registry;
mod router;
mod service;

pub use error::{WatchError, WatchResult};
pub use event::{EventMask, EventType, WatchEvent};
pub use node::WatchNode;
pub use primitive::{
    NotifyPrimitive, PrimitiveBackend, PrimitiveHandle, PrimitiveWatcher, RawEvent, RawEventSink,
};
pub use router::{Callback, Subscription};
pub use service::{WatchOptions, WatchService};
