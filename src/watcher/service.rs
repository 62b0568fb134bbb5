//! The watch service: context object through which callers drive watches.
//!
//! A service owns two background threads. The management thread owns the
//! registry and performs every start, stop, subtree walk and attachment. The
//! delivery thread hands filtered events to subscriber callbacks. Callers
//! talk to the management thread through a command queue and await the
//! reply, so `start_watching` reports the real activation outcome.
//!
//! # Callbacks
//!
//! Callbacks run on the delivery thread, one at a time. A callback must not
//! block on `stop_watching` for its own root: stopping waits for the
//! in-flight callback of that root to return. Spawning the stop onto a
//! runtime, or calling [`WatchService::dispose`], is fine.
//!
//! The wait happens on the management thread. While one root's callback is
//! running, stopping or replacing that root holds up every later command,
//! including starts and stops of unrelated roots and subdirectory
//! attachment. Long-running work belongs on another thread or task, with the
//! callback only handing the event over.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Sender, unbounded};
use parking_lot::{Mutex, RwLock};
use tokio::sync::oneshot;

use super::error::{WatchError, WatchResult};
use super::event::{EventMask, WatchEvent};
use super::primitive::{NotifyPrimitive, PrimitiveBackend};
use super::registry::{Command, WatchRegistry};
use super::router::{Router, Subscription};
use crate::config::WatcherConfig;

/// Per-watch options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchOptions {
    pub recursive: bool,
    pub mask: EventMask,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            recursive: false,
            mask: EventMask::ALL_EVENTS,
        }
    }
}

impl WatchOptions {
    pub fn recursive(mut self, recursive: bool) -> Self {
        self.recursive = recursive;
        self
    }

    pub fn mask(mut self, mask: EventMask) -> Self {
        self.mask = mask;
        self
    }
}

impl TryFrom<&WatcherConfig> for WatchOptions {
    type Error = String;

    fn try_from(config: &WatcherConfig) -> Result<Self, Self::Error> {
        Ok(Self {
            recursive: config.recursive,
            mask: config.event_mask()?,
        })
    }
}

/// Context object owning the management and delivery threads.
///
/// Only one callback runs at a time across all roots. See the module docs for
/// what a slow callback holds up.
pub struct WatchService {
    commands: Sender<Command>,
    paths: Arc<RwLock<BTreeSet<PathBuf>>>,
    disposed: AtomicBool,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WatchService {
    /// Create a service backed by OS notifications.
    pub fn new(config: &WatcherConfig) -> WatchResult<Self> {
        Self::with_primitive(config, Arc::new(NotifyPrimitive))
    }

    /// Create a service on top of a custom primitive backend.
    pub fn with_primitive(
        config: &WatcherConfig,
        backend: Arc<dyn PrimitiveBackend>,
    ) -> WatchResult<Self> {
        let (router, delivery) = Router::spawn()?;
        let (tx, rx) = unbounded();

        let registry = WatchRegistry::new(backend, router.clone(), tx.clone(), config.follow_symlinks);
        let paths = registry.paths();

        let manager = match thread::Builder::new()
            .name("treewatch-manager".to_string())
            .spawn(move || registry.run(rx))
        {
            Ok(handle) => handle,
            Err(e) => {
                router.shutdown();
                let _ = delivery.join();
                return Err(WatchError::WorkerFailed {
                    reason: e.to_string(),
                });
            }
        };

        crate::debug_event!("watcher", "service started");
        Ok(Self {
            commands: tx,
            paths,
            disposed: AtomicBool::new(false),
            workers: Mutex::new(vec![manager, delivery]),
        })
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> WatchResult<T> {
        if self.is_disposed() {
            return Err(WatchError::Disposed);
        }
        let (reply, response) = oneshot::channel();
        self.commands
            .send(build(reply))
            .map_err(|_| WatchError::Disposed)?;
        response.await.map_err(|_| WatchError::ChannelClosed)
    }

    /// Start watching `path`, replacing any existing watch on it.
    ///
    /// Resolves once the watch tree is active. The returned path is the
    /// watch's identifier.
    pub async fn start_watching<F>(
        &self,
        path: impl Into<PathBuf>,
        options: WatchOptions,
        on_event: F,
    ) -> WatchResult<PathBuf>
    where
        F: Fn(WatchEvent) + Send + 'static,
    {
        let path = path.into();
        let subscription = Subscription::new(path.clone(), Box::new(on_event));
        self.request(|reply| Command::Start {
            path,
            options,
            subscription,
            reply,
        })
        .await?
    }

    /// Stop the watch on `path`. No events for it are delivered once this
    /// resolves, so it first waits out a callback of that root in progress.
    pub async fn stop_watching(&self, path: impl AsRef<Path>) -> WatchResult<()> {
        let path = path.as_ref().to_path_buf();
        self.request(|reply| Command::Stop { path, reply }).await?
    }

    /// Stop every watch. Returns how many were running.
    pub async fn stop_all(&self) -> WatchResult<usize> {
        self.request(|reply| Command::StopAll { reply }).await
    }

    /// Directories currently covered by the watch on `path`, sorted.
    pub async fn watched_directories(&self, path: impl AsRef<Path>) -> WatchResult<Vec<PathBuf>> {
        let path = path.as_ref().to_path_buf();
        self.request(|reply| Command::Directories { path, reply })
            .await?
    }

    /// Registered root paths, sorted.
    pub fn watched_paths(&self) -> Vec<PathBuf> {
        if self.is_disposed() {
            return Vec::new();
        }
        self.paths.read().iter().cloned().collect()
    }

    pub fn is_watching(&self, path: impl AsRef<Path>) -> bool {
        !self.is_disposed() && self.paths.read().contains(path.as_ref())
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Stop every watch and shut down the background threads.
    ///
    /// Idempotent. When called from a subscriber callback the threads are
    /// told to exit but not joined.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }

        let _ = self.commands.send(Command::Shutdown);

        let workers = std::mem::take(&mut *self.workers.lock());
        let current = thread::current().id();
        if workers.iter().any(|w| w.thread().id() == current) {
            crate::debug_event!("watcher", "dispose requested from a worker thread");
            return;
        }

        for worker in workers {
            let name = worker.thread().name().unwrap_or("worker").to_string();
            if worker.join().is_err() {
                tracing::error!("[watcher] {name} thread panicked");
            }
        }
        crate::log_event!("watcher", "disposed");
    }
}

impl Drop for WatchService {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl std::fmt::Debug for WatchService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchService")
            .field("watched", &self.paths.read().len())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}
